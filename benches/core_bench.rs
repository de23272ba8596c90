use criterion::{criterion_group, criterion_main, Criterion};
use image::{Rgb, RgbImage};
use serde_json::json;
use verifdoc_core::detectors::{CopyMoveDetector, Detector, ElaDetector};
use verifdoc_core::fingerprint;
use verifdoc_core::image_input::DocumentImage;
use verifdoc_core::ledger::IntegrityLedger;
use verifdoc_core::record::ReportSeal;
use verifdoc_core::signal::RawDetectorResults;
use verifdoc_core::FusionEngine;

// 合成一张带纹理的"文档"，避免依赖磁盘上的样本文件
fn sample_document() -> DocumentImage {
    let img = RgbImage::from_fn(640, 480, |x, y| {
        let v = ((x * 7 + y * 13) % 251) as u8;
        Rgb([v, v.wrapping_add(40), 255 - v])
    });
    DocumentImage::from_rgb(img)
}

fn bench_fuse(c: &mut Criterion) {
    let engine = FusionEngine::default();
    let raw: RawDetectorResults = serde_json::from_value(json!({
        "ocr": { "score": 0.1 },
        "frdetr": { "score": 0.9 },
        "diffusion": { "score": 0.0 },
        "noiseprint": { "ai_score": 0.2 },
        "ela": { "ela_score": 0.1 },
        "copymove": { "copy_move_score": 0.0 },
    }))
    .unwrap();

    c.bench_function("fusion_fuse", |b| b.iter(|| engine.fuse(&raw).unwrap()));
}

fn bench_fingerprint(c: &mut Criterion) {
    let doc = sample_document();
    c.bench_function("fingerprint_generation", |b| b.iter(|| fingerprint::fingerprint(&doc)));
}

fn bench_detectors(c: &mut Criterion) {
    let doc = sample_document();
    let ela = ElaDetector::new(95);
    c.bench_function("ela_detector", |b| b.iter(|| ela.analyze(&doc).unwrap()));
    c.bench_function("copy_move_detector", |b| b.iter(|| CopyMoveDetector.analyze(&doc).unwrap()));
}

fn bench_ledger_append(c: &mut Criterion) {
    let mut ledger = IntegrityLedger::new();
    let seal = ReportSeal {
        record_id: "bench".to_string(),
        filename: "bench.png".to_string(),
        report_sha256: "00".repeat(32),
        sealed_at: 1_700_000_000,
    };

    c.bench_function("ledger_append_seal", |b| {
        b.iter(|| {
            // 同一张封条重复追加，MMR 照单全收
            ledger.append(&seal).unwrap();
        })
    });
}

criterion_group!(benches, bench_fuse, bench_fingerprint, bench_detectors, bench_ledger_append);
criterion_main!(benches);
