use chrono::Utc;
use image::ImageOutputFormat;
use serde::Serialize;
use std::collections::BTreeSet;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{ForensicError, Result};
use crate::fingerprint::sha256_hex;
use crate::record::AnalysisRecord;
use crate::signal::{HeatmapKind, HeatmapSet, Signal};

/// 模块：报告生成 (Report Integrity Stage)
///
/// 产物是一个 ZIP 包：
/// - `report.html`   人工阅读的报告
/// - `report.json`   结构化内容，便于机器比对
/// - `heatmaps/*.png` 可用的热力图
///
/// 热力图缺失只会变成报告里的一行提示，永远不会让生成失败。

/// 报告产物
#[derive(Debug, Clone)]
pub struct ReportArtifact {
    pub location: PathBuf,
    pub bytes: Vec<u8>,
    /// 产物字节的 SHA256 (Hex)
    pub sha256: String,
}

/// 产物内容摘要 (小写十六进制 SHA256)
pub fn content_digest(bytes: &[u8]) -> String {
    sha256_hex(bytes)
}

// ==========================================
// 报告内容模型
// ==========================================
#[derive(Debug, Serialize)]
struct ReportDocument<'a> {
    project: &'a str,
    record_id: &'a str,
    filename: &'a str,
    analyzed_at: String,
    forgery_score: u32,
    risk_level: &'static str,
    summary: &'a str,
    signals: Vec<SignalLine<'a>>,
    heatmaps: Vec<HeatmapLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    document_checks: Option<&'a serde_json::Value>,
    sha256: &'a str,
    phash: &'a str,
    /// 唯一允许在两次生成之间变化的字段
    generated_at: String,
}

#[derive(Debug, Serialize)]
struct SignalLine<'a> {
    key: &'static str,
    label: &'static str,
    score: f64,
    percent: String,
    explanation: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum HeatmapStatus {
    Embedded { entry: String },
    NotFound { notice: String },
    NotGenerated { notice: String },
    Unreadable { notice: String },
}

#[derive(Debug, Serialize)]
struct HeatmapLine {
    category: String,
    #[serde(flatten)]
    status: HeatmapStatus,
}

// ==========================================
// 报告生成器
// ==========================================
pub struct ReportGenerator {
    report_dir: PathBuf,
    heatmap_dir: PathBuf,
    project_name: String,
}

impl ReportGenerator {
    pub fn new(report_dir: impl Into<PathBuf>, heatmap_dir: impl Into<PathBuf>, project_name: impl Into<String>) -> Self {
        Self {
            report_dir: report_dir.into(),
            heatmap_dir: heatmap_dir.into(),
            project_name: project_name.into(),
        }
    }

    /// 生成报告，写入报告目录，同时返回字节与摘要
    ///
    /// 阻塞 I/O：异步上下文中请放到 `spawn_blocking` 里调用。
    pub fn generate(&self, record: &AnalysisRecord, heatmaps: &HeatmapSet) -> Result<ReportArtifact> {
        let now = Utc::now();

        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        // 固定条目时间戳，结构相同的输入得到结构相同的包
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default());

        // 1. 热力图：先决定每个类别的去向，可用的直接写进包里
        let mut lines = Vec::new();
        let mut entries = BTreeSet::new();
        for category in heatmap_categories(heatmaps) {
            let status = match heatmaps.get(&category).and_then(|p| p.as_deref()) {
                None => HeatmapStatus::NotGenerated {
                    notice: format!("Heatmap {category} not generated."),
                },
                Some(reference) => match self.resolve_heatmap(reference) {
                    None => {
                        tracing::warn!(category = %category, reference, "⚠️ 热力图文件不存在");
                        HeatmapStatus::NotFound {
                            notice: format!("Heatmap {category} not found on the server."),
                        }
                    }
                    Some(path) => match load_png(&path) {
                        Ok(png) => {
                            // 类别名来自调用方，只保留安全字符作为包内条目名，撞名时追加序号
                            let entry = entry_name(&category, &entries);
                            entries.insert(entry.clone());
                            zip.start_file(entry.as_str(), options).map_err(zip_error)?;
                            zip.write_all(&png)?;
                            HeatmapStatus::Embedded { entry }
                        }
                        Err(e) => {
                            tracing::warn!(category = %category, error = %e, "⚠️ 热力图无法读取");
                            HeatmapStatus::Unreadable {
                                notice: format!("Heatmap {category} could not be loaded: {e}"),
                            }
                        }
                    },
                },
            };
            lines.push(HeatmapLine { category, status });
        }

        // 2. 结构化内容
        let verdict = &record.full_result;
        let signals = Signal::ALL
            .iter()
            .map(|signal| {
                let spec = signal.spec();
                let score = verdict.module_score(*signal);
                SignalLine {
                    key: spec.key,
                    label: spec.label,
                    score,
                    percent: format!("{:.1}%", score * 100.0),
                    explanation: verdict
                        .explanation
                        .get(spec.explanation_key)
                        .map(String::as_str)
                        .unwrap_or("N/A"),
                }
            })
            .collect();

        let document = ReportDocument {
            project: &self.project_name,
            record_id: &record.id,
            filename: &record.filename,
            analyzed_at: record.created_at.to_rfc3339(),
            forgery_score: record.forgery_score,
            risk_level: record.risk_level.as_str(),
            summary: verdict.summary(),
            signals,
            heatmaps: lines,
            document_checks: record.document_checks.as_ref(),
            sha256: &record.fingerprint.sha256,
            phash: &record.fingerprint.phash,
            generated_at: now.to_rfc3339(),
        };

        let json = serde_json::to_vec_pretty(&document).map_err(|e| ForensicError::Report(e.to_string()))?;
        zip.start_file("report.json", options).map_err(zip_error)?;
        zip.write_all(&json)?;

        zip.start_file("report.html", options).map_err(zip_error)?;
        zip.write_all(render_html(&document).as_bytes())?;

        let bytes = zip.finish().map_err(zip_error)?.into_inner();

        // 3. 落盘
        std::fs::create_dir_all(&self.report_dir)?;
        let location = self.report_dir.join(format!(
            "verifdoc_report_{}_{}.zip",
            file_token(&record.id),
            now.format("%Y%m%d%H%M%S")
        ));
        std::fs::write(&location, &bytes)?;

        let sha256 = content_digest(&bytes);
        tracing::info!(record = %record.id, path = %location.display(), sha256 = %sha256, "📄 报告已生成");

        Ok(ReportArtifact { location, bytes, sha256 })
    }

    /// 引用路径存在就直接使用，否则退回到热力图目录下的同名文件
    fn resolve_heatmap(&self, reference: &str) -> Option<PathBuf> {
        let direct = Path::new(reference);
        if direct.is_file() {
            return Some(direct.to_path_buf());
        }
        let fallback = self.heatmap_dir.join(direct.file_name()?);
        fallback.is_file().then_some(fallback)
    }
}

/// 四个标准类别永远出现，其他额外类别按字典序跟在后面
fn heatmap_categories(heatmaps: &HeatmapSet) -> Vec<String> {
    let mut categories: Vec<String> = HeatmapKind::ALL.iter().map(|k| k.key().to_string()).collect();
    for key in heatmaps.keys() {
        if !categories.contains(key) {
            categories.push(key.clone());
        }
    }
    categories
}

/// 读取热力图并统一重新编码为 PNG
fn load_png(path: &Path) -> anyhow::Result<Vec<u8>> {
    let img = image::open(path)?;
    let mut out = Vec::new();
    img.write_to(&mut out, ImageOutputFormat::Png)?;
    Ok(out)
}

fn zip_error(e: zip::result::ZipError) -> ForensicError {
    ForensicError::Report(format!("zip: {e}"))
}

fn file_token(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn entry_name(category: &str, taken: &BTreeSet<String>) -> String {
    let token = file_token(category);
    let mut entry = format!("heatmaps/{token}.png");
    let mut n = 1;
    while taken.contains(&entry) {
        n += 1;
        entry = format!("heatmaps/{token}_{n}.png");
    }
    entry
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_html(doc: &ReportDocument<'_>) -> String {
    let mut html = String::new();
    let project = escape(doc.project);

    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str(&format!("<title>{project} forensic report</title>\n</head>\n<body>\n"));
    html.push_str(&format!("<h1>{project} forensic analysis report</h1>\n"));

    html.push_str("<section id=\"record\">\n");
    html.push_str(&format!("<p><b>Analysis ID:</b> {}</p>\n", escape(doc.record_id)));
    html.push_str(&format!("<p><b>File name:</b> {}</p>\n", escape(doc.filename)));
    html.push_str(&format!("<p><b>Analysis date:</b> {}</p>\n", doc.analyzed_at));
    html.push_str(&format!("<p><b>SHA-256:</b> <code>{}</code></p>\n", escape(doc.sha256)));
    html.push_str("</section>\n");

    html.push_str("<section id=\"verdict\">\n");
    html.push_str(&format!("<p><b>Global forgery score:</b> {}%</p>\n", doc.forgery_score));
    html.push_str(&format!("<p><b>Risk level:</b> {}</p>\n", doc.risk_level));
    html.push_str(&format!("<p><b>Interpretation:</b> {}</p>\n", escape(doc.summary)));
    html.push_str("</section>\n");

    html.push_str("<section id=\"signals\">\n<h2>Detector details</h2>\n<ul>\n");
    for line in &doc.signals {
        html.push_str(&format!(
            "<li><b>{}:</b> {} - {}</li>\n",
            escape(line.label),
            line.percent,
            escape(line.explanation)
        ));
    }
    html.push_str("</ul>\n</section>\n");

    html.push_str("<section id=\"heatmaps\">\n<h2>Forensic heatmaps</h2>\n");
    html.push_str("<p>These heatmaps highlight the regions detected as potentially manipulated.</p>\n");
    for line in &doc.heatmaps {
        let category = escape(&line.category);
        match &line.status {
            HeatmapStatus::Embedded { entry } => html.push_str(&format!(
                "<figure><figcaption><b>{category} heatmap</b></figcaption><img src=\"{}\" alt=\"{category}\"></figure>\n",
                escape(entry)
            )),
            HeatmapStatus::NotFound { notice }
            | HeatmapStatus::NotGenerated { notice }
            | HeatmapStatus::Unreadable { notice } => {
                html.push_str(&format!("<p><i>{}</i></p>\n", escape(notice)))
            }
        }
    }
    html.push_str("</section>\n");

    html.push_str("<section id=\"conclusion\">\n<h2>Conclusion</h2>\n");
    html.push_str(&format!(
        "<p>This report was generated automatically by {project} from multi-layer forensic analyses.</p>\n"
    ));
    html.push_str(&format!("<p>Report generated at: {}</p>\n", doc.generated_at));
    html.push_str(&format!("<p><b>Signature:</b> {project}</p>\n"));
    html.push_str("</section>\n</body>\n</html>\n");
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::ImageFingerprint;
    use crate::fusion::FusionEngine;
    use chrono::TimeZone;
    use image::{GrayImage, Luma};
    use serde_json::{json, Value};
    use std::io::Read;
    use zip::ZipArchive;

    fn record() -> AnalysisRecord {
        let raw = serde_json::from_value(json!({
            "frdetr": { "score": 0.9 },
            "ela": { "ela_score": 0.1 },
        }))
        .unwrap();
        let verdict = FusionEngine::default().fuse(&raw).unwrap();
        AnalysisRecord {
            id: "rec-7".into(),
            filename: "<invoice>.png".into(),
            forgery_score: verdict.forgery_score,
            risk_level: verdict.risk_level,
            full_result: verdict,
            heatmaps: HeatmapSet::new(),
            document_checks: None,
            fingerprint: ImageFingerprint {
                sha256: "ab".repeat(32),
                phash: "phash".into(),
            },
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    fn entry(bytes: &[u8], name: &str) -> Option<Vec<u8>> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut file = archive.by_name(name).ok()?;
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        Some(out)
    }

    fn report_json(bytes: &[u8]) -> Value {
        serde_json::from_slice(&entry(bytes, "report.json").unwrap()).unwrap()
    }

    #[test]
    fn missing_heatmaps_degrade_to_notices() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ReportGenerator::new(dir.path().join("reports"), dir.path().join("heatmaps"), "VerifDoc");

        let mut heatmaps = HeatmapSet::new();
        heatmaps.insert("compression".into(), Some("/nonexistent/compression_x.png".into()));
        heatmaps.insert("duplication".into(), None);

        let artifact = generator.generate(&record(), &heatmaps).unwrap();
        let html = String::from_utf8(entry(&artifact.bytes, "report.html").unwrap()).unwrap();

        assert!(html.contains("Heatmap compression not found on the server."));
        assert!(html.contains("Heatmap duplication not generated."));
        // 没有出现在集合里的标准类别同样给出提示
        assert!(html.contains("Heatmap ai-noise not generated."));
        assert!(html.contains("Heatmap generative-inpainting not generated."));
        assert!(entry(&artifact.bytes, "heatmaps/compression.png").is_none());

        assert!(html.contains("&lt;invoice&gt;.png"));
        assert!(html.contains("Global forgery score:</b> 28%"));
        assert!(html.contains("FR-DETR"));
    }

    #[test]
    fn existing_heatmaps_are_embedded_with_basename_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let heatmap_dir = dir.path().join("heatmaps");
        std::fs::create_dir_all(&heatmap_dir).unwrap();
        GrayImage::from_pixel(8, 8, Luma([255]))
            .save(heatmap_dir.join("compression_abc.png"))
            .unwrap();
        GrayImage::from_pixel(8, 8, Luma([10]))
            .save(heatmap_dir.join("custom_abc.png"))
            .unwrap();

        let mut heatmaps = HeatmapSet::new();
        // 引用的是一个 URL 风格的路径，只有文件名能对上
        heatmaps.insert("compression".into(), Some("/static/heatmaps/compression_abc.png".into()));
        heatmaps.insert(
            "custom".into(),
            Some(heatmap_dir.join("custom_abc.png").to_string_lossy().into_owned()),
        );

        let generator = ReportGenerator::new(dir.path().join("reports"), &heatmap_dir, "VerifDoc");
        let artifact = generator.generate(&record(), &heatmaps).unwrap();

        let png = entry(&artifact.bytes, "heatmaps/compression.png").unwrap();
        assert!(image::load_from_memory(&png).is_ok());
        assert!(entry(&artifact.bytes, "heatmaps/custom.png").is_some());

        let doc = report_json(&artifact.bytes);
        let categories: Vec<_> = doc["heatmaps"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| h["category"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            categories,
            vec!["compression", "ai-noise", "duplication", "generative-inpainting", "custom"]
        );
        assert_eq!(doc["heatmaps"][0]["status"], "embedded");
    }

    #[test]
    fn category_names_cannot_escape_the_heatmap_folder() {
        let dir = tempfile::tempdir().unwrap();
        let heatmap_dir = dir.path().join("heatmaps");
        std::fs::create_dir_all(&heatmap_dir).unwrap();
        let png = heatmap_dir.join("evil.png");
        GrayImage::from_pixel(4, 4, Luma([128])).save(&png).unwrap();

        let reference = Some(png.to_string_lossy().into_owned());
        let mut heatmaps = HeatmapSet::new();
        heatmaps.insert("../../evil".into(), reference.clone());
        heatmaps.insert("______evil".into(), reference);

        let generator = ReportGenerator::new(dir.path().join("reports"), &heatmap_dir, "VerifDoc");
        let artifact = generator.generate(&record(), &heatmaps).unwrap();

        let archive = ZipArchive::new(Cursor::new(artifact.bytes.as_slice())).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert!(names.iter().all(|n| !n.contains("..")), "{names:?}");
        assert!(names.contains(&"heatmaps/______evil.png".to_string()), "{names:?}");
        assert!(names.contains(&"heatmaps/______evil_2.png".to_string()), "{names:?}");

        let doc = report_json(&artifact.bytes);
        let evil = doc["heatmaps"]
            .as_array()
            .unwrap()
            .iter()
            .find(|h| h["category"] == "../../evil")
            .unwrap();
        assert_eq!(evil["status"], "embedded");
    }

    #[test]
    fn artifact_is_written_and_digested() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ReportGenerator::new(dir.path(), dir.path(), "VerifDoc");
        let artifact = generator.generate(&record(), &HeatmapSet::new()).unwrap();

        let name = artifact.location.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("verifdoc_report_rec-7_"), "{name}");
        assert!(name.ends_with(".zip"));
        assert_eq!(std::fs::read(&artifact.location).unwrap(), artifact.bytes);
        assert_eq!(artifact.sha256, content_digest(&artifact.bytes));
        assert_eq!(artifact.sha256.len(), 64);
    }

    #[test]
    fn structural_content_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ReportGenerator::new(dir.path(), dir.path(), "VerifDoc");
        let heatmaps = HeatmapSet::new();

        let mut first = report_json(&generator.generate(&record(), &heatmaps).unwrap().bytes);
        let mut second = report_json(&generator.generate(&record(), &heatmaps).unwrap().bytes);
        first.as_object_mut().unwrap().remove("generated_at");
        second.as_object_mut().unwrap().remove("generated_at");
        assert_eq!(first, second);

        assert_eq!(first["analyzed_at"], "2024-05-01T12:00:00+00:00");
        assert_eq!(first["signals"][1]["percent"], "90.0%");
        assert_eq!(first["signals"][1]["explanation"], "Altered regions detected");
        assert_eq!(first["risk_level"], "Low");
    }
}
