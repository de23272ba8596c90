use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ColorType, GrayImage, ImageFormat, Luma};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::ModelDispatcher;
use crate::image_input::DocumentImage;
use crate::signal::Signal;

/// 单个检测器的输出：负载 (至少包含该信号的分数字段) + 可选热力图
#[derive(Debug, Clone)]
pub struct DetectorOutput {
    pub payload: Value,
    pub heatmap: Option<GrayImage>,
}

/// 取证检测器适配器
///
/// 每个检测器彼此独立、无共享状态，可以以任意顺序、并发地运行。
/// 内部实现是黑盒，随时可以替换为真实模型。
pub trait Detector: Send + Sync {
    fn signal(&self) -> Signal;
    fn analyze(&self, image: &DocumentImage) -> anyhow::Result<DetectorOutput>;
}

// ==========================================
// 1. ELA (Error Level Analysis)
// ==========================================
// 以固定质量重新压缩成 JPEG，比较与原图的差异。
// 被篡改过的区域往往与周围的压缩历史不同，误差会明显偏高。

/// 单像素误差达到该值即视为热点
const ELA_HOTSPOT_LEVEL: u8 = 24;
/// 热点占比 25% 即为满分
const ELA_RATIO_GAIN: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct ElaDetector {
    quality: u8,
}

impl ElaDetector {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Detector for ElaDetector {
    fn signal(&self) -> Signal {
        Signal::Ela
    }

    fn analyze(&self, image: &DocumentImage) -> anyhow::Result<DetectorOutput> {
        let rgb = image.rgb();
        let (w, h) = rgb.dimensions();

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.quality).encode(rgb.as_raw(), w, h, ColorType::Rgb8)?;
        let recompressed = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)?.to_rgb8();

        let errors: Vec<u8> = rgb
            .pixels()
            .zip(recompressed.pixels())
            .map(|(a, b)| (0..3).map(|c| a[c].abs_diff(b[c])).max().unwrap_or(0))
            .collect();

        let total = errors.len().max(1) as f64;
        let max_error = errors.iter().copied().max().unwrap_or(0);
        let mean_error = errors.iter().map(|e| *e as f64).sum::<f64>() / total;
        let hotspots = errors.iter().filter(|e| **e >= ELA_HOTSPOT_LEVEL).count() as f64 / total;

        // 误差放大到 0..255 方便肉眼查看
        let gain = 255.0 / max_error.max(1) as f32;
        let heatmap = GrayImage::from_fn(w, h, |x, y| {
            let e = errors[(y * w + x) as usize] as f32;
            Luma([(e * gain).min(255.0) as u8])
        });

        Ok(DetectorOutput {
            payload: json!({
                "ela_score": hotspots * ELA_RATIO_GAIN,
                "mean_error": mean_error,
                "max_error": max_error,
                "quality": self.quality,
            }),
            heatmap: Some(heatmap),
        })
    }
}

// ==========================================
// 2. Copy-Move (区域复制) 检测
// ==========================================
// 在缩小后的灰度图上按 8x8 网格切块，跳过平坦块 (纸张背景)，
// 对量化后的像素做 blake3 哈希；同一内容出现在相隔两个块以上的位置即视为复制。
// 只能发现与网格对齐的复制，属于粗筛。

const BLOCK: u32 = 8;
const COPYMOVE_MAX_SIDE: u32 = 512;
const MIN_BLOCK_STDDEV: f64 = 4.0;
const MIN_OFFSET_BLOCKS: u32 = 2;
const COPYMOVE_RATIO_GAIN: f64 = 4.0;

#[derive(Debug, Clone, Default)]
pub struct CopyMoveDetector;

impl Detector for CopyMoveDetector {
    fn signal(&self) -> Signal {
        Signal::Copymove
    }

    fn analyze(&self, image: &DocumentImage) -> anyhow::Result<DetectorOutput> {
        let mut gray = imageops::grayscale(image.rgb());
        let (w, h) = gray.dimensions();
        if w.max(h) > COPYMOVE_MAX_SIDE {
            let ratio = COPYMOVE_MAX_SIDE as f64 / w.max(h) as f64;
            let nw = ((w as f64 * ratio).round() as u32).max(1);
            let nh = ((h as f64 * ratio).round() as u32).max(1);
            gray = imageops::resize(&gray, nw, nh, FilterType::Triangle);
        }
        let (w, h) = gray.dimensions();

        let mut groups: HashMap<[u8; 32], Vec<(u32, u32)>> = HashMap::new();
        let mut textured = 0_usize;
        let mut block = Vec::with_capacity((BLOCK * BLOCK) as usize);

        for by in 0..h / BLOCK {
            for bx in 0..w / BLOCK {
                block.clear();
                for y in 0..BLOCK {
                    for x in 0..BLOCK {
                        block.push(gray.get_pixel(bx * BLOCK + x, by * BLOCK + y)[0]);
                    }
                }

                let n = block.len() as f64;
                let mean = block.iter().map(|v| *v as f64).sum::<f64>() / n;
                let var = block.iter().map(|v| (*v as f64 - mean).powi(2)).sum::<f64>() / n;
                if var.sqrt() < MIN_BLOCK_STDDEV {
                    continue;
                }
                textured += 1;

                // 量化掉最低两位，容忍轻微噪声
                let quantized: Vec<u8> = block.iter().map(|v| v >> 2).collect();
                groups
                    .entry(*blake3::hash(&quantized).as_bytes())
                    .or_default()
                    .push((bx, by));
            }
        }

        let mut duplicated: Vec<(u32, u32)> = Vec::new();
        for members in groups.values().filter(|m| m.len() > 1) {
            for &(ax, ay) in members {
                let far_twin = members.iter().any(|&(bx, by)| {
                    ax.abs_diff(bx).max(ay.abs_diff(by)) >= MIN_OFFSET_BLOCKS
                });
                if far_twin {
                    duplicated.push((ax, ay));
                }
            }
        }

        let ratio = if textured == 0 {
            0.0
        } else {
            duplicated.len() as f64 / textured as f64
        };

        let mut heatmap = GrayImage::new(w, h);
        for &(bx, by) in &duplicated {
            for y in 0..BLOCK {
                for x in 0..BLOCK {
                    heatmap.put_pixel(bx * BLOCK + x, by * BLOCK + y, Luma([255]));
                }
            }
        }

        Ok(DetectorOutput {
            payload: json!({
                "copy_move_score": ratio * COPYMOVE_RATIO_GAIN,
                "duplicated_blocks": duplicated.len(),
                "textured_blocks": textured,
            }),
            heatmap: Some(heatmap),
        })
    }
}

// ==========================================
// 3. 基于模型的检测器
// ==========================================
// OCR / FR-DETR / Diffusion / NoisePrint 都走模型分派层，
// 取模型给出的伪造概率写入该信号的分数字段。

pub struct ModelDetector {
    signal: Signal,
    model_id: String,
    dispatcher: Arc<ModelDispatcher>,
}

impl ModelDetector {
    pub fn new(signal: Signal, model_id: impl Into<String>, dispatcher: Arc<ModelDispatcher>) -> Self {
        Self {
            signal,
            model_id: model_id.into(),
            dispatcher,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Detector for ModelDetector {
    fn signal(&self) -> Signal {
        self.signal
    }

    fn analyze(&self, image: &DocumentImage) -> anyhow::Result<DetectorOutput> {
        let output = self.dispatcher.run_on_image(&self.model_id, image, None, None)?;

        let mut payload = serde_json::Map::new();
        payload.insert(self.signal.score_field().to_string(), json!(output.score()));
        payload.insert("model".to_string(), json!(self.model_id));

        let heatmap = match self.signal.spec().heatmap {
            Some(_) => output.to_heatmap(),
            None => None,
        };

        Ok(DetectorOutput {
            payload: Value::Object(payload),
            heatmap,
        })
    }
}

// ==========================================
// 4. 文档专项检查 (仅 PDF)
// ==========================================
pub trait DocumentCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, image: &DocumentImage) -> anyhow::Result<Value>;
}

/// 墨迹阈值 (灰度)
const INK_LEVEL: u8 = 96;
const MIN_SIGNATURE_INK: f64 = 0.002;
const MAX_SIGNATURE_INK: f64 = 0.25;

/// 签名区检查：统计页面下三分之一的墨迹占比
///
/// 占比过低说明签名缺失；过高通常是照片或满版印刷，也不算签名。
#[derive(Debug, Clone, Default)]
pub struct SignatureZoneCheck;

impl DocumentCheck for SignatureZoneCheck {
    fn name(&self) -> &'static str {
        "signature"
    }

    fn check(&self, image: &DocumentImage) -> anyhow::Result<Value> {
        let gray = imageops::grayscale(image.rgb());
        let (w, h) = gray.dimensions();
        let top = h - h / 3;

        let mut ink = 0_u64;
        let mut total = 0_u64;
        for y in top..h {
            for x in 0..w {
                total += 1;
                if gray.get_pixel(x, y)[0] < INK_LEVEL {
                    ink += 1;
                }
            }
        }

        let ratio = if total == 0 { 0.0 } else { ink as f64 / total as f64 };
        Ok(json!({
            "ink_ratio": ratio,
            "signature_present": (MIN_SIGNATURE_INK..=MAX_SIGNATURE_INK).contains(&ratio),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::coerce;
    use image::{Rgb, RgbImage};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noise(w: u32, h: u32, seed: u64) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(seed);
        RgbImage::from_fn(w, h, |_, _| {
            let v: u8 = rng.gen();
            Rgb([v, v, v])
        })
    }

    fn score(out: &DetectorOutput, field: &str) -> f64 {
        coerce(&out.payload[field]).unwrap().unwrap()
    }

    #[test]
    fn ela_flat_page_is_quiet() {
        let page = DocumentImage::from_rgb(RgbImage::from_pixel(64, 64, Rgb([250, 250, 250])));
        let out = ElaDetector::new(95).analyze(&page).unwrap();
        assert!(score(&out, "ela_score") < 0.05);
        assert_eq!(out.heatmap.unwrap().dimensions(), (64, 64));
    }

    #[test]
    fn ela_noisy_page_scores_higher_than_flat() {
        let flat = DocumentImage::from_rgb(RgbImage::from_pixel(64, 64, Rgb([250, 250, 250])));
        let noisy = DocumentImage::from_rgb(noise(64, 64, 7));
        let d = ElaDetector::new(75);
        let a = score(&d.analyze(&flat).unwrap(), "ela_score");
        let b = score(&d.analyze(&noisy).unwrap(), "ela_score");
        assert!(b > a, "{b} <= {a}");
    }

    #[test]
    fn copymove_finds_grid_aligned_clone() {
        let mut img = noise(64, 64, 11);
        // 把左上 16x16 复制到 (40, 40)
        for y in 0..16 {
            for x in 0..16 {
                let p = *img.get_pixel(x, y);
                img.put_pixel(40 + x, 40 + y, p);
            }
        }
        let out = CopyMoveDetector.analyze(&DocumentImage::from_rgb(img)).unwrap();
        assert_eq!(out.payload["duplicated_blocks"], 8);
        assert!(score(&out, "copy_move_score") > 0.0);

        let heatmap = out.heatmap.unwrap();
        assert_eq!(heatmap.get_pixel(0, 0)[0], 255);
        assert_eq!(heatmap.get_pixel(44, 44)[0], 255);
        assert_eq!(heatmap.get_pixel(30, 5)[0], 0);
    }

    #[test]
    fn copymove_ignores_unique_and_flat_content() {
        let out = CopyMoveDetector.analyze(&DocumentImage::from_rgb(noise(64, 64, 3))).unwrap();
        assert_eq!(score(&out, "copy_move_score"), 0.0);

        let blank = DocumentImage::from_rgb(RgbImage::from_pixel(64, 64, Rgb([255, 255, 255])));
        let out = CopyMoveDetector.analyze(&blank).unwrap();
        assert_eq!(out.payload["textured_blocks"], 0);
        assert_eq!(score(&out, "copy_move_score"), 0.0);
    }

    #[test]
    fn signature_zone() {
        let mut page = RgbImage::from_pixel(100, 90, Rgb([255, 255, 255]));
        for x in 60..90 {
            page.put_pixel(x, 80, Rgb([10, 10, 10]));
        }
        let signed = SignatureZoneCheck.check(&DocumentImage::from_rgb(page)).unwrap();
        assert_eq!(signed["signature_present"], true);

        let blank = RgbImage::from_pixel(100, 90, Rgb([255, 255, 255]));
        let unsigned = SignatureZoneCheck.check(&DocumentImage::from_rgb(blank)).unwrap();
        assert_eq!(unsigned["signature_present"], false);
        assert_eq!(unsigned["ink_ratio"], 0.0);
    }
}
