//! 推理前后处理：缩放、归一化、布局转换、输出解读。

use anyhow::{anyhow, bail, ensure};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};

use crate::registry::OutputMode;

/// 张量布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// (Batch, Channels, Height, Width)，PyTorch 家族
    Nchw,
    /// (Batch, Height, Width, Channels)，Keras 家族
    Nhwc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> anyhow::Result<Self> {
        let expected: usize = shape.iter().product();
        ensure!(
            expected == data.len(),
            "shape {:?} needs {} values, got {}",
            shape,
            expected,
            data.len()
        );
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

// ==========================================
// 1. 预处理参数
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessParams {
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub scale: f32,
}

/// 调用方提供的覆盖项，未给出的字段沿用家族默认值
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessOverrides {
    pub mean: Option<[f32; 3]>,
    pub std: Option<[f32; 3]>,
    pub scale: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PostprocessOverrides {
    /// 设置后，稠密图被二值化 (>= threshold 为 1)
    pub threshold: Option<f32>,
}

impl PreprocessParams {
    pub fn overlay(self, overrides: Option<&PreprocessOverrides>) -> Self {
        match overrides {
            None => self,
            Some(o) => Self {
                mean: o.mean.unwrap_or(self.mean),
                std: o.std.unwrap_or(self.std),
                scale: o.scale.unwrap_or(self.scale),
            },
        }
    }
}

/// 缩放到 (width, height) 并按通道归一化，输出 HWC 排列的浮点缓冲区
pub fn preprocess(image: &RgbImage, width: u32, height: u32, params: &PreprocessParams) -> Vec<f32> {
    let resized = imageops::resize(image, width, height, FilterType::Lanczos3);
    let mut out = Vec::with_capacity(width as usize * height as usize * 3);
    for pixel in resized.pixels() {
        for c in 0..3 {
            let v = pixel[c] as f32 / params.scale;
            out.push((v - params.mean[c]) / params.std[c]);
        }
    }
    out
}

/// 把 HWC 缓冲区转换成目标家族需要的带 batch 维度的张量
pub fn to_layout(hwc: Vec<f32>, width: u32, height: u32, layout: TensorLayout) -> anyhow::Result<Tensor> {
    let (w, h) = (width as usize, height as usize);
    match layout {
        TensorLayout::Nhwc => Tensor::new(vec![1, h, w, 3], hwc),
        TensorLayout::Nchw => {
            ensure!(hwc.len() == w * h * 3, "buffer does not match {}x{}x3", w, h);
            let plane = w * h;
            let mut chw = vec![0.0_f32; hwc.len()];
            for i in 0..plane {
                for c in 0..3 {
                    chw[c * plane + i] = hwc[i * 3 + c];
                }
            }
            Tensor::new(vec![1, 3, h, w], chw)
        }
    }
}

// ==========================================
// 2. 后处理
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ProcessedOutput {
    Classification {
        probabilities: Vec<f32>,
        predicted_class: usize,
        /// 最后一个类别视为"伪造"
        forgery_probability: f32,
    },
    DenseMap {
        width: usize,
        height: usize,
        values: Vec<f32>,
    },
}

impl ProcessedOutput {
    /// 单一数值：分类取伪造概率，稠密图取均值
    pub fn score(&self) -> f64 {
        match self {
            ProcessedOutput::Classification { forgery_probability, .. } => *forgery_probability as f64,
            ProcessedOutput::DenseMap { values, .. } => {
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().map(|v| *v as f64).sum::<f64>() / values.len() as f64
                }
            }
        }
    }

    /// 稠密图渲染为灰度热力图；分类输出没有空间信息
    pub fn to_heatmap(&self) -> Option<GrayImage> {
        match self {
            ProcessedOutput::Classification { .. } => None,
            ProcessedOutput::DenseMap { width, height, values } => {
                let (w, h) = (*width as u32, *height as u32);
                if w == 0 || h == 0 {
                    return None;
                }
                Some(GrayImage::from_fn(w, h, |x, y| {
                    let v = values[(y * w + x) as usize].clamp(0.0, 1.0);
                    Luma([(v * 255.0).round() as u8])
                }))
            }
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub fn postprocess(
    raw: &Tensor,
    mode: OutputMode,
    layout: TensorLayout,
    overrides: Option<&PostprocessOverrides>,
) -> anyhow::Result<ProcessedOutput> {
    match mode {
        OutputMode::Classification => {
            let logits = raw.data();
            ensure!(!logits.is_empty(), "classification output is empty");
            ensure!(
                logits.iter().all(|l| l.is_finite()),
                "classification output contains non-finite logits"
            );

            let probabilities = if logits.len() == 1 {
                let p = sigmoid(logits[0]);
                vec![1.0 - p, p]
            } else {
                softmax(logits)
            };
            let predicted_class = probabilities
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .ok_or_else(|| anyhow!("no class probabilities"))?;
            let forgery_probability = *probabilities
                .last()
                .ok_or_else(|| anyhow!("no class probabilities"))?;

            Ok(ProcessedOutput::Classification {
                probabilities,
                predicted_class,
                forgery_probability,
            })
        }
        OutputMode::DenseMap => {
            let shape = raw.shape();
            if shape.len() != 4 {
                bail!("dense map output must be 4-D, got shape {:?}", shape);
            }
            let (k, h, w) = match layout {
                TensorLayout::Nchw => (shape[1], shape[2], shape[3]),
                TensorLayout::Nhwc => (shape[3], shape[1], shape[2]),
            };
            ensure!(k >= 1, "dense map output has no channels");

            let data = raw.data();
            let plane = h * w;
            let threshold = overrides.and_then(|o| o.threshold);
            let values = (0..plane)
                .map(|i| match layout {
                    TensorLayout::Nchw => data[(k - 1) * plane + i],
                    TensorLayout::Nhwc => data[i * k + (k - 1)],
                })
                .map(sigmoid)
                .map(|p| match threshold {
                    Some(t) if p >= t => 1.0,
                    Some(_) => 0.0,
                    None => p,
                })
                .collect();

            Ok(ProcessedOutput::DenseMap { width: w, height: h, values })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn neutral() -> PreprocessParams {
        PreprocessParams { mean: [0.0; 3], std: [1.0; 3], scale: 255.0 }
    }

    #[test]
    fn overlay_only_replaces_given_fields() {
        let base = PreprocessParams { mean: [0.5; 3], std: [0.2; 3], scale: 255.0 };
        let merged = base.overlay(Some(&PreprocessOverrides {
            scale: Some(1.0),
            ..Default::default()
        }));
        assert_eq!(merged.mean, [0.5; 3]);
        assert_eq!(merged.std, [0.2; 3]);
        assert_eq!(merged.scale, 1.0);
        assert_eq!(base.overlay(None), base);
    }

    #[test]
    fn preprocess_resizes_and_normalizes() {
        let img = RgbImage::from_pixel(10, 6, Rgb([255, 0, 51]));
        let buf = preprocess(&img, 4, 2, &neutral());
        assert_eq!(buf.len(), 4 * 2 * 3);
        assert!((buf[0] - 1.0).abs() < 1e-2);
        assert!(buf[1].abs() < 1e-2);
        assert!((buf[2] - 0.2).abs() < 1e-2);
    }

    #[test]
    fn layout_conversion() {
        // 2x1 图像：像素0 = (1,2,3)，像素1 = (4,5,6)
        let hwc = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

        let nhwc = to_layout(hwc.clone(), 2, 1, TensorLayout::Nhwc).unwrap();
        assert_eq!(nhwc.shape(), &[1, 1, 2, 3]);
        assert_eq!(nhwc.data(), hwc.as_slice());

        let nchw = to_layout(hwc, 2, 1, TensorLayout::Nchw).unwrap();
        assert_eq!(nchw.shape(), &[1, 3, 1, 2]);
        assert_eq!(nchw.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn tensor_shape_must_match_data() {
        assert!(Tensor::new(vec![1, 2], vec![0.0]).is_err());
    }

    #[test]
    fn classification_softmax_and_sigmoid() {
        let two = Tensor::new(vec![1, 2], vec![0.0, 0.0]).unwrap();
        let out = postprocess(&two, OutputMode::Classification, TensorLayout::Nchw, None).unwrap();
        assert!((out.score() - 0.5).abs() < 1e-6);

        let one = Tensor::new(vec![1, 1], vec![10.0]).unwrap();
        match postprocess(&one, OutputMode::Classification, TensorLayout::Nhwc, None).unwrap() {
            ProcessedOutput::Classification { probabilities, predicted_class, forgery_probability } => {
                assert_eq!(probabilities.len(), 2);
                assert_eq!(predicted_class, 1);
                assert!(forgery_probability > 0.99);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dense_map_reads_last_channel_per_layout() {
        // 2 个通道，1x2 像素；最后一个通道的 logit 为 0 → sigmoid 0.5，另一个为 100
        let nchw = Tensor::new(vec![1, 2, 1, 2], vec![100.0, 100.0, 0.0, 0.0]).unwrap();
        let nhwc = Tensor::new(vec![1, 1, 2, 2], vec![100.0, 0.0, 100.0, 0.0]).unwrap();

        for (raw, layout) in [(nchw, TensorLayout::Nchw), (nhwc, TensorLayout::Nhwc)] {
            let out = postprocess(&raw, OutputMode::DenseMap, layout, None).unwrap();
            assert!((out.score() - 0.5).abs() < 1e-6, "{layout:?}");
            let heatmap = out.to_heatmap().unwrap();
            assert_eq!(heatmap.dimensions(), (2, 1));
        }
    }

    #[test]
    fn threshold_binarizes_dense_map() {
        let raw = Tensor::new(vec![1, 1, 1, 2], vec![-5.0, 5.0]).unwrap();
        let post = PostprocessOverrides { threshold: Some(0.7) };
        match postprocess(&raw, OutputMode::DenseMap, TensorLayout::Nchw, Some(&post)).unwrap() {
            ProcessedOutput::DenseMap { values, .. } => assert_eq!(values, vec![0.0, 1.0]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dense_map_rejects_flat_output() {
        let raw = Tensor::new(vec![1, 4], vec![0.0; 4]).unwrap();
        assert!(postprocess(&raw, OutputMode::DenseMap, TensorLayout::Nchw, None).is_err());
    }
}
