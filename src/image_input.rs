use image::{DynamicImage, RgbImage};
use std::sync::Arc;

use crate::error::{ForensicError, Result};

/// 解码后的文档图像
///
/// 统一成 RGB8 像素格式，所有检测器看到的都是同一份数据。
/// 原始字节也保留着：指纹 (SHA256) 要对上传的原文件计算，而不是对解码结果。
#[derive(Debug, Clone)]
pub struct DocumentImage {
    pixels: Arc<RgbImage>,
    source: Arc<Vec<u8>>,
}

impl DocumentImage {
    /// 解码上传的字节
    ///
    /// 空文件或无法识别的格式都属于输入完整性错误。
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ForensicError::InvalidInput("uploaded file is empty".into()));
        }
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| ForensicError::InvalidInput(format!("cannot decode image: {e}")))?;
        Ok(Self {
            pixels: Arc::new(decoded.to_rgb8()),
            source: Arc::new(bytes.to_vec()),
        })
    }

    /// 直接用内存中的像素构造 (测试、基准以及上游已经完成解码的场景)
    pub fn from_rgb(pixels: RgbImage) -> Self {
        Self {
            pixels: Arc::new(pixels),
            source: Arc::new(Vec::new()),
        }
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn source_bytes(&self) -> &[u8] {
        &self.source
    }

    pub fn to_dynamic(&self) -> DynamicImage {
        DynamicImage::ImageRgb8(self.pixels.as_ref().clone())
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }
}
