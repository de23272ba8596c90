use img_hash::{HashAlg, HasherConfig}; // 感知哈希的配置器和算法枚举
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::image_input::DocumentImage;

/// 文档图像的双重指纹
///
/// - `sha256`: 解决"原始完整性"。上传文件改了一个字节，这个值就会雪崩式变化。
/// - `phash`: 解决"内容同一性"。重新压缩、轻微缩放后依然相近。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFingerprint {
    pub sha256: String,
    pub phash: String,
}

impl ImageFingerprint {
    /// 用于文件命名的短前缀 (热力图等)
    pub fn short_id(&self) -> &str {
        let end = self.sha256.len().min(16);
        &self.sha256[..end]
    }
}

/// 计算字节流的 SHA256，输出小写十六进制
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    // `{:x}`: 把 32 字节的摘要格式化为小写十六进制
    format!("{:x}", hasher.finalize())
}

pub fn fingerprint(image: &DocumentImage) -> ImageFingerprint {
    // 原始字节缺失 (例如直接由像素构造) 时，退化为对像素缓冲区取哈希
    let sha256 = if image.source_bytes().is_empty() {
        sha256_hex(image.rgb().as_raw())
    } else {
        sha256_hex(image.source_bytes())
    };

    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::Gradient) // 梯度算法，比均值算法对明暗变化更鲁棒
        .hash_size(8, 8) // 8x8 = 64 位
        .to_hasher();
    let phash = hasher.hash_image(&image.to_dynamic());

    ImageFingerprint {
        sha256,
        phash: phash.to_base64(),
    }
}
