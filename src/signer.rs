use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng; // 用于生成私钥的安全随机数生成器
use std::fs;
use std::path::Path;

use crate::record::ReportSeal;

/// 签名器模块
/// 负责对报告封条进行确证，证明"这份报告是本服务在该时间点生成的"
pub struct ReportSigner {
    keypair: SigningKey,
}

impl ReportSigner {
    /// 创建一个临时签名器 (测试 / 一次性运行)
    pub fn new() -> Self {
        // Ed25519 基于 Twisted Edwards Curve (Curve25519)
        let keypair = SigningKey::generate(&mut OsRng);
        Self { keypair }
    }

    /// 从文件加载私钥，不存在则生成并写入
    ///
    /// 文件内容就是 32 字节的原始私钥；长度不对直接报错，不会悄悄覆盖。
    pub fn load_or_generate(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let bytes = fs::read(path)?;
            let secret: [u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
                anyhow::anyhow!(
                    "key file {} must hold {} bytes, found {}",
                    path.display(),
                    SECRET_KEY_LENGTH,
                    bytes.len()
                )
            })?;
            tracing::info!(path = %path.display(), "🔑 已加载签名私钥");
            return Ok(Self {
                keypair: SigningKey::from_bytes(&secret),
            });
        }

        let signer = Self::new();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, signer.keypair.to_bytes())?;
        tracing::info!(path = %path.display(), "🔑 已生成新的签名私钥");
        Ok(signer)
    }

    /// 获取公钥 (分发给审计方验签)
    pub fn public_key(&self) -> VerifyingKey {
        self.keypair.verifying_key()
    }

    /// 对封条签名，返回 64 字节的 Ed25519 签名
    pub fn sign(&self, seal: &ReportSeal) -> anyhow::Result<Signature> {
        // 结构体字段顺序固定，serde_json 的输出因此是稳定的
        let payload = serde_json::to_vec(seal)?;
        Ok(self.keypair.sign(&payload))
    }

    /// 静态验证函数 (给外部验证者使用)
    pub fn verify(key: &VerifyingKey, seal: &ReportSeal, signature: &Signature) -> anyhow::Result<bool> {
        let payload = serde_json::to_vec(seal)?;
        Ok(key.verify(&payload, signature).is_ok())
    }
}

impl Default for ReportSigner {
    fn default() -> Self {
        Self::new()
    }
}
