//! VerifDoc 文档取证核心
//!
//! 检测器 → 归一化 → 加权融合 → 判决；模型分派层负责按需加载并缓存推理后端，
//! 报告阶段把判决与热力图打包，签名后写入完整性账本。

pub mod config;
pub mod detectors;
pub mod dispatch;
pub mod error;
pub mod fingerprint;
pub mod fusion;
pub mod image_input;
pub mod ledger;
pub mod normalizer;
pub mod pipeline;
pub mod record;
pub mod registry;
pub mod report;
pub mod signal;
pub mod signer;
pub mod tensor;

pub use error::{ErrorPayload, ForensicError, Result};
pub use fusion::{FusionEngine, FusionWeights, RiskLevel, Verdict};
pub use pipeline::{AnalysisOutcome, AnalysisRequest, ForensicPipeline};
