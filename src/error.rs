use serde::Serialize;
use thiserror::Error;

/// 核心错误类型
///
/// 按照处理方式分组：
/// - 输入完整性: `InvalidInput`, `DataIntegrity`
/// - 注册表/配置: `Registry`, `UnknownModel`, `UnsupportedBackend`, `ModelLoad`, `InvalidWeights`
/// - 推理: `Inference` (保留原始错误文本，不自动重试)
/// - 报告: `Report`, `Io`
///
/// 检测器降级 (缺失 / 超时) 不在这里，它永远不是错误。
#[derive(Error, Debug)]
pub enum ForensicError {
    #[error("Model registry error: {0}")]
    Registry(String),

    #[error("Model '{0}' not found in registry")]
    UnknownModel(String),

    #[error("No loader registered for backend '{backend}' (model '{model}')")]
    UnsupportedBackend { model: String, backend: String },

    #[error("Failed to load model '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Inference failed for model '{model}': {cause}")]
    Inference { model: String, cause: String },

    #[error("Malformed '{signal}' payload: {reason}")]
    DataIntegrity { signal: String, reason: String },

    #[error("Invalid fusion weights: {0}")]
    InvalidWeights(String),

    #[error("Report generation failed: {0}")]
    Report(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ForensicError>;

/// 对外暴露的结构化错误负载
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub message: String,
}

impl ForensicError {
    /// 稳定的错误标签 (snake_case)，调用方据此分支，而不是去解析 message
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Registry(_) => "registry",
            Self::UnknownModel(_) => "unknown_model",
            Self::UnsupportedBackend { .. } => "unsupported_backend",
            Self::ModelLoad { .. } => "model_load",
            Self::InvalidInput(_) => "invalid_input",
            Self::Inference { .. } => "inference",
            Self::DataIntegrity { .. } => "data_integrity",
            Self::InvalidWeights(_) => "invalid_weights",
            Self::Report(_) => "report",
            Self::Io(_) => "io",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}
