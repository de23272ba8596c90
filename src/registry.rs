use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ForensicError, Result};
use crate::tensor::{PreprocessParams, TensorLayout};

/// ImageNet 风格的默认归一化参数
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const PIXEL_SCALE: f32 = 255.0;

fn default_input_size() -> (u32, u32) {
    (224, 224)
}

// ==========================================
// 1. 后端家族 (Backend Family)
// ==========================================
// 封闭的枚举：家族决定张量布局与默认归一化参数，注册表加载时一次性解析，
// 之后不再按字符串重新分派。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Torch,
    Keras,
    Onnx,
}

impl BackendKind {
    pub fn layout(self) -> TensorLayout {
        match self {
            BackendKind::Torch | BackendKind::Onnx => TensorLayout::Nchw,
            BackendKind::Keras => TensorLayout::Nhwc,
        }
    }

    pub fn preprocess_defaults(self) -> PreprocessParams {
        // 目前三个家族都使用 ImageNet 统计量
        PreprocessParams {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            scale: PIXEL_SCALE,
        }
    }

    /// 解析注册表中声明的 `type`；未知家族返回 None
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared.trim().to_ascii_lowercase().as_str() {
            "torch" => Some(BackendKind::Torch),
            "keras" => Some(BackendKind::Keras),
            "onnx" => Some(BackendKind::Onnx),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Torch => "torch",
            BackendKind::Keras => "keras",
            BackendKind::Onnx => "onnx",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 输出解读方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Classification,
    DenseMap,
}

// ==========================================
// 2. 注册表条目
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    #[serde(rename = "type")]
    pub backend: BackendKind,
    pub path: PathBuf,
    /// (宽, 高)
    #[serde(default = "default_input_size")]
    pub input_size: (u32, u32),
    #[serde(default, rename = "output_type")]
    pub output_mode: OutputMode,
}

/// 注册表文件中的原始条目，`type` 先按字符串读入，逐条解析
#[derive(Debug, Deserialize)]
struct DeclaredEntry {
    #[serde(rename = "type")]
    backend: String,
    path: PathBuf,
    #[serde(default = "default_input_size")]
    input_size: (u32, u32),
    #[serde(default, rename = "output_type")]
    output_mode: OutputMode,
}

/// 单个模型的 `input_size` 上限 (每边)
pub const MAX_INPUT_SIDE: u32 = 8192;

/// 模型注册表
///
/// 启动时读取一次，之后只读。
/// 声明了未知后端家族的条目单独记录，只让该标识的调用失败 (UnsupportedBackend)。
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    base_dir: PathBuf,
    entries: BTreeMap<String, ModelEntry>,
    unsupported: BTreeMap<String, String>,
}

impl ModelRegistry {
    pub fn new(base_dir: impl Into<PathBuf>, entries: BTreeMap<String, ModelEntry>) -> Result<Self> {
        for (id, entry) in &entries {
            let (w, h) = entry.input_size;
            if w == 0 || h == 0 || w > MAX_INPUT_SIDE || h > MAX_INPUT_SIDE {
                return Err(ForensicError::Registry(format!(
                    "model '{id}' declares input_size {w}x{h}, each side must be within 1..={MAX_INPUT_SIDE}"
                )));
            }
        }
        Ok(Self {
            base_dir: base_dir.into(),
            entries,
            unsupported: BTreeMap::new(),
        })
    }

    /// 从 JSON 文件加载
    ///
    /// 文件不存在时记录错误并返回空注册表 (之后所有查询都是 UnknownModel)；
    /// 文件结构非法则直接失败。未知的 `type` 只影响该条目。
    pub fn load(path: &Path, base_dir: impl Into<PathBuf>) -> Result<Self> {
        if !path.exists() {
            tracing::error!(path = %path.display(), "❌ 模型注册表文件不存在，使用空注册表");
            return Self::new(base_dir, BTreeMap::new());
        }
        let raw = fs::read(path)?;
        let declared: BTreeMap<String, DeclaredEntry> = serde_json::from_slice(&raw)
            .map_err(|e| ForensicError::Registry(format!("{}: {e}", path.display())))?;

        let mut entries = BTreeMap::new();
        let mut unsupported = BTreeMap::new();
        for (id, d) in declared {
            match BackendKind::from_declared(&d.backend) {
                Some(backend) => {
                    entries.insert(
                        id,
                        ModelEntry {
                            backend,
                            path: d.path,
                            input_size: d.input_size,
                            output_mode: d.output_mode,
                        },
                    );
                }
                None => {
                    tracing::warn!(model = %id, backend = %d.backend, "⚠️ 未知的后端家族，该模型不可用");
                    unsupported.insert(id, d.backend);
                }
            }
        }

        let mut registry = Self::new(base_dir, entries)?;
        registry.unsupported = unsupported;
        tracing::info!(
            path = %path.display(),
            models = registry.entries.len(),
            unsupported = registry.unsupported.len(),
            "📚 模型注册表加载完成"
        );
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        self.entries.get(id)
    }

    /// 声明了未知后端家族的条目：返回声明的 `type`
    pub fn unsupported_kind(&self, id: &str) -> Option<&str> {
        self.unsupported.get(id).map(String::as_str)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 相对路径基于模型目录解析，绝对路径原样使用
    pub fn resolve_path(&self, entry: &ModelEntry) -> PathBuf {
        if entry.path.is_absolute() {
            entry.path.clone()
        } else {
            self.base_dir.join(&entry.path)
        }
    }
}
