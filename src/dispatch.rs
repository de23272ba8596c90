use anyhow::{ensure, Context};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ForensicError, Result};
use crate::image_input::DocumentImage;
use crate::registry::{BackendKind, ModelEntry, ModelRegistry, OutputMode};
use crate::tensor::{
    postprocess, preprocess, to_layout, PostprocessOverrides, PreprocessOverrides, ProcessedOutput, Tensor,
    TensorLayout,
};

// ==========================================
// 1. 后端抽象
// ==========================================
/// 已加载的推理后端 (模型内部实现是黑盒)
pub trait InferenceBackend: Send + Sync {
    fn infer(&self, input: &Tensor) -> anyhow::Result<Tensor>;
}

pub type BackendHandle = Arc<dyn InferenceBackend>;

/// 某个后端家族的加载器
pub trait ModelLoader: Send + Sync {
    fn load(&self, entry: &ModelEntry, path: &Path) -> anyhow::Result<BackendHandle>;
}

// ==========================================
// 2. 内置加载器：线性探针 (Linear Probe)
// ==========================================
// 模型文件为 JSON：`{"weights": [[r, g, b], ...], "bias": [...]}`，每个类别一行。
// - classification: 对各通道均值做线性变换，输出 [1, K] logits
// - dense_map: 对每个像素做同样的变换，输出 [1, K, H, W] 或 [1, H, W, K]
#[derive(Debug, Clone, Deserialize)]
struct ProbeFile {
    weights: Vec<[f32; 3]>,
    bias: Vec<f32>,
}

#[derive(Debug)]
struct LinearProbe {
    weights: Vec<[f32; 3]>,
    bias: Vec<f32>,
    layout: TensorLayout,
    mode: OutputMode,
}

impl LinearProbe {
    fn logits(&self, rgb: [f32; 3]) -> impl Iterator<Item = f32> + '_ {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(move |(w, b)| b + w[0] * rgb[0] + w[1] * rgb[1] + w[2] * rgb[2])
    }
}

impl InferenceBackend for LinearProbe {
    fn infer(&self, input: &Tensor) -> anyhow::Result<Tensor> {
        let shape = input.shape();
        ensure!(shape.len() == 4, "expected a 4-D input, got shape {:?}", shape);
        let (c, h, w) = match self.layout {
            TensorLayout::Nchw => (shape[1], shape[2], shape[3]),
            TensorLayout::Nhwc => (shape[3], shape[1], shape[2]),
        };
        ensure!(c == 3, "expected 3 channels, got shape {:?}", shape);

        let data = input.data();
        let plane = h * w;
        let pixel = |i: usize| -> [f32; 3] {
            match self.layout {
                TensorLayout::Nchw => [data[i], data[plane + i], data[2 * plane + i]],
                TensorLayout::Nhwc => [data[i * 3], data[i * 3 + 1], data[i * 3 + 2]],
            }
        };
        let k = self.weights.len();

        match self.mode {
            OutputMode::Classification => {
                let mut mean = [0.0_f32; 3];
                for i in 0..plane {
                    let p = pixel(i);
                    for ch in 0..3 {
                        mean[ch] += p[ch];
                    }
                }
                let n = plane.max(1) as f32;
                mean.iter_mut().for_each(|m| *m /= n);
                Tensor::new(vec![1, k], self.logits(mean).collect())
            }
            OutputMode::DenseMap => match self.layout {
                TensorLayout::Nhwc => {
                    let out = (0..plane).flat_map(|i| self.logits(pixel(i)).collect::<Vec<_>>()).collect();
                    Tensor::new(vec![1, h, w, k], out)
                }
                TensorLayout::Nchw => {
                    let mut out = vec![0.0_f32; k * plane];
                    for i in 0..plane {
                        for (class, logit) in self.logits(pixel(i)).enumerate() {
                            out[class * plane + i] = logit;
                        }
                    }
                    Tensor::new(vec![1, k, h, w], out)
                }
            },
        }
    }
}

/// 读取线性探针文件的加载器，布局由条目的后端家族决定
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearProbeLoader;

impl ModelLoader for LinearProbeLoader {
    fn load(&self, entry: &ModelEntry, path: &Path) -> anyhow::Result<BackendHandle> {
        let raw = fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
        let probe: ProbeFile =
            serde_json::from_slice(&raw).with_context(|| format!("cannot parse {}", path.display()))?;
        ensure!(!probe.weights.is_empty(), "probe declares no classes");
        ensure!(
            probe.weights.len() == probe.bias.len(),
            "probe has {} weight rows but {} biases",
            probe.weights.len(),
            probe.bias.len()
        );

        Ok(Arc::new(LinearProbe {
            weights: probe.weights,
            bias: probe.bias,
            layout: entry.backend.layout(),
            mode: entry.output_mode,
        }))
    }
}

// ==========================================
// 3. 模型分派层 (Model Dispatch)
// ==========================================
/// 每个模型标识对应一个槽位：
/// 空 (unloaded) → 某个线程正在初始化 (loading) → 已加载 (loaded)；
/// 初始化失败 (failed) 时槽位回到空状态，缓存中不会留下半成品，下一次调用重新加载。
type Slot = Arc<OnceCell<BackendHandle>>;

pub struct ModelDispatcher {
    registry: ModelRegistry,
    loaders: HashMap<BackendKind, Arc<dyn ModelLoader>>,
    cache: Mutex<HashMap<String, Slot>>,
}

impl ModelDispatcher {
    /// 不带任何加载器
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            loaders: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// torch 与 keras 家族使用内置线性探针加载器；onnx 没有注册加载器
    pub fn with_default_loaders(registry: ModelRegistry) -> Self {
        Self::new(registry)
            .with_loader(BackendKind::Torch, LinearProbeLoader)
            .with_loader(BackendKind::Keras, LinearProbeLoader)
    }

    pub fn with_loader(mut self, kind: BackendKind, loader: impl ModelLoader + 'static) -> Self {
        self.loaders.insert(kind, Arc::new(loader));
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.lock_cache().get(id).is_some_and(|slot| slot.get().is_some())
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // 临界区内只做 HashMap 操作，不会留下不一致的状态
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, id: &str) -> Result<&ModelEntry> {
        self.registry
            .get(id)
            .ok_or_else(|| match self.registry.unsupported_kind(id) {
                Some(kind) => ForensicError::UnsupportedBackend {
                    model: id.to_string(),
                    backend: kind.to_string(),
                },
                None => ForensicError::UnknownModel(id.to_string()),
            })
    }

    /// 加载模型 (幂等，带缓存)
    ///
    /// 同一标识在进程生命周期内最多加载一次；并发的首次调用只有一个真正执行加载，
    /// 其他调用阻塞等待并复用结果。
    pub fn load_model(&self, id: &str) -> Result<BackendHandle> {
        let entry = self.entry(id)?;
        let loader = self
            .loaders
            .get(&entry.backend)
            .cloned()
            .ok_or_else(|| ForensicError::UnsupportedBackend {
                model: id.to_string(),
                backend: entry.backend.to_string(),
            })?;

        // 只在取槽位时持有锁，加载本身在锁外进行
        let slot: Slot = self.lock_cache().entry(id.to_string()).or_default().clone();

        if let Some(handle) = slot.get() {
            tracing::debug!(model = id, "♻️ 模型缓存命中");
            return Ok(handle.clone());
        }

        let loaded = slot.get_or_try_init(|| {
            let path = self.registry.resolve_path(entry);
            tracing::info!(model = id, backend = %entry.backend, path = %path.display(), "📦 加载模型");
            loader.load(entry, &path).map_err(|e| ForensicError::ModelLoad {
                model: id.to_string(),
                reason: format!("{e:#}"),
            })
        });

        // 失败时槽位保持为空并留在表中：正在等待的调用方会在同一个槽位上重试，
        // 一个标识永远只对应一个槽位，也就最多只有一份已加载的句柄
        match loaded {
            Ok(handle) => Ok(handle.clone()),
            Err(err) => {
                tracing::error!(model = id, error = %err, "❌ 模型加载失败");
                Err(err)
            }
        }
    }

    /// 对上传的原始字节执行单模型推理
    pub fn run_inference(
        &self,
        id: &str,
        image_bytes: &[u8],
        pre: Option<&PreprocessOverrides>,
        post: Option<&PostprocessOverrides>,
    ) -> Result<ProcessedOutput> {
        let image = DocumentImage::decode(image_bytes)?;
        self.run_on_image(id, &image, pre, post)
    }

    /// 预处理 → 推理 → 后处理
    ///
    /// 推理失败原样上报 (带原始错误文本)，不做重试。
    pub fn run_on_image(
        &self,
        id: &str,
        image: &DocumentImage,
        pre: Option<&PreprocessOverrides>,
        post: Option<&PostprocessOverrides>,
    ) -> Result<ProcessedOutput> {
        let handle = self.load_model(id)?;
        let entry = self.entry(id)?;
        let layout = entry.backend.layout();
        let inference_error = |e: anyhow::Error| ForensicError::Inference {
            model: id.to_string(),
            cause: format!("{e:#}"),
        };

        let params = entry.backend.preprocess_defaults().overlay(pre);
        let (width, height) = entry.input_size;
        let buffer = preprocess(image.rgb(), width, height, &params);
        let input = to_layout(buffer, width, height, layout).map_err(inference_error)?;

        let raw = handle.infer(&input).map_err(inference_error)?;
        let output = postprocess(&raw, entry.output_mode, layout, post).map_err(inference_error)?;

        tracing::info!(model = id, score = output.score(), "✅ 推理完成");
        Ok(output)
    }
}
