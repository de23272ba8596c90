use chrono::{DateTime, Utc};
use image::GrayImage;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;

use crate::config::Config;
use crate::detectors::{CopyMoveDetector, Detector, DocumentCheck, ElaDetector, ModelDetector, SignatureZoneCheck};
use crate::dispatch::ModelDispatcher;
use crate::error::{ForensicError, Result};
use crate::fingerprint::{fingerprint, ImageFingerprint};
use crate::fusion::{FusionEngine, Verdict};
use crate::image_input::DocumentImage;
use crate::signal::{HeatmapKind, HeatmapSet, RawDetectorResults, Signal};

/// 一次分析请求
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub image: Vec<u8>,
    pub filename: Option<String>,
    /// 显式要求执行文档专项检查 (此时必须提供文件名)
    pub require_document_checks: bool,
}

impl AnalysisRequest {
    pub fn new(image: Vec<u8>, filename: Option<String>) -> Self {
        Self {
            image,
            filename,
            require_document_checks: false,
        }
    }
}

/// 分析结果：判决 + 证据
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub verdict: Verdict,
    pub heatmaps: HeatmapSet,
    pub raw_results: RawDetectorResults,
    pub fingerprint: ImageFingerprint,
    pub document_checks: Option<Value>,
    pub analyzed_at: DateTime<Utc>,
}

/// 文件名以 `.pdf` 结尾 (不区分大小写) 时才执行文档专项检查
pub fn is_pdf(filename: &str) -> bool {
    filename.to_ascii_lowercase().ends_with(".pdf")
}

// ==========================================
// 编排流水线
// ==========================================
pub struct ForensicPipeline {
    detectors: Vec<Arc<dyn Detector>>,
    document_checks: Vec<Arc<dyn DocumentCheck>>,
    fusion: FusionEngine,
    detector_timeout: Duration,
    heatmap_dir: PathBuf,
}

impl ForensicPipeline {
    pub fn new(fusion: FusionEngine, detector_timeout: Duration, heatmap_dir: impl Into<PathBuf>) -> Self {
        Self {
            detectors: Vec::new(),
            document_checks: Vec::new(),
            fusion,
            detector_timeout,
            heatmap_dir: heatmap_dir.into(),
        }
    }

    pub fn with_detector(mut self, detector: impl Detector + 'static) -> Self {
        self.detectors.push(Arc::new(detector));
        self
    }

    pub fn with_document_check(mut self, check: impl DocumentCheck + 'static) -> Self {
        self.document_checks.push(Arc::new(check));
        self
    }

    /// 按配置装配六个默认检测器与签名区检查
    pub fn from_config(config: &Config, dispatcher: Arc<ModelDispatcher>) -> Self {
        let models = &config.models;
        Self::new(
            FusionEngine::new(config.weights.clone()),
            config.detector_timeout,
            &config.heatmap_dir,
        )
        .with_detector(ModelDetector::new(Signal::Ocr, &models.ocr, dispatcher.clone()))
        .with_detector(ModelDetector::new(Signal::Frdetr, &models.frdetr, dispatcher.clone()))
        .with_detector(ModelDetector::new(Signal::Diffusion, &models.diffusion, dispatcher.clone()))
        .with_detector(ModelDetector::new(Signal::Noiseprint, &models.noiseprint, dispatcher))
        .with_detector(ElaDetector::new(config.ela_quality))
        .with_detector(CopyMoveDetector)
        .with_document_check(SignatureZoneCheck)
    }

    pub fn fusion(&self) -> &FusionEngine {
        &self.fusion
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisOutcome> {
        // 0. 输入完整性
        let wants_checks = match request.filename.as_deref() {
            Some(name) => is_pdf(name),
            None if request.require_document_checks => {
                return Err(ForensicError::InvalidInput(
                    "a filename is required for document-specific checks".into(),
                ))
            }
            None => false,
        };
        let image = DocumentImage::decode(&request.image)?;
        let fingerprint = fingerprint(&image);
        tracing::info!(
            filename = request.filename.as_deref().unwrap_or("<unnamed>"),
            sha256 = %fingerprint.sha256,
            "📥 收到分析请求"
        );

        // 1. 并发运行所有检测器
        let (raw_results, rendered) = self.run_detectors(&image).await;

        // 2. 落盘热力图
        let heatmaps = self.write_heatmaps(rendered, fingerprint.short_id()).await;

        // 3. 文档专项检查 (仅 PDF)
        let document_checks = if wants_checks {
            Some(self.run_document_checks(&image).await)
        } else {
            None
        };

        // 4. 融合
        let verdict = self.fusion.fuse(&raw_results)?;
        tracing::info!(
            forgery_score = verdict.forgery_score,
            risk = %verdict.risk_level,
            signals = raw_results.len(),
            "✅ 分析完成"
        );

        Ok(AnalysisOutcome {
            verdict,
            heatmaps,
            raw_results,
            fingerprint,
            document_checks,
            analyzed_at: Utc::now(),
        })
    }

    /// 每个检测器在阻塞线程池上独立运行，并各自带超时。
    /// 失败、panic、超时都只记录告警，该信号视为缺失 (贡献 0.0)。
    async fn run_detectors(&self, image: &DocumentImage) -> (RawDetectorResults, Vec<(HeatmapKind, GrayImage)>) {
        // timeout 的截止时间在创建时就已确定，因此逐个 await 不会延长后面检测器的时限
        let pending: Vec<_> = self
            .detectors
            .iter()
            .map(|detector| {
                let detector = detector.clone();
                let image = image.clone();
                let signal = detector.signal();
                let run = task::spawn_blocking(move || detector.analyze(&image));
                (signal, tokio::time::timeout(self.detector_timeout, run))
            })
            .collect();

        let mut results = RawDetectorResults::new();
        let mut heatmaps = Vec::new();
        for (signal, run) in pending {
            match run.await {
                Ok(Ok(Ok(output))) => {
                    if let (Some(kind), Some(heatmap)) = (signal.spec().heatmap, output.heatmap) {
                        heatmaps.push((kind, heatmap));
                    }
                    results.insert(signal.key().to_string(), output.payload);
                }
                Ok(Ok(Err(e))) => {
                    tracing::warn!(signal = signal.key(), error = %format!("{e:#}"), "⚠️ 检测器失败，按缺失处理");
                }
                Ok(Err(join)) => {
                    tracing::warn!(signal = signal.key(), error = %join, "⚠️ 检测器异常退出，按缺失处理");
                }
                Err(_) => {
                    tracing::warn!(
                        signal = signal.key(),
                        timeout_ms = self.detector_timeout.as_millis() as u64,
                        "⏱️ 检测器超时，按缺失处理"
                    );
                }
            }
        }
        (results, heatmaps)
    }

    async fn write_heatmaps(&self, rendered: Vec<(HeatmapKind, GrayImage)>, token: &str) -> HeatmapSet {
        let mut set: HeatmapSet = HeatmapKind::ALL.iter().map(|k| (k.key().to_string(), None)).collect();
        if rendered.is_empty() {
            return set;
        }

        let dir = self.heatmap_dir.clone();
        let token = token.to_string();
        let written = task::spawn_blocking(move || {
            rendered
                .into_iter()
                .map(|(kind, img)| {
                    let path = heatmap_path(&dir, kind, &token);
                    let saved = save_heatmap(&path, &img);
                    (kind, path, saved)
                })
                .collect::<Vec<_>>()
        })
        .await;

        match written {
            Ok(entries) => {
                // 写入失败也保留预期路径：热力图确实生成过，报告里显示为"服务器上找不到"
                for (kind, path, saved) in entries {
                    if let Err(e) = saved {
                        tracing::warn!(category = kind.key(), path = %path.display(), error = %e, "⚠️ 热力图写入失败");
                    }
                    set.insert(kind.key().to_string(), Some(path.to_string_lossy().into_owned()));
                }
            }
            Err(join) => tracing::warn!(error = %join, "⚠️ 热力图写入任务异常退出"),
        }
        set
    }

    async fn run_document_checks(&self, image: &DocumentImage) -> Value {
        let checks = self.document_checks.clone();
        let image = image.clone();
        let ran = task::spawn_blocking(move || {
            let mut out = serde_json::Map::new();
            for check in checks {
                match check.check(&image) {
                    Ok(v) => {
                        out.insert(check.name().to_string(), v);
                    }
                    Err(e) => {
                        tracing::warn!(check = check.name(), error = %format!("{e:#}"), "⚠️ 文档检查失败");
                    }
                }
            }
            out
        })
        .await;

        match ran {
            Ok(map) => Value::Object(map),
            Err(join) => {
                tracing::warn!(error = %join, "⚠️ 文档检查任务异常退出");
                Value::Object(serde_json::Map::new())
            }
        }
    }
}

fn heatmap_path(dir: &Path, kind: HeatmapKind, token: &str) -> PathBuf {
    dir.join(format!("{}_{}.png", kind.key(), token))
}

fn save_heatmap(path: &Path, img: &GrayImage) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    img.save(path)?;
    Ok(())
}
