use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::fusion::FusionWeights;

#[derive(Debug, Clone)]
pub struct Config {
    pub project_name: String,
    pub registry_path: PathBuf,
    pub model_dir: PathBuf,
    pub heatmap_dir: PathBuf,
    pub report_dir: PathBuf,
    pub key_path: PathBuf,
    /// 封条账本文件，每次签发报告后追加
    pub ledger_path: PathBuf,
    pub detector_timeout: Duration,
    pub ela_quality: u8,
    pub models: DetectorModels,
    pub weights: FusionWeights,
}

/// 基于模型的检测器各自使用的模型标识
#[derive(Debug, Clone)]
pub struct DetectorModels {
    pub ocr: String,
    pub frdetr: String,
    pub diffusion: String,
    pub noiseprint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_name: "VerifDoc".to_string(),
            registry_path: PathBuf::from("models/model_registry.json"),
            model_dir: PathBuf::from("models"),
            heatmap_dir: PathBuf::from("data/heatmaps"),
            report_dir: PathBuf::from("data/reports"),
            key_path: PathBuf::from("verifdoc.key"),
            ledger_path: PathBuf::from("data/ledger.json"),
            detector_timeout: Duration::from_millis(30_000),
            ela_quality: 95,
            models: DetectorModels {
                ocr: "donut".to_string(),
                frdetr: "fr_detr".to_string(),
                diffusion: "diffusion_forensics".to_string(),
                noiseprint: "noiseprint".to_string(),
            },
            weights: FusionWeights::default(),
        }
    }
}

fn string_or(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn path_or(key: &str, default: PathBuf) -> PathBuf {
    env::var_os(key).map(PathBuf::from).unwrap_or(default)
}

/// 读取并解析数值型变量；存在但解析失败时报错，并指出是哪个变量
fn parsed_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// 从环境变量加载配置，缺失的键使用默认值
    ///
    /// 融合权重在这里完成校验，校验失败直接拒绝启动。
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Self::default();

        let ela_quality: u8 = parsed_or("ELA_QUALITY", d.ela_quality)?;
        anyhow::ensure!(
            (1..=100).contains(&ela_quality),
            "ELA_QUALITY must be within 1..=100, got {ela_quality}"
        );

        let weights = FusionWeights {
            ocr: parsed_or("FUSION_OCR_WEIGHT", d.weights.ocr)?,
            frdetr: parsed_or("FUSION_FRDETR_WEIGHT", d.weights.frdetr)?,
            diffusion: parsed_or("FUSION_DIFFUSION_WEIGHT", d.weights.diffusion)?,
            noiseprint: parsed_or("FUSION_NOISEPRINT_WEIGHT", d.weights.noiseprint)?,
            ela: parsed_or("FUSION_ELA_WEIGHT", d.weights.ela)?,
            copymove: parsed_or("FUSION_COPYMOVE_WEIGHT", d.weights.copymove)?,
        };
        weights.validate()?;

        Ok(Self {
            project_name: string_or("VERIFDOC_PROJECT_NAME", d.project_name),
            registry_path: path_or("VERIFDOC_MODEL_REGISTRY", d.registry_path),
            model_dir: path_or("VERIFDOC_MODEL_DIR", d.model_dir),
            heatmap_dir: path_or("VERIFDOC_HEATMAP_DIR", d.heatmap_dir),
            report_dir: path_or("VERIFDOC_REPORT_DIR", d.report_dir),
            key_path: path_or("KEY_PATH", d.key_path),
            ledger_path: path_or("VERIFDOC_LEDGER_PATH", d.ledger_path),
            detector_timeout: Duration::from_millis(parsed_or(
                "DETECTOR_TIMEOUT_MS",
                d.detector_timeout.as_millis() as u64,
            )?),
            ela_quality,
            models: DetectorModels {
                ocr: string_or("OCR_MODEL", d.models.ocr),
                frdetr: string_or("FRDETR_MODEL", d.models.frdetr),
                diffusion: string_or("DIFFUSION_MODEL", d.models.diffusion),
                noiseprint: string_or("NOISEPRINT_MODEL", d.models.noiseprint),
            },
            weights,
        })
    }
}
