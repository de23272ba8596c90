use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::normalizer::{coerce, CoerceError};

/// 原始检测结果：信号名 → 检测器自定义的负载 (可能缺失或为 null)
pub type RawDetectorResults = BTreeMap<String, Value>;

/// 热力图集合：类别 → 渲染产物路径；`None` 表示该类别没有生成
pub type HeatmapSet = BTreeMap<String, Option<String>>;

// ==========================================
// 1. 信号 (Signal)
// ==========================================
// 每个取证检测器贡献一个信号。
// 各检测器的"分数字段"名称不同 (score / ai_score / ela_score ...)，
// 这里把这种依赖写成一张固定的提取表，而不是到处去猜 key。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Ocr,
    Frdetr,
    Diffusion,
    Noiseprint,
    Ela,
    Copymove,
}

/// 提取表中的一行
#[derive(Debug, Clone, Copy)]
pub struct SignalSpec {
    /// 原始结果里的 key，也是 `module_scores` 里的 key
    pub key: &'static str,
    /// 负载里承载分数的字段
    pub score_field: &'static str,
    /// `explanation` 里的 key
    pub explanation_key: &'static str,
    pub high_wording: &'static str,
    pub low_wording: &'static str,
    /// 报告中展示的名称
    pub label: &'static str,
    pub heatmap: Option<HeatmapKind>,
}

const TABLE: [SignalSpec; 6] = [
    SignalSpec {
        key: "ocr",
        score_field: "score",
        explanation_key: "ocr",
        high_wording: "Suspicious text or layout",
        low_wording: "No textual anomalies",
        label: "OCR / Layout",
        heatmap: None,
    },
    SignalSpec {
        key: "frdetr",
        score_field: "score",
        explanation_key: "visual",
        high_wording: "Altered regions detected",
        low_wording: "No visual tampering detected",
        label: "FR-DETR (Visual Tampering)",
        heatmap: None,
    },
    SignalSpec {
        key: "diffusion",
        score_field: "score",
        explanation_key: "inpainting",
        high_wording: "Possible AI reconstruction",
        low_wording: "No inpainting traces",
        label: "Diffusion Forensics (Generative Inpainting)",
        heatmap: Some(HeatmapKind::GenerativeInpainting),
    },
    SignalSpec {
        key: "noiseprint",
        score_field: "ai_score",
        explanation_key: "ai_noise",
        high_wording: "AI-generated texture inconsistencies",
        low_wording: "No AI noise signature",
        label: "NoisePrint++ (Sensor Noise / AI Fingerprint)",
        heatmap: Some(HeatmapKind::AiNoise),
    },
    SignalSpec {
        key: "ela",
        score_field: "ela_score",
        explanation_key: "compression",
        high_wording: "Compression anomalies detected",
        low_wording: "Normal compression",
        label: "ELA++ (Compression Artifacts)",
        heatmap: Some(HeatmapKind::Compression),
    },
    SignalSpec {
        key: "copymove",
        score_field: "copy_move_score",
        explanation_key: "duplication",
        high_wording: "Copy-move duplication detected",
        low_wording: "No duplication traces",
        label: "Copy-Move Detection",
        heatmap: Some(HeatmapKind::Duplication),
    },
];

impl Signal {
    /// 固定顺序。融合时按此顺序累加，保证结果逐位可复现。
    pub const ALL: [Signal; 6] = [
        Signal::Ocr,
        Signal::Frdetr,
        Signal::Diffusion,
        Signal::Noiseprint,
        Signal::Ela,
        Signal::Copymove,
    ];

    pub fn spec(self) -> &'static SignalSpec {
        &TABLE[self as usize]
    }

    pub fn key(self) -> &'static str {
        self.spec().key
    }

    pub fn score_field(self) -> &'static str {
        self.spec().score_field
    }

    pub fn from_key(key: &str) -> Option<Signal> {
        Signal::ALL.into_iter().find(|s| s.key() == key)
    }

    /// 从原始结果中取出该信号的分数
    ///
    /// 查找失败 (信号缺失、负载为 null 或不是对象、字段缺失) 一律返回 `Ok(None)`；
    /// 只有字段存在却无法转换为数字时才返回错误。
    pub fn extract(self, results: &RawDetectorResults) -> Result<Option<f64>, CoerceError> {
        let field = results
            .get(self.key())
            .and_then(Value::as_object)
            .and_then(|payload| payload.get(self.score_field()));

        match field {
            Some(value) => coerce(value),
            None => Ok(None),
        }
    }
}

// ==========================================
// 2. 热力图类别
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeatmapKind {
    Compression,
    AiNoise,
    Duplication,
    GenerativeInpainting,
}

impl HeatmapKind {
    pub const ALL: [HeatmapKind; 4] = [
        HeatmapKind::Compression,
        HeatmapKind::AiNoise,
        HeatmapKind::Duplication,
        HeatmapKind::GenerativeInpainting,
    ];

    pub fn key(self) -> &'static str {
        match self {
            HeatmapKind::Compression => "compression",
            HeatmapKind::AiNoise => "ai-noise",
            HeatmapKind::Duplication => "duplication",
            HeatmapKind::GenerativeInpainting => "generative-inpainting",
        }
    }
}
