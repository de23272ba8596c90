use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fingerprint::ImageFingerprint;
use crate::fusion::{RiskLevel, Verdict};
use crate::pipeline::AnalysisOutcome;
use crate::signal::HeatmapSet;

/// 可持久化的分析记录
///
/// 交给外部的持久化组件保存；`id` 由该组件分配，本 crate 不负责存储、检索和列表。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    // === 第一层：身份 ===
    pub id: String,
    pub filename: String,

    // === 第二层：判决 ===
    pub forgery_score: u32,
    pub risk_level: RiskLevel,
    /// 完整的 Verdict (module_scores + explanation)
    pub full_result: Verdict,

    // === 第三层：证据 ===
    pub heatmaps: HeatmapSet,
    /// 仅 PDF 文件才有 (签名 / 嵌入对象等专项检查)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_checks: Option<Value>,
    pub fingerprint: ImageFingerprint,

    // === 第四层：元数据 ===
    pub created_at: DateTime<Utc>,
}

impl AnalysisRecord {
    pub fn new(id: impl Into<String>, filename: impl Into<String>, outcome: AnalysisOutcome) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            forgery_score: outcome.verdict.forgery_score,
            risk_level: outcome.verdict.risk_level,
            full_result: outcome.verdict,
            heatmaps: outcome.heatmaps,
            document_checks: outcome.document_checks,
            fingerprint: outcome.fingerprint,
            created_at: outcome.analyzed_at,
        }
    }
}

/// 报告封条：把报告内容摘要与记录绑定，签名后写入完整性账本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSeal {
    pub record_id: String,
    pub filename: String,
    /// 报告产物的 SHA256 (Hex)
    pub report_sha256: String,
    /// Unix 时间戳 (秒)
    pub sealed_at: i64,
}
