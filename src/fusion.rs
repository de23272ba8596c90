use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ForensicError, Result};
use crate::normalizer::normalize;
use crate::signal::{RawDetectorResults, Signal};

/// 融合策略版本标记，写入 Verdict 供审计追溯
pub const FUSION_POLICY: &str = "fusion-v1";

/// 单个信号的"高/低"措辞阈值
const SIGNAL_HIGH_THRESHOLD: f64 = 0.5;
/// 总结措辞阈值 (百分制)
const SUMMARY_ALTERED_THRESHOLD: u32 = 60;
/// 权重之和允许的浮点误差
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// ==========================================
// 1. 风险等级
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

impl RiskLevel {
    /// < 40 低；40..=70 中；> 70 高
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=39 => RiskLevel::Low,
            40..=70 => RiskLevel::Moderate,
            _ => RiskLevel::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Moderate => "Moderate",
            RiskLevel::High => "High",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==========================================
// 2. 融合权重
// ==========================================
/// 每个信号一个非负权重，进程启动时配置一次，之后只读。
///
/// 约定：权重之和为 1.0，所以加权和本身就落在 [0, 1]。
/// 这里**不做**重新归一化，权重就是唯一的校准点。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub ocr: f64,
    pub frdetr: f64,
    pub diffusion: f64,
    pub noiseprint: f64,
    pub ela: f64,
    pub copymove: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            ocr: 0.1,
            frdetr: 0.3,
            diffusion: 0.2,
            noiseprint: 0.2,
            ela: 0.1,
            copymove: 0.1,
        }
    }
}

impl FusionWeights {
    pub fn weight(&self, signal: Signal) -> f64 {
        match signal {
            Signal::Ocr => self.ocr,
            Signal::Frdetr => self.frdetr,
            Signal::Diffusion => self.diffusion,
            Signal::Noiseprint => self.noiseprint,
            Signal::Ela => self.ela,
            Signal::Copymove => self.copymove,
        }
    }

    pub fn sum(&self) -> f64 {
        Signal::ALL.iter().map(|s| self.weight(*s)).sum()
    }

    /// 启动时校验
    ///
    /// 负数、非有限值、总和超过 1 都会被拒绝 (否则单调性或 [0,100] 值域会被破坏)。
    /// 总和小于 1 只告警：分数整体偏低，但语义仍然成立。
    pub fn validate(&self) -> Result<()> {
        for signal in Signal::ALL {
            let w = self.weight(signal);
            if !w.is_finite() || w < 0.0 {
                return Err(ForensicError::InvalidWeights(format!(
                    "weight for '{}' must be a finite non-negative number, got {}",
                    signal.key(),
                    w
                )));
            }
        }

        let sum = self.sum();
        if sum > 1.0 + WEIGHT_SUM_TOLERANCE {
            return Err(ForensicError::InvalidWeights(format!(
                "weights sum to {sum:.6}, which exceeds 1.0"
            )));
        }
        if sum < 1.0 - WEIGHT_SUM_TOLERANCE {
            tracing::warn!(sum, "⚠️ 融合权重之和小于 1.0，最终分数将整体偏低");
        }
        Ok(())
    }
}

// ==========================================
// 3. 判决 (Verdict)
// ==========================================
/// 一次分析的聚合结果，创建后不可变。
///
/// 两个 map 都使用 BTreeMap，序列化顺序固定，相同输入得到逐字节相同的 JSON。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub forgery_score: u32,
    pub risk_level: RiskLevel,
    pub module_scores: BTreeMap<String, f64>,
    pub explanation: BTreeMap<String, String>,
    pub raw_output: String,
}

impl Verdict {
    pub fn summary(&self) -> &str {
        self.explanation
            .get("summary")
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn module_score(&self, signal: Signal) -> f64 {
        self.module_scores
            .get(signal.key())
            .copied()
            .unwrap_or(0.0)
    }
}

// ==========================================
// 4. 融合引擎
// ==========================================
/// 纯函数式引擎：除了只读的权重以外没有任何状态，可以被多个请求并发调用。
#[derive(Debug, Clone)]
pub struct FusionEngine {
    weights: FusionWeights,
}

impl FusionEngine {
    pub fn new(weights: FusionWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &FusionWeights {
        &self.weights
    }

    pub fn fuse(&self, results: &RawDetectorResults) -> Result<Verdict> {
        let mut module_scores = BTreeMap::new();
        let mut explanation = BTreeMap::new();
        let mut aggregate = 0.0_f64;

        for signal in Signal::ALL {
            // 1. 提取 + 2. 归一化
            let raw = signal
                .extract(results)
                .map_err(|e| ForensicError::DataIntegrity {
                    signal: signal.key().to_string(),
                    reason: e.to_string(),
                })?;
            let normalized = normalize(raw);

            // 3. 加权累加 (不做除法)
            aggregate += normalized * self.weights.weight(signal);

            // 6. 单信号解释
            let spec = signal.spec();
            let wording = if normalized > SIGNAL_HIGH_THRESHOLD {
                spec.high_wording
            } else {
                spec.low_wording
            };
            explanation.insert(spec.explanation_key.to_string(), wording.to_string());
            module_scores.insert(spec.key.to_string(), normalized);
        }

        // 4. 截断为整数百分比 (floor，不是四舍五入)
        let forgery_score = (aggregate * 100.0).floor().clamp(0.0, 100.0) as u32;

        // 5. 风险分级
        let risk_level = RiskLevel::from_score(forgery_score);

        let summary = if forgery_score > SUMMARY_ALTERED_THRESHOLD {
            "Document likely altered"
        } else {
            "Document likely authentic"
        };
        explanation.insert("summary".to_string(), summary.to_string());

        tracing::debug!(forgery_score, risk = %risk_level, "🧮 融合完成");

        Ok(Verdict {
            forgery_score,
            risk_level,
            module_scores,
            explanation,
            raw_output: FUSION_POLICY.to_string(),
        })
    }
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new(FusionWeights::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn results(v: Value) -> RawDetectorResults {
        serde_json::from_value(v).unwrap()
    }

    fn scenario() -> RawDetectorResults {
        results(json!({
            "ocr": {"score": 0.1},
            "frdetr": {"score": 0.9},
            "diffusion": {"score": 0.0},
            "noiseprint": {"ai_score": 0.2},
            "ela": {"ela_score": 0.1},
            "copymove": {"copy_move_score": 0.0},
        }))
    }

    #[test]
    fn empty_input_is_low_risk_zero() {
        let verdict = FusionEngine::default().fuse(&RawDetectorResults::new()).unwrap();
        assert_eq!(verdict.forgery_score, 0);
        assert_eq!(verdict.risk_level, RiskLevel::Low);
        assert_eq!(verdict.module_scores.len(), 6);
        assert!(verdict.module_scores.values().all(|v| *v == 0.0));
        assert_eq!(verdict.summary(), "Document likely authentic");
        assert_eq!(verdict.raw_output, FUSION_POLICY);
    }

    #[test]
    fn risk_boundaries() {
        assert_eq!(RiskLevel::from_score(0), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(39), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(40), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_score(70), RiskLevel::Moderate);
        assert_eq!(RiskLevel::from_score(71), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(100), RiskLevel::High);
    }

    #[test]
    fn end_to_end_weighted_sum_truncates() {
        let verdict = FusionEngine::default().fuse(&scenario()).unwrap();
        assert_eq!(verdict.forgery_score, 33);
        assert_eq!(verdict.risk_level, RiskLevel::Low);
        assert_eq!(verdict.module_score(Signal::Frdetr), 0.9);
        assert_eq!(verdict.explanation["visual"], "Altered regions detected");
        assert_eq!(verdict.explanation["ocr"], "No textual anomalies");
        assert_eq!(verdict.explanation["summary"], "Document likely authentic");
    }

    #[test]
    fn truncation_not_rounding() {
        // 0.3 * 0.999 = 0.2997 → 29
        let r = results(json!({"frdetr": {"score": 0.999}}));
        let verdict = FusionEngine::default().fuse(&r).unwrap();
        assert_eq!(verdict.forgery_score, 29);
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let r = results(json!({
            "ocr": {"score": -3.0},
            "frdetr": {"score": 42.0},
        }));
        let verdict = FusionEngine::default().fuse(&r).unwrap();
        assert_eq!(verdict.module_score(Signal::Ocr), 0.0);
        assert_eq!(verdict.module_score(Signal::Frdetr), 1.0);
        assert_eq!(verdict.forgery_score, 30);
    }

    #[test]
    fn all_max_signals_reach_high() {
        let r = results(json!({
            "ocr": {"score": 1.0},
            "frdetr": {"score": 1.0},
            "diffusion": {"score": 1.0},
            "noiseprint": {"ai_score": 1.0},
            "ela": {"ela_score": 1.0},
            "copymove": {"copy_move_score": 1.0},
        }));
        let verdict = FusionEngine::default().fuse(&r).unwrap();
        assert!(verdict.forgery_score >= 99);
        assert_eq!(verdict.risk_level, RiskLevel::High);
        assert_eq!(verdict.summary(), "Document likely altered");
    }

    #[test]
    fn deterministic_serialization() {
        let engine = FusionEngine::default();
        let a = serde_json::to_vec(&engine.fuse(&scenario()).unwrap()).unwrap();
        let b = serde_json::to_vec(&engine.fuse(&scenario()).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn absent_and_null_signals_are_equivalent() {
        let engine = FusionEngine::default();
        let only_ela = results(json!({"ela": {"ela_score": 0.8}}));
        let with_null = results(json!({"ela": {"ela_score": 0.8}, "copymove": null}));
        assert_eq!(
            engine.fuse(&only_ela).unwrap(),
            engine.fuse(&with_null).unwrap()
        );
    }

    #[test]
    fn raising_one_signal_never_lowers_score() {
        let engine = FusionEngine::default();
        for signal in Signal::ALL {
            let mut previous = 0;
            for step in 0..=24 {
                let value = -0.1 + step as f64 * 0.05;
                let mut r = scenario();
                r.insert(
                    signal.key().to_string(),
                    json!({ (signal.score_field()): value }),
                );
                let score = engine.fuse(&r).unwrap().forgery_score;
                assert!(score >= previous, "{signal:?} at {value}: {score} < {previous}");
                previous = score;
            }
        }
    }

    #[test]
    fn malformed_field_is_data_integrity_error() {
        let r = results(json!({"ela": {"ela_score": "very high"}}));
        let err = FusionEngine::default().fuse(&r).unwrap_err();
        assert_eq!(err.kind(), "data_integrity");
    }

    #[test]
    fn weight_validation() {
        assert!(FusionWeights::default().validate().is_ok());

        let negative = FusionWeights { ocr: -0.1, ..FusionWeights::default() };
        assert!(negative.validate().is_err());

        let too_heavy = FusionWeights { frdetr: 0.9, ..FusionWeights::default() };
        assert!(too_heavy.validate().is_err());

        let light = FusionWeights { frdetr: 0.0, ..FusionWeights::default() };
        assert!(light.validate().is_ok());

        let nan = FusionWeights { ela: f64::NAN, ..FusionWeights::default() };
        assert!(nan.validate().is_err());
    }

    #[test]
    fn weights_are_not_renormalized() {
        let engine = FusionEngine::new(FusionWeights {
            ocr: 0.5,
            frdetr: 0.0,
            diffusion: 0.0,
            noiseprint: 0.0,
            ela: 0.0,
            copymove: 0.0,
        });
        let r = results(json!({"ocr": {"score": 1.0}}));
        assert_eq!(engine.fuse(&r).unwrap().forgery_score, 50);
    }
}
