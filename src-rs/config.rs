use crate::error::SetupError;
use crate::regions::RegionParams;
use crate::retry::{Backoff, RetryPolicy};
use crate::scorer::{RoundingPolicy, ScoreScale};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MAX_ROUNDS_LIMIT: u32 = 7;
pub const PROMPT_CHAR_LIMIT: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorMode {
    /// Local region heuristic.
    Pixel,
    /// The generating model grades its own output.
    SelfCritique,
    /// A second model grades the output.
    Judge,
    Composite,
}

impl EvaluatorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluatorMode::Pixel => "pixel",
            EvaluatorMode::SelfCritique => "self_critique",
            EvaluatorMode::Judge => "judge",
            EvaluatorMode::Composite => "composite",
        }
    }

    /// Modes whose generation prompts carry a rolling window of past feedback.
    pub fn uses_feedback_history(&self) -> bool {
        matches!(self, EvaluatorMode::Pixel | EvaluatorMode::SelfCritique)
    }
}

/// Which earlier round a follow-up generation builds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchPolicy {
    FromLast,
    FromBest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_rounds: u32,
    pub target_score: f64,
    pub score_scale: ScoreScale,
    pub evaluator: EvaluatorMode,
    pub branch_policy: BranchPolicy,
    pub rounding: RoundingPolicy,
    pub custom_prompt: Option<String>,
    pub judge_prompt: Option<String>,
    pub composite_pixel_weight: f64,
    pub history_window: usize,
    pub repair: RetryPolicy,
    pub gateway: RetryPolicy,
    pub render_timeout_ms: u64,
    pub gateway_timeout_ms: u64,
    pub scoring_timeout_ms: u64,
    pub region: RegionParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            target_score: 85.0,
            score_scale: ScoreScale::Hundred,
            evaluator: EvaluatorMode::Pixel,
            branch_policy: BranchPolicy::FromLast,
            rounding: RoundingPolicy::Preserve,
            custom_prompt: None,
            judge_prompt: None,
            composite_pixel_weight: 0.5,
            history_window: 3,
            repair: RetryPolicy::default(),
            gateway: RetryPolicy::new(
                2,
                Backoff::Linear {
                    base_ms: 1000,
                    jitter_ms: 250,
                },
            ),
            render_timeout_ms: 10_000,
            gateway_timeout_ms: 300_000,
            scoring_timeout_ms: 300_000,
            region: RegionParams::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, SetupError> {
        let config: SessionConfig = serde_json::from_str(raw)
            .map_err(|err| SetupError::InvalidConfig(format!("invalid config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SetupError> {
        let invalid = |msg: String| Err(SetupError::InvalidConfig(msg));

        if self.max_rounds == 0 || self.max_rounds > MAX_ROUNDS_LIMIT {
            return invalid(format!(
                "max_rounds must be within 1..={MAX_ROUNDS_LIMIT}, got {}",
                self.max_rounds
            ));
        }
        let max = self.score_scale.max();
        if !self.target_score.is_finite() || self.target_score < 0.0 || self.target_score > max {
            return invalid(format!(
                "target_score must be within 0..={max} on the {} scale, got {}",
                self.score_scale.as_str(),
                self.target_score
            ));
        }
        for (field, prompt) in [
            ("custom_prompt", &self.custom_prompt),
            ("judge_prompt", &self.judge_prompt),
        ] {
            if let Some(text) = prompt {
                let len = text.chars().count();
                if len > PROMPT_CHAR_LIMIT {
                    return invalid(format!("{field} is {len} chars, limit is {PROMPT_CHAR_LIMIT}"));
                }
            }
        }
        if !(0.0..=1.0).contains(&self.composite_pixel_weight) {
            return invalid(format!(
                "composite_pixel_weight must be within 0..=1, got {}",
                self.composite_pixel_weight
            ));
        }
        if self.repair.max_attempts > 10 {
            return invalid(format!("repair.max_attempts above 10: {}", self.repair.max_attempts));
        }
        if self.gateway.max_attempts == 0 {
            return invalid("gateway.max_attempts must be at least 1".to_string());
        }
        if self.region.sampling_step == 0 {
            return invalid("region.sampling_step must be at least 1".to_string());
        }
        if self.render_timeout_ms == 0
            || self.gateway_timeout_ms == 0
            || self.scoring_timeout_ms == 0
        {
            return invalid("timeouts must be positive".to_string());
        }
        Ok(())
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_millis(self.render_timeout_ms)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    pub fn scoring_timeout(&self) -> Duration {
        Duration::from_millis(self.scoring_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_bound_rounds() {
        for rounds in [0, MAX_ROUNDS_LIMIT + 1] {
            let config = SessionConfig {
                max_rounds: rounds,
                ..SessionConfig::default()
            };
            assert!(config.validate().is_err(), "rounds {rounds}");
        }
    }

    #[test]
    fn target_score_is_bounded_by_scale() {
        let config = SessionConfig {
            score_scale: ScoreScale::Ten,
            target_score: 11.0,
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            score_scale: ScoreScale::Twenty,
            target_score: 18.0,
            ..SessionConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn rejects_oversize_prompt() {
        let config = SessionConfig {
            custom_prompt: Some("x".repeat(PROMPT_CHAR_LIMIT + 1)),
            ..SessionConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("custom_prompt"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = SessionConfig::from_json_str(
            r#"{
                "max_rounds": 3,
                "evaluator": "composite",
                "branch_policy": "from_best",
                "score_scale": "twenty",
                "target_score": 15
            }"#,
        )
        .unwrap();
        assert_eq!(config.max_rounds, 3);
        assert_eq!(config.evaluator, EvaluatorMode::Composite);
        assert_eq!(config.branch_policy, BranchPolicy::FromBest);
        assert_eq!(config.history_window, 3);
        assert_eq!(config.region, RegionParams::default());
    }

    #[test]
    fn malformed_json_is_a_setup_error() {
        assert!(matches!(
            SessionConfig::from_json_str("{").unwrap_err(),
            SetupError::InvalidConfig(_)
        ));
    }
}
