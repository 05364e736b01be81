use serde::{Deserialize, Serialize};

/// Token usage as reported by the generator for one generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// Thresholds a prompt size is measured against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextLimits {
    pub limit_tokens: u64,
    pub optimal_max_tokens: u64,
    pub critical_max_tokens: u64,
}

impl ContextLimits {
    /// Derive thresholds for a model window. The optimal ceiling never
    /// exceeds the window and the critical ceiling never sits below it.
    pub fn for_window(limit_tokens: u64, optimal_max_tokens: u64, critical_ratio: f64) -> Self {
        let optimal = optimal_max_tokens.min(limit_tokens);
        let critical = ((limit_tokens as f64) * critical_ratio.clamp(0.0, 1.0)) as u64;
        Self {
            limit_tokens,
            optimal_max_tokens: optimal,
            critical_max_tokens: critical.max(optimal),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextHealthLevel {
    Healthy,
    Caution,
    Critical,
}

/// How full the last assembled prompt was.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextHealthSnapshot {
    Unavailable {
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Available {
        prompt_tokens: u64,
        completion_tokens: u64,
        limit_tokens: u64,
        optimal_max_tokens: u64,
        critical_max_tokens: u64,
        hard_util: f64,
        optimal_util: f64,
    },
}

impl ContextHealthSnapshot {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn measure(usage: &UsageSnapshot, limits: &ContextLimits) -> Self {
        if limits.limit_tokens == 0 {
            return Self::unavailable("model context length unknown");
        }
        let ratio = |n: u64, d: u64| if d == 0 { 0.0 } else { n as f64 / d as f64 };
        Self::Available {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            limit_tokens: limits.limit_tokens,
            optimal_max_tokens: limits.optimal_max_tokens,
            critical_max_tokens: limits.critical_max_tokens,
            hard_util: ratio(usage.prompt_tokens, limits.limit_tokens),
            optimal_util: ratio(usage.prompt_tokens, limits.optimal_max_tokens),
        }
    }

    /// Derived level; `None` when unavailable.
    pub fn level(&self) -> Option<ContextHealthLevel> {
        match self {
            Self::Unavailable { .. } => None,
            Self::Available {
                prompt_tokens,
                optimal_max_tokens,
                critical_max_tokens,
                ..
            } => Some(if prompt_tokens >= critical_max_tokens {
                ContextHealthLevel::Critical
            } else if prompt_tokens >= optimal_max_tokens {
                ContextHealthLevel::Caution
            } else {
                ContextHealthLevel::Healthy
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ContextLimits {
        ContextLimits::for_window(200_000, 100_000, 0.9)
    }

    fn usage(prompt: u64) -> UsageSnapshot {
        UsageSnapshot {
            prompt_tokens: prompt,
            completion_tokens: 10,
            total_tokens: None,
        }
    }

    #[test]
    fn limits_clamp_to_window() {
        let l = ContextLimits::for_window(50_000, 100_000, 0.9);
        assert_eq!(l.optimal_max_tokens, 50_000);
        assert_eq!(l.critical_max_tokens, 50_000);
    }

    #[test]
    fn level_thresholds() {
        let l = limits();
        assert_eq!(ContextHealthSnapshot::measure(&usage(10), &l).level(), Some(ContextHealthLevel::Healthy));
        assert_eq!(ContextHealthSnapshot::measure(&usage(100_000), &l).level(), Some(ContextHealthLevel::Caution));
        assert_eq!(ContextHealthSnapshot::measure(&usage(180_000), &l).level(), Some(ContextHealthLevel::Critical));
    }

    #[test]
    fn utilisation_ratios() {
        match ContextHealthSnapshot::measure(&usage(50_000), &limits()) {
            ContextHealthSnapshot::Available { hard_util, optimal_util, .. } => {
                assert!((hard_util - 0.25).abs() < f64::EPSILON);
                assert!((optimal_util - 0.5).abs() < f64::EPSILON);
            }
            other => panic!("unexpected snapshot: {other:?}"),
        }
    }

    #[test]
    fn zero_window_is_unavailable() {
        let l = ContextLimits::for_window(0, 100, 0.9);
        let snap = ContextHealthSnapshot::measure(&usage(1), &l);
        assert_eq!(snap.level(), None);
    }

    #[test]
    fn snapshot_serializes_kind_tag() {
        let json = serde_json::to_value(ContextHealthSnapshot::unavailable("no usage")).unwrap();
        assert_eq!(json["kind"], "unavailable");
        assert_eq!(json["reason"], "no usage");
    }
}
