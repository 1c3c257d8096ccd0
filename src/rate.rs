//! Per-policy results and the overall decision handed back to the caller.

use serde::Serialize;

/// Value reported for an exhausted bucket or quota
pub const EXHAUSTED: i64 = -1;

/// Result of evaluating one policy for one request.
///
/// Fields stay `None` when the policy does not configure the matching limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Rate {
    pub key: String,
    /// Burst tokens left, [`EXHAUSTED`] when the request found the bucket empty
    pub remaining: Option<i64>,
    /// Seconds until the bucket gains its next token
    pub reset_secs: Option<u64>,
    /// Quota left in milliseconds, [`EXHAUSTED`] once used up
    pub remaining_quota_millis: Option<i64>,
    /// Milliseconds until the quota window resets
    pub reset_quota_millis: Option<u64>,
}

impl Rate {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn is_burst_exhausted(&self) -> bool {
        self.remaining == Some(EXHAUSTED)
    }

    pub fn is_quota_exhausted(&self) -> bool {
        self.remaining_quota_millis == Some(EXHAUSTED)
    }

    pub fn is_exhausted(&self) -> bool {
        self.is_burst_exhausted() || self.is_quota_exhausted()
    }
}

/// Outcome of evaluating every applicable policy for a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// One entry per applicable policy, in evaluation order
    pub rates: Vec<Rate>,
    pub allowed: bool,
    /// Key of the first exhausted rate
    pub denied_by: Option<String>,
}

impl Decision {
    pub fn from_rates(rates: Vec<Rate>) -> Self {
        let denied_by = rates
            .iter()
            .find(|rate| rate.is_exhausted())
            .map(|rate| rate.key.clone());
        Self {
            allowed: denied_by.is_none(),
            rates,
            denied_by,
        }
    }

    pub fn rate(&self, key: &str) -> Option<&Rate> {
        self.rates.iter().find(|rate| rate.key == key)
    }

    pub fn denied_rate(&self) -> Option<&Rate> {
        self.denied_by.as_deref().and_then(|key| self.rate(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_flags() {
        let mut rate = Rate::new("k");
        assert!(!rate.is_exhausted());

        rate.remaining = Some(0);
        assert!(!rate.is_exhausted());

        rate.remaining = Some(EXHAUSTED);
        assert!(rate.is_burst_exhausted());

        let mut rate = Rate::new("q");
        rate.remaining_quota_millis = Some(EXHAUSTED);
        assert!(rate.is_quota_exhausted() && rate.is_exhausted());
    }

    #[test]
    fn test_decision_names_first_denying_key() {
        let ok = Rate {
            remaining: Some(3),
            ..Rate::new("a")
        };
        let denied = Rate {
            remaining_quota_millis: Some(EXHAUSTED),
            ..Rate::new("b")
        };
        let also_denied = Rate {
            remaining: Some(EXHAUSTED),
            ..Rate::new("c")
        };

        let decision = Decision::from_rates(vec![ok, denied, also_denied]);
        assert!(!decision.allowed);
        assert_eq!(decision.denied_by.as_deref(), Some("b"));
        assert_eq!(decision.denied_rate().unwrap().key, "b");
    }

    #[test]
    fn test_decision_serializes() {
        let decision = Decision::from_rates(vec![Rate {
            remaining: Some(1),
            reset_secs: Some(30),
            ..Rate::new("gateway:serviceA")
        }]);
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["allowed"], true);
        assert_eq!(json["rates"][0]["remaining"], 1);
        assert!(json["rates"][0]["remaining_quota_millis"].is_null());
    }
}
