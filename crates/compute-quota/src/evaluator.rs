//! Quota evaluation.

use std::sync::Arc;

use tracing::debug;

use crate::source::{QuotaResource, QuotaSource};
use crate::{QuotaError, QuotaResult};

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub limit: u64,
    pub current: u64,
    pub requested: u64,
}

impl QuotaDecision {
    /// Admit `requested` more on top of `current` if the total stays within
    /// `limit`. Requesting nothing is always admitted.
    pub fn evaluate(limit: u64, current: u64, requested: u64) -> Self {
        let allowed = requested == 0 || current.saturating_add(requested) <= limit;
        Self {
            allowed,
            limit,
            current,
            requested,
        }
    }
}

/// Resolves limits from a [`QuotaSource`] and evaluates requests.
///
/// Cheap to clone; services share one evaluator.
#[derive(Debug, Clone)]
pub struct QuotaEvaluator {
    source: Arc<QuotaSource>,
}

impl QuotaEvaluator {
    pub fn new(source: QuotaSource) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// The limit for `resource` in the account. Undefined limits are zero.
    pub async fn limit(&self, cloud_account_id: &str, resource: &QuotaResource) -> QuotaResult<u64> {
        let limit = self
            .source
            .lookup(cloud_account_id, resource)
            .await
            .map_err(|e| QuotaError::Lookup(e.to_string()))?;
        Ok(limit.unwrap_or(0))
    }

    /// Check whether `requested` more of `resource` fit next to `current`.
    pub async fn check_quota(
        &self,
        cloud_account_id: &str,
        resource: &QuotaResource,
        current: u64,
        requested: u64,
    ) -> QuotaResult<QuotaDecision> {
        let limit = self.limit(cloud_account_id, resource).await?;
        let decision = QuotaDecision::evaluate(limit, current, requested);
        debug!(
            %cloud_account_id,
            %resource,
            limit,
            current,
            requested,
            allowed = decision.allowed,
            "quota evaluated"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::source::QuotaTable;

    fn evaluator(limit: u64) -> QuotaEvaluator {
        let mut system_default = BTreeMap::new();
        system_default.insert("instances/vm-small".to_string(), limit);
        QuotaEvaluator::new(QuotaSource::StaticMap(QuotaTable {
            system_default,
            ..Default::default()
        }))
    }

    #[test]
    fn boundary() {
        assert!(QuotaDecision::evaluate(3, 2, 1).allowed);
        assert!(!QuotaDecision::evaluate(3, 3, 1).allowed);
        assert!(!QuotaDecision::evaluate(3, 0, 4).allowed);
        assert!(QuotaDecision::evaluate(0, 5, 0).allowed);
    }

    #[tokio::test]
    async fn batch_is_checked_as_a_whole() {
        let eval = evaluator(4);
        let small = QuotaResource::instances("vm-small");

        let fits = eval.check_quota("123456789012", &small, 1, 3).await.unwrap();
        assert!(fits.allowed);
        assert_eq!(fits.limit, 4);

        let over = eval.check_quota("123456789012", &small, 1, 4).await.unwrap();
        assert!(!over.allowed);
    }

    #[tokio::test]
    async fn undefined_limit_is_zero() {
        let eval = evaluator(4);
        let decision = eval
            .check_quota("123456789012", &QuotaResource::instances("bm-large"), 0, 1)
            .await
            .unwrap();
        assert_eq!(decision.limit, 0);
        assert!(!decision.allowed);
    }
}
