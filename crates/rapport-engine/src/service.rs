use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use rapport_core::analysis::{AnalysisRequest, AnalysisResult};
use rapport_core::identity::Identity;
use rapport_core::tier::Tier;
use rapport_core::usage::QuotaStatus;

use crate::analyzer::ConversationAnalyzer;
use crate::error::ServiceError;
use crate::quota::{AdmitDecision, QuotaLedger};
use crate::shaper::shape;

/// What a caller gets back for one successful analysis.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse {
    pub result: AnalysisResult,
    /// Tier the result was produced and shaped for.
    pub tier: Tier,
    /// Quota after this analysis was counted.
    pub usage: QuotaStatus,
}

/// Single entry point tying validation, quota, analysis and shaping together.
pub struct AnalysisService {
    ledger: QuotaLedger,
    analyzer: ConversationAnalyzer,
}

impl AnalysisService {
    pub fn new(ledger: QuotaLedger, analyzer: ConversationAnalyzer) -> Self {
        Self { ledger, analyzer }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn analyzer(&self) -> &ConversationAnalyzer {
        &self.analyzer
    }

    /// Tier an analysis runs at. Anonymous callers are always `anonymous`;
    /// registered users may ask for less detail than they pay for, never more.
    pub fn effective_tier(identity: &Identity, requested: &str) -> Tier {
        match identity {
            Identity::AnonymousDevice { .. } => Tier::Anonymous,
            Identity::RegisteredUser { tier: entitled, .. } => {
                let requested = Tier::parse_lossy(requested);
                if requested.policy().detail_level <= entitled.policy().detail_level {
                    requested
                } else {
                    *entitled
                }
            }
        }
    }

    #[instrument(skip_all, fields(identity = %identity.key()))]
    pub async fn analyze(
        &self,
        identity: &Identity,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResponse, ServiceError> {
        request.validate()?;

        let tier = Self::effective_tier(identity, &request.tier);
        let request = request.clone().with_tier(tier.as_str());

        let decision = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ServiceError::Cancelled),
            decision = self.ledger.admit(identity) => decision,
        };
        let admission = match decision {
            AdmitDecision::Allowed(admission) => admission,
            AdmitDecision::Denied(status) => {
                info!(used = status.used, limit = %status.limit, "quota exceeded");
                return Err(ServiceError::QuotaExceeded(status));
            }
        };

        let result = self.analyzer.analyze_with_cancel(&request, cancel).await;
        if cancel.is_cancelled() {
            info!("caller cancelled, usage not counted");
            return Err(ServiceError::Cancelled);
        }

        let usage = admission.commit();
        let result = shape(result, tier);

        info!(
            tier = tier.as_str(),
            source = ?result.source,
            used = usage.used,
            limit = %usage.limit,
            "analysis served"
        );

        Ok(AnalysisResponse {
            result,
            tier,
            usage,
        })
    }

    /// Current quota status without consuming anything.
    pub fn usage(&self, identity: &Identity) -> QuotaStatus {
        self.ledger.status(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rapport_core::tier::{DetailLevel, QuotaLimit};
    use rapport_store::InMemoryUsageStore;

    use crate::fallback::FallbackAnalyzer;

    fn service() -> AnalysisService {
        AnalysisService::new(
            QuotaLedger::new(Arc::new(InMemoryUsageStore::new())),
            ConversationAnalyzer::fallback_only(),
        )
    }

    #[test]
    fn effective_tier_rules() {
        let device = Identity::device("d1");
        assert_eq!(AnalysisService::effective_tier(&device, "beta"), Tier::Anonymous);

        let free = Identity::user("u1", Tier::Free);
        assert_eq!(AnalysisService::effective_tier(&free, "pro"), Tier::Free);
        assert_eq!(AnalysisService::effective_tier(&free, "nonsense"), Tier::Free);

        let pro = Identity::user("u2", Tier::Pro);
        assert_eq!(AnalysisService::effective_tier(&pro, "personal"), Tier::Personal);
        assert_eq!(AnalysisService::effective_tier(&pro, "beta"), Tier::Beta);
        assert_eq!(AnalysisService::effective_tier(&pro, " PRO "), Tier::Pro);
    }

    #[tokio::test]
    async fn invalid_request_does_not_touch_quota() {
        let svc = service();
        let user = Identity::user("u1", Tier::Free);
        let bad = AnalysisRequest::dyad("  ", "A", "B", "free");

        let err = svc.analyze(&user, &bad, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.error_kind(), "invalid_request");
        assert_eq!(svc.usage(&user).used, 0);
    }

    #[tokio::test]
    async fn successful_analysis_counts_once() {
        let svc = service();
        let user = Identity::user("u1", Tier::Personal);
        let req = AnalysisRequest::dyad("A: thanks!\nB: you're welcome", "A", "B", "personal");

        let resp = svc.analyze(&user, &req, &CancellationToken::new()).await.unwrap();
        assert_eq!(resp.tier, Tier::Personal);
        assert_eq!(resp.usage.used, 1);
        assert_eq!(resp.usage.limit, QuotaLimit::Limited(10));
        assert_eq!(resp.usage.remaining, Some(9));
        assert_eq!(svc.usage(&user).used, 1);
    }

    #[tokio::test]
    async fn already_cancelled_request_is_not_counted() {
        let svc = service();
        let user = Identity::user("u1", Tier::Free);
        let req = AnalysisRequest::dyad("A: hi\nB: hey", "A", "B", "free");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = svc.analyze(&user, &req, &cancel).await.unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled));
        assert_eq!(svc.usage(&user).used, 0);
    }

    #[test]
    fn response_wire_format() {
        let resp = AnalysisResponse {
            result: FallbackAnalyzer::new()
                .analyze(&AnalysisRequest::dyad("A: hi", "A", "B", "free"), DetailLevel::Basic),
            tier: Tier::Free,
            usage: QuotaStatus::evaluate(1, QuotaLimit::Limited(2)),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["tier"], "free");
        assert_eq!(json["usage"]["remaining"], 1);
        assert!(json["result"].get("toneAnalysis").is_some());
    }
}
