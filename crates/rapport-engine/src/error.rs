use rapport_core::errors::RequestError;
use rapport_core::usage::QuotaStatus;

/// Errors returned to callers of [`crate::AnalysisService`].
///
/// Provider failures never appear here: the analyzer absorbs them and serves
/// the heuristic result instead.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("analysis quota exceeded ({} of {} used)", .0.used, .0.limit)]
    QuotaExceeded(QuotaStatus),

    #[error("request cancelled")]
    Cancelled,
}

impl ServiceError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the message should be shown to the end user as-is.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::QuotaExceeded(_))
    }

    pub fn quota_status(&self) -> Option<QuotaStatus> {
        match self {
            Self::QuotaExceeded(status) => Some(*status),
            _ => None,
        }
    }
}
