pub mod analyzer;
pub mod error;
pub mod fallback;
pub mod prompts;
pub mod quota;
pub mod service;
pub mod shaper;

pub use analyzer::{AnalyzerConfig, ConversationAnalyzer, Strategy};
pub use error::ServiceError;
pub use fallback::FallbackAnalyzer;
pub use quota::{AdmitDecision, Admission, QuotaLedger};
pub use service::{AnalysisResponse, AnalysisService};
pub use shaper::{shape, shape_for};
