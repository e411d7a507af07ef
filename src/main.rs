//! # rapport
//!
//! Command-line entry point. Loads settings, initializes logging, opens the
//! usage database and runs one analysis or quota query per invocation.

#![deny(unsafe_code)]

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rapport_core::analysis::{AnalysisRequest, ConversationType};
use rapport_core::identity::Identity;
use rapport_core::ids::DeviceId;
use rapport_core::provider::ReasoningProvider;
use rapport_core::security::ApiKey;
use rapport_core::tier::Tier;
use rapport_engine::{AnalysisService, AnalyzerConfig, ConversationAnalyzer, QuotaLedger, ServiceError};
use rapport_llm::{ChatCompletionsProvider, ReliableConfig, ReliableProvider};
use rapport_settings::{ProviderSettings, RapportSettings};
use rapport_store::{Database, SqliteUsageStore};
use rapport_telemetry::TelemetryConfig;

const IN_MEMORY_DB: &str = ":memory:";

#[derive(Parser, Debug)]
#[command(name = "rapport", about = "Tiered conversation analysis with usage quotas")]
struct Cli {
    /// Settings file (default: ~/.rapport/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Usage database path, overriding the settings file.
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze a conversation read from a file or stdin.
    Analyze(AnalyzeArgs),
    /// Show remaining quota for an identity.
    Usage(IdentityArgs),
    /// Print a fresh anonymous device id.
    DeviceId,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Conversation transcript. Reads stdin when omitted.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Comma-separated participant labels as they appear in the transcript.
    #[arg(long, value_delimiter = ',', required = true)]
    participants: Vec<String>,

    /// Treat the transcript as a group conversation.
    #[arg(long)]
    group: bool,

    /// Ask for a lower detail level than the user is entitled to.
    #[arg(long)]
    detail: Option<String>,

    #[command(flatten)]
    identity: IdentityArgs,
}

#[derive(Args, Debug)]
struct IdentityArgs {
    /// Registered user id.
    #[arg(long, conflicts_with = "device", required_unless_present = "device")]
    user: Option<String>,

    /// Anonymous device id.
    #[arg(long)]
    device: Option<String>,

    /// Tier the registered user pays for.
    #[arg(long, default_value = "free", requires = "user")]
    tier: Tier,
}

impl IdentityArgs {
    fn identity(&self) -> Identity {
        match (&self.user, &self.device) {
            (Some(user), _) => Identity::user(user.clone(), self.tier),
            (None, Some(device)) => Identity::device(device.clone()),
            // clap enforces exactly one of the two
            (None, None) => Identity::device(DeviceId::new().to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();

    if matches!(args.command, Command::DeviceId) {
        println!("{}", DeviceId::new());
        return Ok(ExitCode::SUCCESS);
    }

    let mut settings = match &args.settings {
        Some(path) => rapport_settings::load_settings_from_path(path),
        None => rapport_settings::load_settings(),
    }
    .context("Failed to load settings")?;
    if let Some(db_path) = args.db_path.clone() {
        settings.store.db_path = db_path;
    }

    let telemetry = TelemetryConfig {
        json: settings.logging.json,
        ..TelemetryConfig::default()
    }
    .with_level_str(&settings.logging.level);
    rapport_telemetry::init_telemetry(&telemetry).context("Failed to initialize logging")?;

    let service = build_service(&settings)?;

    match args.command {
        Command::Analyze(analyze) => run_analyze(&service, analyze).await,
        Command::Usage(who) => {
            let status = service.usage(&who.identity());
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::DeviceId => Ok(ExitCode::SUCCESS),
    }
}

fn build_service(settings: &RapportSettings) -> Result<AnalysisService> {
    let db = if settings.store.db_path == IN_MEMORY_DB {
        Database::in_memory()
    } else {
        Database::open(Path::new(&settings.store.db_path))
    }
    .with_context(|| format!("Failed to open usage database at {}", settings.store.db_path))?;
    let ledger = QuotaLedger::new(Arc::new(SqliteUsageStore::new(db)));

    let provider = build_provider(&settings.provider)?;
    let config = AnalyzerConfig {
        timeout: Duration::from_millis(settings.provider.timeout_ms),
    };

    Ok(AnalysisService::new(ledger, ConversationAnalyzer::new(provider, config)))
}

fn build_provider(settings: &ProviderSettings) -> Result<Option<Arc<dyn ReasoningProvider>>> {
    let Some(key) = settings.api_key.as_deref().filter(|_| settings.is_configured()) else {
        info!("no reasoning provider configured, using heuristic analysis");
        return Ok(None);
    };

    let chat = ChatCompletionsProvider::new(ApiKey::new(key), &settings.base_url, &settings.model)
        .context("Failed to build reasoning provider")?;
    let reliable = ReliableProvider::new(chat, reliable_config(settings));
    info!(model = %settings.model, base_url = %settings.base_url, "reasoning provider ready");
    Ok(Some(Arc::new(reliable)))
}

fn reliable_config(settings: &ProviderSettings) -> ReliableConfig {
    ReliableConfig {
        max_retries: settings.max_retries,
        base_delay: Duration::from_millis(settings.base_delay_ms),
        circuit_breaker_threshold: settings.circuit_breaker_threshold,
        circuit_breaker_cooldown: Duration::from_millis(settings.circuit_breaker_cooldown_ms),
        ..ReliableConfig::default()
    }
}

async fn run_analyze(service: &AnalysisService, args: AnalyzeArgs) -> Result<ExitCode> {
    let text = read_conversation(args.file.as_ref())?;
    let identity = args.identity.identity();
    if identity.is_anonymous() && args.detail.is_some() {
        warn!("--detail is ignored for anonymous devices");
    }
    let requested = args
        .detail
        .unwrap_or_else(|| identity.entitled_tier().as_str().to_string());

    // participant count is checked by request validation
    let request = AnalysisRequest {
        conversation_text: text,
        participant_labels: args.participants,
        tier: requested,
        conversation_type: if args.group {
            ConversationType::Group
        } else {
            ConversationType::Dyad
        },
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling analysis");
            on_interrupt.cancel();
        }
    });

    match service.analyze(&identity, &request, &cancel).await {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&error_body(&err))?);
            Ok(exit_code_for(&err))
        }
    }
}

fn read_conversation(file: Option<&PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read conversation from {}", path.display())),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read conversation from stdin")?;
            Ok(text)
        }
    }
}

fn error_body(err: &ServiceError) -> serde_json::Value {
    let mut body = json!({ "error": err.error_kind() });
    if err.is_user_facing() {
        body["message"] = json!(err.to_string());
    }
    if let Some(status) = err.quota_status() {
        body["usage"] = json!(status);
    }
    body
}

fn exit_code_for(err: &ServiceError) -> ExitCode {
    match err {
        ServiceError::InvalidRequest(_) => ExitCode::from(2),
        ServiceError::QuotaExceeded(_) => ExitCode::from(3),
        ServiceError::Cancelled => ExitCode::from(130),
    }
}
