// # fireflowd - FireFlow Daemon
//
// Thin integration layer: all reconciliation logic lives in fireflow-core.
//
// The daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing tracing and the runtime
// 3. Registering providers and opening the rules file
// 4. Restoring the schedule and waiting for a shutdown signal
//
// ## Configuration
//
// ### Storage
// - `FIREFLOW_RULES_PATH`: rules, credentials and settings file
//   (default `/var/lib/fireflow/rules.json`)
//
// ### Address source
// - `FIREFLOW_IP_FETCH_URL`: IP-echo endpoint (stored as `ip_fetch_url`)
//
// ### Schedule
// - `FIREFLOW_SCHEDULE_ENABLED`: `true`/`false` (stored as `cron_enabled`)
// - `FIREFLOW_SCHEDULE_MINUTES`: 1-1440 (stored as `ip_check_interval`)
//
// Set variables overwrite the stored settings at boot; unset ones leave
// them alone.
//
// ### Engine
// - `FIREFLOW_CALL_TIMEOUT_SECS`: bound on each network call (1-300, default 30)
// - `FIREFLOW_RUN_ONCE`: run one pass and exit
//
// ### Tencent Cloud
// - `FIREFLOW_TENCENT_SECRET_ID` / `FIREFLOW_TENCENT_SECRET_KEY`: default credentials
// - `FIREFLOW_TENCENT_REGION`: default `ap-beijing`
//
// ## Example
//
// ```bash
// export FIREFLOW_TENCENT_SECRET_ID=AKID...
// export FIREFLOW_TENCENT_SECRET_KEY=...
// export FIREFLOW_SCHEDULE_ENABLED=true
// export FIREFLOW_SCHEDULE_MINUTES=10
//
// fireflowd
// ```

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use fireflow_core::admin::parse_flag;
use fireflow_core::config::{DEFAULT_ADDRESS_SOURCE_URL, keys, validate_interval_minutes};
use fireflow_core::engine::EngineEvent;
use fireflow_core::registry::ALIYUN;
use fireflow_core::traits::ConfigSource;
use fireflow_core::{
    AdminService, CloudCredentials, EnginePassTask, FileRuleRepository, FireflowConfig,
    PassScheduler, ProviderRegistry, ReconciliationEngine,
};
use fireflow_ip_http::HttpAddressSource;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

const DEFAULT_RULES_PATH: &str = "/var/lib/fireflow/rules.json";
const TENCENT_PROVIDER: &str = "TencentCloud";
const DEFAULT_TENCENT_REGION: &str = "ap-beijing";

/// How long shutdown waits for an in-flight pass
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum FireflowExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<FireflowExitCode> for ExitCode {
    fn from(code: FireflowExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration
#[derive(Debug)]
struct Config {
    rules_path: PathBuf,
    ip_fetch_url: Option<String>,
    schedule_enabled: Option<bool>,
    schedule_minutes: Option<u32>,
    call_timeout_secs: u64,
    tencent: Option<CloudCredentials>,
    run_once: bool,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`; empty values count as unset
    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let schedule_minutes = get("FIREFLOW_SCHEDULE_MINUTES")
            .map(|v| {
                v.parse::<u32>()
                    .with_context(|| format!("FIREFLOW_SCHEDULE_MINUTES is not a number: {}", v))
            })
            .transpose()?;

        let call_timeout_secs = get("FIREFLOW_CALL_TIMEOUT_SECS")
            .map(|v| {
                v.parse::<u64>()
                    .with_context(|| format!("FIREFLOW_CALL_TIMEOUT_SECS is not a number: {}", v))
            })
            .transpose()?
            .unwrap_or(30);

        let tencent = match (
            get("FIREFLOW_TENCENT_SECRET_ID"),
            get("FIREFLOW_TENCENT_SECRET_KEY"),
        ) {
            (Some(id), Some(key)) => Some(
                CloudCredentials::new(TENCENT_PROVIDER, id, key).with_region(
                    get("FIREFLOW_TENCENT_REGION")
                        .unwrap_or_else(|| DEFAULT_TENCENT_REGION.to_string()),
                ),
            ),
            (None, None) => None,
            _ => anyhow::bail!(
                "FIREFLOW_TENCENT_SECRET_ID and FIREFLOW_TENCENT_SECRET_KEY must be set together"
            ),
        };

        Ok(Self {
            rules_path: PathBuf::from(
                get("FIREFLOW_RULES_PATH").unwrap_or_else(|| DEFAULT_RULES_PATH.to_string()),
            ),
            ip_fetch_url: get("FIREFLOW_IP_FETCH_URL"),
            schedule_enabled: get("FIREFLOW_SCHEDULE_ENABLED").map(|v| parse_flag(&v)),
            schedule_minutes,
            call_timeout_secs,
            tencent,
            run_once: get("FIREFLOW_RUN_ONCE").is_some_and(|v| parse_flag(&v)),
            log_level: get("FIREFLOW_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if let Some(url) = &self.ip_fetch_url
            && !url.starts_with("https://")
            && !url.starts_with("http://")
        {
            anyhow::bail!(
                "FIREFLOW_IP_FETCH_URL must use HTTP or HTTPS scheme. Got: {}",
                url
            );
        }

        if let Some(minutes) = self.schedule_minutes {
            validate_interval_minutes(minutes)
                .map_err(|e| anyhow::anyhow!("FIREFLOW_SCHEDULE_MINUTES: {}", e))?;
        }

        if let Some(creds) = &self.tencent {
            let id = creds.secret_id.to_lowercase();
            if id.contains("your_secret") || id.contains("replace_me") || id == "akid" {
                anyhow::bail!(
                    "FIREFLOW_TENCENT_SECRET_ID appears to be a placeholder. \
                    Use a real API key from the Tencent Cloud console."
                );
            }
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "FIREFLOW_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        self.fireflow_config().validate()?;
        Ok(())
    }

    /// Core configuration derived from the environment
    fn fireflow_config(&self) -> FireflowConfig {
        let mut config = FireflowConfig::new();
        config.address.default_url = DEFAULT_ADDRESS_SOURCE_URL.to_string();
        config.engine.call_timeout_secs = self.call_timeout_secs;
        config.credentials = self.tencent.iter().cloned().collect();
        config
    }

    /// Settings that overwrite the stored keys at boot
    fn setting_overrides(&self) -> Vec<(&'static str, String)> {
        let mut overrides = Vec::new();
        if let Some(url) = &self.ip_fetch_url {
            overrides.push((keys::IP_FETCH_URL, url.clone()));
        }
        if let Some(enabled) = self.schedule_enabled {
            overrides.push((keys::SCHEDULE_ENABLED, enabled.to_string()));
        }
        if let Some(minutes) = self.schedule_minutes {
            overrides.push((keys::SCHEDULE_INTERVAL_MINUTES, minutes.to_string()));
        }
        overrides
    }

    fn log_level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return FireflowExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return FireflowExitCode::ConfigError.into();
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return FireflowExitCode::ConfigError.into();
    }

    info!("Starting fireflowd");

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return FireflowExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config).await {
            error!("Daemon error: {:#}", e);
            FireflowExitCode::RuntimeError
        } else {
            FireflowExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon
async fn run_daemon(config: Config) -> Result<()> {
    let core_config = config.fireflow_config();

    let registry = Arc::new(ProviderRegistry::new());

    #[cfg(feature = "tencent")]
    {
        info!("Registering Tencent Cloud provider");
        fireflow_provider_tencent::register_with_timeout(
            &registry,
            core_config.engine.call_timeout(),
        );
    }

    registry.register_unimplemented(ALIYUN);

    let store = Arc::new(
        FileRuleRepository::open(&config.rules_path)
            .await
            .with_context(|| format!("opening {}", config.rules_path.display()))?,
    );
    info!("Rules file: {}", store.path().display());

    for (key, value) in config.setting_overrides() {
        store.set_string(key, &value).await?;
        info!("Setting {} from environment", key);
    }

    for credentials in &core_config.credentials {
        let installed = store.set_default_credentials(credentials.clone()).await?;
        info!(
            "Default {} credentials: {} (record {:?})",
            installed.provider,
            installed.masked_secret_id(),
            installed.id
        );
    }

    let address_source = Arc::new(HttpAddressSource::from_config(&core_config)?);

    let (engine, events) = ReconciliationEngine::new(
        address_source,
        store.clone(),
        store.clone(),
        registry,
        &core_config,
    )?;
    let engine = Arc::new(engine);

    tokio::spawn(log_events(events));

    let scheduler = Arc::new(PassScheduler::new(Arc::new(EnginePassTask::new(
        Arc::clone(&engine),
    ))));
    let admin = AdminService::new(
        Arc::clone(&engine),
        Arc::clone(&scheduler),
        store.clone(),
        store.clone(),
    );

    info!("{} enabled rule(s)", admin.enabled_rule_count().await?);

    if config.run_once {
        let summary = admin.run_now().await?;
        info!("Single pass finished: {}", summary.summary);
        return Ok(());
    }

    let state = admin.schedule_state().await;
    if admin.restore_schedule().await? {
        info!("Scheduled passes every {} minute(s)", state.interval_minutes);
    }

    info!("Daemon initialized successfully");

    let signal = wait_for_shutdown().await?;
    info!("Received shutdown signal: {}", signal);

    scheduler.disable();
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, engine.wait_idle())
        .await
        .is_err()
    {
        warn!(
            "In-flight pass did not finish within {:?}; exiting anyway",
            SHUTDOWN_DRAIN_TIMEOUT
        );
    }

    info!("Shutting down daemon");
    Ok(())
}

/// Log engine events until the engine is dropped
async fn log_events(mut events: tokio::sync::mpsc::Receiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::PassStarted { started_at } => {
                info!("Pass started at {}", started_at.to_rfc3339())
            }
            EngineEvent::RuleReconciled {
                rule_id,
                label,
                state,
                remote_handle,
            } => match remote_handle {
                Some(handle) => info!("Rule {} ({}): {} [{}]", rule_id, label, state, handle),
                None => info!("Rule {} ({}): {}", rule_id, label, state),
            },
            EngineEvent::RuleFailed {
                rule_id,
                label,
                error,
            } => error!("Rule {} ({}) failed: {}", rule_id, label, error),
            EngineEvent::PassFinished {
                address,
                total,
                touched,
                failed,
            } => info!(
                "Pass finished for {}: {} rule(s), {} touched, {} failed",
                address, total, touched, failed
            ),
            EngineEvent::PassAborted { error } => error!("Pass aborted: {}", error),
            EngineEvent::PassRejected => warn!("Pass rejected: another pass is running"),
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
