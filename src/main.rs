//! Zentinel Adaptive WAF CLI
//!
//! Administrative command-line interface over a file-backed store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};

use zentinel_adaptive_waf::{
    FailurePolicy, FileBackend, RequestDescriptor, RequestRecord, WafAgent, WafConfig,
};

/// Version information
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "adaptive-waf")]
#[command(about = "Adaptive request firewall for Zentinel reverse proxy")]
struct Args {
    /// JSON configuration file; flags below override it
    #[arg(long, env = "WAF_CONFIG")]
    config: Option<PathBuf>,

    /// Blacklist, exemption and keyword store
    #[arg(long, default_value = "adaptive-waf-store.json", env = "WAF_STORE")]
    store: PathBuf,

    /// Classification log (JSON lines), appended by `classify`
    #[arg(long, default_value = "adaptive-waf-history.jsonl", env = "WAF_HISTORY")]
    history: PathBuf,

    /// Anomaly model artifact
    #[arg(long, env = "WAF_MODEL_PATH")]
    model_path: Option<PathBuf>,

    /// Rate window in seconds
    #[arg(long, env = "WAF_RATE_WINDOW")]
    rate_window: Option<f64>,

    /// Requests per window before the soft limit
    #[arg(long, env = "WAF_RATE_MAX")]
    rate_max: Option<u32>,

    /// Requests per window before the flood limit
    #[arg(long, env = "WAF_RATE_FLOOD")]
    rate_flood: Option<u32>,

    /// Minimum seconds between form render and submit
    #[arg(long, env = "WAF_MIN_FORM_TIME")]
    min_form_time: Option<f64>,

    /// Behavior window in seconds
    #[arg(long, env = "WAF_ANOMALY_WINDOW_SECONDS")]
    anomaly_window: Option<f64>,

    /// Upper bound on learned malicious keywords
    #[arg(long, env = "WAF_DYNAMIC_TOP_N")]
    dynamic_top_n: Option<usize>,

    /// Block instead of warn when the store is unavailable
    #[arg(long, env = "WAF_FAIL_CLOSED")]
    fail_closed: bool,

    /// Enable verbose logging
    #[arg(short, long, env = "WAF_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the blacklist
    Blacklist {
        #[command(subcommand)]
        action: ListAction,
    },
    /// Manage exemptions
    Exempt {
        #[command(subcommand)]
        action: ListAction,
    },
    /// Clear stores (both unless one is selected)
    Reset {
        #[arg(long)]
        blacklist: bool,
        #[arg(long)]
        exemptions: bool,
    },
    /// Mine keywords and retrain the anomaly model
    Train {
        /// Request records (JSON lines); defaults to the classification log
        #[arg(long)]
        records: Option<PathBuf>,
    },
    /// Classify a single request
    Classify {
        identity: String,
        path: String,
        #[arg(long, default_value = "GET")]
        method: String,
        /// Arrival time (unix seconds); defaults to now
        #[arg(long)]
        at: Option<f64>,
        /// Form render time (unix seconds)
        #[arg(long, requires = "form_submitted")]
        form_started: Option<f64>,
        /// Form submit time (unix seconds)
        #[arg(long, requires = "form_started")]
        form_submitted: Option<f64>,
    },
    /// Show recent classification logs
    Logs {
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,
    },
}

#[derive(Subcommand, Debug)]
enum ListAction {
    Add {
        identity: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Remove {
        identity: String,
    },
    List,
}

impl Args {
    fn to_config(&self) -> Result<WafConfig> {
        let mut config = match &self.config {
            Some(path) => WafConfig::from_file(path)?,
            None => WafConfig::default(),
        };

        if let Some(v) = self.rate_window {
            config.rate_limit.window_secs = v;
        }
        if let Some(v) = self.rate_max {
            config.rate_limit.max = v;
        }
        if let Some(v) = self.rate_flood {
            config.rate_limit.flood = v;
        }
        if let Some(v) = self.min_form_time {
            config.honeypot.min_form_time_secs = v;
        }
        if let Some(v) = self.anomaly_window {
            config.anomaly.window_secs = v;
        }
        if let Some(v) = self.dynamic_top_n {
            config.keywords.dynamic_top_n = v;
        }
        if self.model_path.is_some() {
            config.anomaly.model_path = self.model_path.clone();
        }
        if self.fail_closed {
            config.store.failure_policy = FailurePolicy::FailClosed;
        }
        Ok(config)
    }
}

/// Install panic hook for production diagnostics
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| panic_info.payload().downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("Unknown panic payload");

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        // Use eprintln for panic logging as tracing may not work during panic
        eprintln!("PANIC: adaptive WAF panicked at {}: {}", location, payload);

        error!(
            panic_payload = %payload,
            panic_location = %location,
            "Adaptive WAF panicked"
        );

        default_hook(panic_info);
    }));
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a JSON-lines file, skipping blank lines
async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid record", path.display(), n + 1))
        })
        .collect()
}

async fn append_jsonl(path: &Path, records: &[RequestRecord]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    for record in records {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn run_list(agent: &WafAgent, blacklist: bool, action: ListAction) -> Result<()> {
    match action {
        ListAction::Add { identity, reason } => {
            let entry = if blacklist {
                agent.blacklist_add(&identity, reason.as_deref()).await?
            } else {
                agent.exempt_add(&identity, reason.as_deref()).await?
            };
            print_json(&entry)
        }
        ListAction::Remove { identity } => {
            let removed = if blacklist {
                agent.blacklist_remove(&identity).await?
            } else {
                agent.exempt_remove(&identity).await?
            };
            print_json(&serde_json::json!({ "identity": identity, "removed": removed }))
        }
        ListAction::List => {
            let entries = if blacklist {
                agent.blacklist_list().await?
            } else {
                agent.exempt_list().await?
            };
            print_json(&entries)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install panic hook first for early crash diagnostics
    install_panic_hook();

    let args = Args::parse();

    // Logs go to stderr; stdout carries command output
    let log_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = args.to_config()?;
    info!(
        version = VERSION,
        store = %args.store.display(),
        rate_window_secs = config.rate_limit.window_secs,
        rate_max = config.rate_limit.max,
        rate_flood = config.rate_limit.flood,
        failure_policy = ?config.store.failure_policy,
        "Configuration loaded"
    );

    let backend = FileBackend::open(&args.store)
        .await
        .with_context(|| format!("opening store {}", args.store.display()))?;
    let agent = WafAgent::new(config, Arc::new(backend)).await.map_err(|e| {
        error!(error = %e, "Failed to initialize adaptive WAF");
        e
    })?;

    match args.command {
        Command::Blacklist { action } => run_list(&agent, true, action).await,
        Command::Exempt { action } => run_list(&agent, false, action).await,
        Command::Reset {
            blacklist,
            exemptions,
        } => {
            let both = !blacklist && !exemptions;
            let summary = agent.reset(blacklist || both, exemptions || both).await?;
            print_json(&summary)
        }
        Command::Train { records } => {
            let path = records.unwrap_or_else(|| args.history.clone());
            let records: Vec<RequestRecord> = read_jsonl(&path).await?;
            let report = agent.train_on(records).await?;
            print_json(&report)
        }
        Command::Classify {
            identity,
            path,
            method,
            at,
            form_started,
            form_submitted,
        } => {
            let mut request = RequestDescriptor::new(identity, path).with_method(method);
            if let Some(at) = at {
                request = request.at(at);
            }
            if let (Some(started), Some(submitted)) = (form_started, form_submitted) {
                request = request.with_form_timing(started, submitted);
            }

            let verdict = agent.classify(&request).await;
            append_jsonl(&args.history, &agent.recent_logs(1)).await?;
            print_json(&verdict)
        }
        Command::Logs { count } => {
            let records: Vec<RequestRecord> = read_jsonl(&args.history).await?;
            let skip = records.len().saturating_sub(count);
            print_json(&records[skip..])
        }
    }
}
