// main.rs — CLI entry point.
// Thin shell over the engine: argument parsing, logging setup,
// signal handling, and human-readable result printing. Exit codes:
// 0 success, 1 user error or failed check, 2 internal error.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use pulseguard::checker;
use pulseguard::config::AppConfig;
use pulseguard::engine::{Engine, EngineOptions};
use pulseguard::errors::MonitorError;
use pulseguard::notifier::Notifier;
use pulseguard::storage;
use pulseguard::types::{
    CheckConfig, CheckResult, CheckType, Expected, MemoryConfig, RetryConfig, Status,
};

#[derive(Parser, Debug)]
#[command(
    name = "pulseguard",
    version,
    about = "Self-hosted endpoint health monitor",
    long_about = "Pulseguard probes HTTP, TCP and TLS endpoints on an interval,\n\
                  stores every result locally, and alerts through email, Slack,\n\
                  Discord, webhooks or Telegram when endpoints misbehave."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start monitoring a single URL with sensible defaults
    Quick {
        url: String,
        /// Probe interval (e.g. 30s, 1m)
        #[arg(short, long, default_value = "30s")]
        interval: String,
        /// Keep running until interrupted
        #[arg(short, long)]
        daemon: bool,
    },

    /// Monitor every check in a configuration file
    Monitor {
        config: String,
        /// Keep running until interrupted (one round otherwise)
        #[arg(short, long)]
        daemon: bool,
    },

    /// Probe a URL once and report the outcome
    Test {
        url: String,
        /// Probe timeout (e.g. 5s)
        #[arg(short, long, default_value = "10s")]
        timeout: String,
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show the latest state of every monitored service
    Status {
        #[arg(long, default_value = "./pulseguard.db")]
        storage: String,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Aggregated statistics for one service or all of them
    Stats {
        name: Option<String>,
        /// Window to aggregate over (e.g. 24h, 7d)
        #[arg(short, long, default_value = "24h")]
        since: String,
        #[arg(long, default_value = "./pulseguard.db")]
        storage: String,
    },

    /// Recent probe history for a service
    History {
        name: String,
        #[arg(short, long, default_value = "24h")]
        since: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "./pulseguard.db")]
        storage: String,
    },

    /// Storage statistics
    DbInfo {
        #[arg(long, default_value = "./pulseguard.db")]
        storage: String,
    },

    /// Print version information
    Version,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Parse and validate a configuration file
    Validate { file: String },
    /// Print an annotated example configuration
    Example,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            process::exit(exit_code(&e));
        }
    }
}

fn exit_code(err: &MonitorError) -> i32 {
    match err {
        MonitorError::Internal { .. } | MonitorError::Storage { .. } => 2,
        _ => 1,
    }
}

fn init_tracing(level: &str) {
    // "fatal" is accepted in config files; tracing tops out at error.
    let level = if level == "fatal" { "error" } else { level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("pulseguard={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<i32, MonitorError> {
    match cli.command {
        Commands::Quick {
            url,
            interval,
            daemon,
        } => {
            init_tracing("info");
            let interval = parse_duration(&interval, "interval")?;
            let check = synthetic_check("quick", &url, interval, Duration::from_secs(10));
            run_checks(AppConfig::default(), vec![check], daemon).await
        }

        Commands::Monitor { config, daemon } => {
            let config = AppConfig::load(&config)?;
            init_tracing(&config.global.log_level);
            let checks = config.checks.clone();
            run_checks(config, checks, daemon).await
        }

        Commands::Test {
            url,
            timeout,
            verbose,
        } => {
            init_tracing("warn");
            let timeout = parse_duration(&timeout, "timeout")?;
            cmd_test(&url, timeout, verbose).await
        }

        Commands::Status { storage } => {
            init_tracing("warn");
            cmd_status(&storage)
        }

        Commands::Config { command } => {
            init_tracing("warn");
            match command {
                ConfigCommands::Validate { file } => {
                    let config = AppConfig::load(&file)?;
                    println!("✅ {file} is valid");
                    println!(
                        "   {} check(s), storage at {}",
                        config.checks.len(),
                        config.global.storage_path
                    );
                    Ok(0)
                }
                ConfigCommands::Example => {
                    print!("{}", AppConfig::example());
                    Ok(0)
                }
            }
        }

        Commands::Stats {
            name,
            since,
            storage,
        } => {
            init_tracing("warn");
            cmd_stats(name.as_deref(), &since, &storage)
        }

        Commands::History {
            name,
            since,
            limit,
            storage,
        } => {
            init_tracing("warn");
            cmd_history(&name, &since, limit, &storage)
        }

        Commands::DbInfo { storage } => {
            init_tracing("warn");
            cmd_db_info(&storage)
        }

        Commands::Version => {
            println!("pulseguard v{}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

// ── Monitoring flows ───────────────────────────────────────────

fn build_engine(config: &AppConfig) -> Result<Arc<Engine>, MonitorError> {
    let store = storage::open(&config.global.storage_path, &config.global.memory_management)?;
    let notifier = Notifier::new(&config.notifications)?;

    let in_memory = config.global.storage_path == ":memory:"
        || config.global.storage_path.starts_with("memory://");
    let (cleanup_interval, retention) = if in_memory {
        (
            config.global.memory_management.cleanup_interval,
            config.global.memory_management.max_history_age,
        )
    } else {
        (
            Duration::from_secs(24 * 3600),
            Duration::from_secs(30 * 24 * 3600),
        )
    };

    let options = EngineOptions {
        user_agent: config.global.user_agent.clone(),
        rate_limit: config.global.rate_limit.clone(),
        circuit_breaker: config.global.circuit_breaker.clone(),
        cleanup_interval,
        retention,
        observer_capacity: 256,
    };

    Ok(Arc::new(Engine::new(options, store, notifier)?))
}

async fn run_checks(
    config: AppConfig,
    checks: Vec<CheckConfig>,
    daemon: bool,
) -> Result<i32, MonitorError> {
    let disable_colors = config.global.disable_colors;
    let engine = build_engine(&config)?;

    if !daemon {
        println!("🏃 Running {} check(s) once...", checks.len());
        let results = engine.clone().execute_checks(&checks).await?;
        let mut all_healthy = true;
        for result in &results {
            print_result(result, false, disable_colors);
            all_healthy &= result.is_healthy();
        }
        engine.stop().await;
        return Ok(if all_healthy { 0 } else { 1 });
    }

    println!("📡 Monitoring {} check(s) — press Ctrl+C to stop", checks.len());
    let mut observer = engine
        .observer()
        .ok_or_else(|| MonitorError::internal("observer stream already taken"))?;

    let printer = tokio::spawn(async move {
        while let Some(result) = observer.recv().await {
            print_result(&result, false, disable_colors);
        }
    });

    engine.clone().start_monitoring(checks)?;
    wait_for_signal().await;
    info!("shutdown signal received");

    engine.stop().await;
    let _ = printer.await;
    Ok(0)
}

async fn cmd_test(url: &str, timeout: Duration, verbose: bool) -> Result<i32, MonitorError> {
    println!("🧪 Testing {url}...");

    let checkers = checker::CheckerSet::new(concat!("pulseguard/", env!("CARGO_PKG_VERSION")))?;
    let check = synthetic_check("test", url, timeout + Duration::from_secs(1), timeout);
    let result = checkers.run(&check).await;

    print_result(&result, verbose, false);
    Ok(if result.is_healthy() { 0 } else { 1 })
}

fn synthetic_check(name: &str, url: &str, interval: Duration, timeout: Duration) -> CheckConfig {
    let is_http = url.starts_with("http://") || url.starts_with("https://");
    CheckConfig {
        name: name.to_string(),
        check_type: if is_http { CheckType::Http } else { CheckType::Tcp },
        url: url.to_string(),
        interval,
        timeout,
        method: "GET".to_string(),
        headers: HashMap::new(),
        body: None,
        expected: Expected {
            status: if is_http { Some(200) } else { None },
            response_time_max: Some(Duration::from_secs(5)),
            ..Expected::default()
        },
        retry: RetryConfig {
            attempts: 3,
            delay: Duration::from_secs(2),
            backoff: pulseguard::types::Backoff::Exponential,
            max_delay: Duration::from_secs(30),
        },
        tags: Vec::new(),
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ── Query commands ─────────────────────────────────────────────

fn cmd_status(storage_path: &str) -> Result<i32, MonitorError> {
    let store = storage::open(storage_path, &MemoryConfig::default())?;
    let since = Utc::now() - chrono::Duration::hours(24);
    let all = store.get_all_service_stats(since)?;

    if all.is_empty() {
        println!("📭 No services recorded in the last 24h.");
        return Ok(0);
    }

    println!("{:<24} {:<8} {:>9} {:>10}  LAST CHECK", "SERVICE", "TYPE", "UPTIME", "AVG RT");
    println!("{}", "-".repeat(72));
    for stats in &all {
        println!(
            "{:<24} {:<8} {:>8.1}% {:>8.0}ms  {}",
            stats.name,
            stats.check_type,
            stats.uptime_percent,
            stats.avg_response_time_ms,
            stats
                .last_check
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string()),
        );
    }
    Ok(0)
}

fn cmd_stats(name: Option<&str>, since: &str, storage_path: &str) -> Result<i32, MonitorError> {
    let window = parse_duration(since, "since")?;
    let since_ts = Utc::now()
        - chrono::Duration::from_std(window)
            .map_err(|e| MonitorError::validation(format!("bad since window: {e}")))?;
    let store = storage::open(storage_path, &MemoryConfig::default())?;

    let all = match name {
        Some(name) => vec![store.get_service_stats(name, since_ts)?],
        None => store.get_all_service_stats(since_ts)?,
    };

    if all.is_empty() {
        println!("📭 No data in the selected window.");
        return Ok(0);
    }

    for stats in &all {
        println!("📊 {} ({})", stats.name, stats.url);
        println!("   Checks:     {} total, {} ok, {} failed", stats.total_checks, stats.successful_checks, stats.failed_checks);
        println!("   Uptime:     {:.2}%", stats.uptime_percent);
        println!(
            "   Resp time:  avg {:.0}ms, min {}ms, max {}ms",
            stats.avg_response_time_ms, stats.min_response_time_ms, stats.max_response_time_ms
        );
        if let Some(last_failure) = stats.last_failure {
            println!("   Last fail:  {}", last_failure.format("%Y-%m-%d %H:%M:%S"));
        }
        println!();
    }
    Ok(0)
}

fn cmd_history(
    name: &str,
    since: &str,
    limit: usize,
    storage_path: &str,
) -> Result<i32, MonitorError> {
    let window = parse_duration(since, "since")?;
    let since_ts = Utc::now()
        - chrono::Duration::from_std(window)
            .map_err(|e| MonitorError::validation(format!("bad since window: {e}")))?;
    let store = storage::open(storage_path, &MemoryConfig::default())?;
    let records = store.get_service_history(name, since_ts, limit)?;

    if records.is_empty() {
        println!("📭 No history for {name} in the selected window.");
        return Ok(0);
    }

    println!("{:<6} {:<20} {:<8} {:>8} {:>6}  ERROR", "ID", "TIMESTAMP", "STATUS", "RT", "CODE");
    println!("{}", "-".repeat(76));
    for record in &records {
        let status = Status::from_i64(record.status);
        println!(
            "{:<6} {:<20} {:<8} {:>6}ms {:>6}  {}",
            record.id,
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            status.as_str(),
            record.response_time_ms,
            record
                .status_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.error.as_deref().unwrap_or(""),
        );
    }
    Ok(0)
}

fn cmd_db_info(storage_path: &str) -> Result<i32, MonitorError> {
    let store = storage::open(storage_path, &MemoryConfig::default())?;
    let info = store.database_info()?;

    println!("🗄️  Storage info");
    println!("   Type:      {}", info.storage_type);
    println!("   Path:      {}", info.path);
    println!("   Records:   {}", info.total_records);
    println!("   Services:  {}", info.total_services);
    if let Some(size) = info.database_size_bytes {
        println!("   Size:      {} bytes", size);
    }
    if let Some(usage) = info.memory_usage_bytes {
        println!("   Memory:    ~{} bytes", usage);
    }
    if let (Some(oldest), Some(newest)) = (info.oldest_record, info.newest_record) {
        println!("   Oldest:    {}", oldest.format("%Y-%m-%d %H:%M:%S"));
        println!("   Newest:    {}", newest.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(0)
}

// ── Output helpers ─────────────────────────────────────────────

fn parse_duration(raw: &str, what: &str) -> Result<Duration, MonitorError> {
    humantime::parse_duration(raw)
        .map_err(|e| MonitorError::validation(format!("invalid {what} '{raw}': {e}")))
}

fn print_result(result: &CheckResult, verbose: bool, disable_colors: bool) {
    let status_text = format!("{} {}", result.status.glyph(), result.status.as_str());
    let status_text = if disable_colors {
        status_text
    } else {
        format!("{}{}\x1b[0m", result.status.color(), status_text)
    };

    print!(
        "[{}] {} {} - {:?}",
        result.timestamp.format("%H:%M:%S"),
        status_text,
        result.name,
        result.response_time,
    );
    if let Some(code) = result.status_code {
        print!(" (HTTP {code})");
    }
    if let Some(error) = &result.error {
        print!(" - {error}");
    }
    println!();

    if verbose {
        println!("  URL: {}", result.url);
        if result.body_size > 0 {
            println!("  Body size: {} bytes", result.body_size);
        }
        for (key, value) in &result.headers {
            println!("  {key}: {value}");
        }
        if let Some(cert) = &result.cert_info {
            println!("  Certificate:");
            println!("    Subject: {}", cert.subject);
            println!("    Issuer:  {}", cert.issuer);
            println!(
                "    Expires: {} ({} days)",
                format_date(cert.expiry_date),
                cert.days_to_expiry
            );
            if !cert.dns_names.is_empty() {
                println!("    SANs:    {}", cert.dns_names.join(", "));
            }
        }
    }
}

fn format_date(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}
