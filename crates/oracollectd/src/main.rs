//! oracollectd - Oracle instance discovery and metrics collector daemon.
//!
//! Finds running instances from their PMON processes, polls the configured
//! metric groups against each one and writes InfluxDB line protocol to
//! stdout or a file.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use oracollect_core::collector::RealFs;
use oracollect_core::driver::oracle::OracleConnector;
use oracollect_core::output::{MetricSink, open_sink};
use oracollect_core::{Agent, AgentError, Config};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_SHA"), ")");
const LOG_FILE: &str = "oracollect.log";

/// Oracle instance discovery and metrics collector.
#[derive(Parser)]
#[command(name = "oracollectd", about = "Oracle metrics collector daemon", version = VERSION)]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "./conf/oracollect.toml")]
    config: PathBuf,

    /// Directory for the log file. Overrides `general.log_dir`.
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Write the process id to this file.
    #[arg(long, value_name = "PATH")]
    pidfile: Option<PathBuf>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Installs the global subscriber. CLI flags win over `configured`, which
/// wins over the `info` default; `RUST_LOG` directives still apply.
fn init_logging(
    verbose: u8,
    quiet: bool,
    configured: &str,
    log_dir: Option<&Path>,
) -> Result<(), String> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => configured.parse().unwrap_or(Level::INFO),
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match log_dir {
        // stdout may carry metrics, so file logging never falls back to it.
        Some(dir) => {
            fs::create_dir_all(dir)
                .map_err(|e| format!("cannot create log dir {}: {e}", dir.display()))?;
            let path = dir.join(LOG_FILE);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| format!("cannot open log file {}: {e}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
                .map_err(|e| e.to_string())
        }
        None => builder
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| e.to_string()),
    }
}

fn write_pidfile(path: &Path) -> std::io::Result<()> {
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Resolves once a stop signal arrives, then flips `tx`.
async fn wait_for_signals(tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(mut term), Ok(mut hup)) => loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("received SIGINT");
                        break;
                    }
                    _ = term.recv() => {
                        info!("received SIGTERM");
                        break;
                    }
                    _ = hup.recv() => {
                        info!("received SIGHUP, configuration reload is not supported");
                    }
                }
            },
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "cannot install signal handlers, only Ctrl-C stops the agent");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl-C");
    }
    let _ = tx.send(true);
}

async fn run(config: Config, sink: Box<dyn MetricSink>) -> Result<(), AgentError> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(wait_for_signals(tx));
    let agent = Agent::new(config, Arc::new(OracleConnector), Arc::new(RealFs::new()));
    agent.run(sink, rx).await
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("oracollectd: {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let log_dir = args.log_dir.clone().or_else(|| config.general.log_dir.clone());
    if let Err(e) = init_logging(
        args.verbose,
        args.quiet,
        &config.general.log_level,
        log_dir.as_deref(),
    ) {
        eprintln!("oracollectd: {e}");
        return ExitCode::FAILURE;
    }

    info!(version = VERSION, config = %args.config.display(), "oracollectd starting");
    info!(
        groups = config.metric_groups.len(),
        interval_s = config.discovery.interval.as_secs(),
        sink = ?config.output.sink,
        buffer_size = config.output.buffer_size,
        "agent settings"
    );

    if let Some(path) = &args.pidfile
        && let Err(e) = write_pidfile(path)
    {
        error!(path = %path.display(), error = %e, "cannot write pid file");
        eprintln!("oracollectd: cannot write pid file {}: {e}", path.display());
        return ExitCode::FAILURE;
    }

    let code = match open_sink(&config.output) {
        Err(e) => {
            error!(error = %e, "cannot open metric sink");
            ExitCode::FAILURE
        }
        Ok(sink) => match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Err(e) => {
                error!(error = %e, "cannot start runtime");
                ExitCode::FAILURE
            }
            Ok(rt) => match rt.block_on(run(config, sink)) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "agent failed");
                    ExitCode::FAILURE
                }
            },
        },
    };

    if let Some(path) = &args.pidfile
        && let Err(e) = fs::remove_file(path)
    {
        warn!(path = %path.display(), error = %e, "cannot remove pid file");
    }
    info!("oracollectd stopped");
    code
}
