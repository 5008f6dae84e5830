use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use prx_harvest::ble::host::BtleplugAccess;
use prx_harvest::config::{DEVICE_NAME_TAG, LOG_FILE_PATH, MAX_CONNECTIONS, SESSION_TIMEOUT_SECS};
use prx_harvest::{CsvFileStore, HarvestConfig, Harvester, LogSink, ScanPolicy, SystemClock};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Policy {
    /// Pause scanning for every attempt, resume on any close.
    Attempt,
    /// Pause scanning only while the connection cap is full.
    Capacity,
}

impl From<Policy> for ScanPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::Attempt => ScanPolicy::PauseOnAttempt,
            Policy::Capacity => ScanPolicy::PauseAtCapacity,
        }
    }
}

#[derive(Debug, Parser)]
#[clap(name = "prx-harvest", about = "Harvest buffered logs from PRX proximity sensors.")]
struct Opts {
    /// File harvested records are appended to.
    #[clap(long, default_value = LOG_FILE_PATH)]
    log_file: PathBuf,

    /// Maximum concurrent connections.
    #[clap(long, default_value_t = MAX_CONNECTIONS)]
    max_connections: usize,

    /// Advertised local name to look for.
    #[clap(long, default_value = DEVICE_NAME_TAG)]
    name: String,

    /// Close sessions with no progress for this many seconds (0 disables).
    #[clap(long, default_value_t = SESSION_TIMEOUT_SECS)]
    session_timeout_secs: u64,

    #[clap(long, value_enum, default_value = "attempt")]
    scan_policy: Policy,

    /// Index of the Bluetooth adapter to use.
    #[clap(long, default_value_t = 0)]
    adapter: usize,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(short, long)]
    verbose: bool,
}

impl Opts {
    fn harvest_config(&self) -> HarvestConfig {
        HarvestConfig {
            max_connections: self.max_connections,
            device_name: self.name.clone(),
            scan_policy: self.scan_policy.into(),
            session_timeout: (self.session_timeout_secs > 0)
                .then(|| Duration::from_secs(self.session_timeout_secs)),
            log_path: self.log_file.clone(),
            ..HarvestConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    let default_level = if opts.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let config = opts.harvest_config();
    let sink = LogSink::new(CsvFileStore::new(&config.log_path));
    tracing::info!(path = %config.log_path.display(), "appending harvested records");

    let (access, mut events) = BtleplugAccess::open(opts.adapter)
        .await
        .context("failed to open Bluetooth adapter")?;
    let mut harvester =
        Harvester::new(config, access, sink, SystemClock).context("invalid configuration")?;

    let mut watchdog = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::warn!("transport event stream closed");
                    break;
                };
                if let Err(err) = harvester.handle_event(event) {
                    harvester.shutdown();
                    return Err(err.into());
                }
            }
            _ = watchdog.tick() => {
                let report = harvester.sweep_stalled();
                if report.total() > 0 {
                    tracing::warn!(
                        aborted = report.aborted,
                        expired_attempts = report.expired_attempts,
                        released = report.released,
                        "watchdog intervened"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
        }
    }

    let flushed = harvester.shutdown();
    tracing::info!(sessions = flushed, "live sessions flushed");
    Ok(())
}
