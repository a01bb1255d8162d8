use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

use secguys_monitor::api::{ClientConfig, DashboardSource, HttpBackend, RouteFamily, ScanBackend};
use secguys_monitor::dashboard::Dashboard;
use secguys_monitor::error::MonitorError;
use secguys_monitor::monitor::{MonitorConfig, ScanMonitor, StopRequest};
use secguys_monitor::render;
use secguys_monitor::target::load_targets_from_path;
use secguys_monitor::types::{FindingQuery, ScanHandle};
use secguys_monitor::ui::TerminalSurface;

/// secguys: terminal client for the SecGuys security dashboard API.
#[derive(Debug, Parser)]
#[command(
    name = "secguys",
    version,
    about = "Start and monitor security scans and browse findings from the SecGuys dashboard API.",
    long_about = None
)]
struct Cli {
    #[command(flatten)]
    opts: Opts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct Opts {
    /// Base URL of the dashboard backend.
    #[arg(long, env = "SECGUYS_API_URL", default_value = "http://127.0.0.1:5000", global = true)]
    api_url: String,

    /// Which backend route family to use.
    #[arg(long, value_enum, env = "SECGUYS_ROUTES", default_value_t = RouteFamily::Queue, global = true)]
    routes: RouteFamily,

    /// Poll interval in milliseconds (default: 2000 for queue, 1000 for live).
    #[arg(long = "interval-ms", global = true)]
    interval_ms: Option<u64>,

    /// Consecutive failed polls tolerated before giving up.
    #[arg(long, global = true)]
    failure_budget: Option<u32>,

    /// Hard cap on polls per scan (default: 300 for queue, 3600 for live).
    #[arg(long, global = true)]
    max_polls: Option<u32>,

    /// Per-request timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 10_000, global = true)]
    timeout_ms: u64,

    /// Print JSON instead of tables.
    #[arg(long, global = true)]
    json: bool,

    /// Also write the result as pretty JSON to this path.
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl Opts {
    fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.api_url.clone())
            .with_routes(self.routes)
            .with_request_timeout(Duration::from_millis(self.timeout_ms))
    }

    fn monitor_config(&self) -> MonitorConfig {
        let mut cfg = MonitorConfig::for_routes(self.routes);
        if let Some(ms) = self.interval_ms {
            cfg = cfg.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(budget) = self.failure_budget {
            cfg = cfg.with_failure_budget(budget);
        }
        if let Some(max) = self.max_polls {
            cfg = cfg.with_max_polls(max);
        }
        cfg
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start scans one after another and follow each until it ends. Ctrl+C requests stop.
    Scan {
        /// Targets: hostname, IP, CIDR or URL.
        targets: Vec<String>,

        /// File with one target per line (`#` comments allowed).
        #[arg(long)]
        targets_file: Option<PathBuf>,

        /// Skip the dashboard refresh after a scan finishes.
        #[arg(long)]
        no_dashboard: bool,
    },
    /// Request cancellation of the running scan (live backend).
    Stop,
    /// Show the status of a scan once.
    Status { scan_id: String },
    /// Show dashboard panels, optionally for one asset.
    Dashboard {
        #[arg(long)]
        asset: Option<String>,
    },
    /// List assets.
    Assets,
    /// Show one asset with identifiers and scan history.
    Asset { asset_id: String },
    /// List findings.
    Findings {
        #[arg(long)]
        asset: Option<String>,
        #[arg(long)]
        scan: Option<String>,
        /// Comma-separated severities, e.g. critical,high
        #[arg(long, value_delimiter = ',')]
        severity: Vec<String>,
    },
    /// Show one finding.
    Finding { finding_id: String },
    /// Most common vulnerabilities (live backend).
    TopVulns,
    /// List generated reports (live backend).
    Reports,
    /// Show a report. On the queue backend the id is an asset id.
    Report { id: String },
    /// Download a report file (live backend).
    Download {
        id: String,
        #[arg(short = 'o', long = "out")]
        out: PathBuf,
    },
    /// Check backend health.
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let opts = cli.opts;

    let level = if opts.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install log subscriber")?;

    let backend = Arc::new(HttpBackend::new(opts.client_config())?);

    match cli.command {
        Command::Scan {
            targets,
            targets_file,
            no_dashboard,
        } => cmd_scan(&opts, backend, targets, targets_file, no_dashboard).await,
        Command::Stop => {
            backend.stop_scan("").await?;
            println!("Stop requested");
            Ok(())
        }
        Command::Status { scan_id } => {
            let snap = backend.scan_status(&scan_id).await?;
            let mut handle = ScanHandle::new(scan_id, "-");
            handle.absorb(&snap);
            emit(&opts, &handle, render::render_scan)
        }
        Command::Dashboard { asset } => {
            let dashboard = Dashboard::new(backend);
            match dashboard.set_asset_filter(asset).await {
                Some(view) => emit(&opts, &view, render::render_dashboard),
                None => bail!("dashboard refresh was superseded"),
            }
        }
        Command::Assets => {
            let assets = backend.assets().await?;
            emit(&opts, &assets, |a| render::render_assets(a))
        }
        Command::Asset { asset_id } => {
            let detail = backend.asset_detail(&asset_id).await?;
            emit(&opts, &detail, render::render_asset_detail)
        }
        Command::Findings {
            asset,
            scan,
            severity,
        } => {
            let query = FindingQuery {
                asset_id: asset,
                scan_id: scan,
                severity,
            };
            let findings = backend.findings(&query).await?;
            emit(&opts, &findings, |f| render::render_findings(f))
        }
        Command::Finding { finding_id } => {
            let finding = backend.finding(&finding_id).await?;
            emit(&opts, &finding, render::render_finding)
        }
        Command::TopVulns => {
            let rows = backend.top_vulnerabilities().await?;
            emit(&opts, &rows, |r| render::render_top_vulnerabilities(r))
        }
        Command::Reports => {
            let reports = backend.reports().await?;
            emit(&opts, &reports, |r| render::render_reports(r))
        }
        Command::Report { id } => {
            let report = backend.report(&id).await?;
            emit(&opts, &report, render::render_report)
        }
        Command::Download { id, out } => {
            let bytes = backend.download_report(&id).await?;
            std::fs::write(&out, &bytes)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Wrote {} bytes to {}", bytes.len(), out.display());
            Ok(())
        }
        Command::Health => {
            backend.health().await?;
            println!("Backend at {} is healthy", opts.api_url);
            Ok(())
        }
    }
}

async fn cmd_scan(
    opts: &Opts,
    backend: Arc<HttpBackend>,
    mut targets: Vec<String>,
    targets_file: Option<PathBuf>,
    no_dashboard: bool,
) -> Result<()> {
    if let Some(path) = targets_file {
        targets.extend(
            load_targets_from_path(&path)?
                .into_iter()
                .map(|t| t.to_string()),
        );
    }
    if targets.is_empty() {
        bail!("no targets given; pass targets or --targets-file");
    }

    let (refresh_tx, mut refresh_rx) = mpsc::unbounded_channel();
    let surface = Arc::new(TerminalSurface::new(Some(refresh_tx)));
    let monitor = ScanMonitor::new(backend.clone(), surface, opts.monitor_config());

    let config = monitor.config();
    println!("secguys scan configuration:");
    println!("  api          : {} ({:?} routes)", opts.api_url, backend.routes());
    println!("  targets      : {}", targets.len());
    println!("  interval     : {:?}", config.poll_interval);
    println!("  max polls    : {}", config.max_polls);
    println!("  failure budget: {}", config.failure_budget);

    // First Ctrl+C asks the backend to stop; a second one stops following the scan.
    let m = monitor.clone();
    tokio::spawn(async move {
        let mut stop_asked = false;
        while tokio::signal::ctrl_c().await.is_ok() {
            if !stop_asked {
                match m.stop().await {
                    StopRequest::Sent => {
                        stop_asked = true;
                        eprintln!("Stop requested (Ctrl+C again to detach)");
                    }
                    StopRequest::Deferred => {
                        stop_asked = true;
                        eprintln!("Scan is still starting; stop will follow (Ctrl+C again to detach)");
                    }
                    StopRequest::AlreadyRequested => stop_asked = true,
                    StopRequest::Failed(_) => {
                        stop_asked = true;
                        eprintln!("Ctrl+C again to detach");
                    }
                    StopRequest::NoSession => eprintln!("No scan is active"),
                }
            } else {
                stop_asked = false;
                if !m.abandon().await {
                    eprintln!("No scan is active");
                }
            }
        }
    });

    let mut finished: Vec<ScanHandle> = Vec::new();
    let mut failed = 0usize;
    for target in &targets {
        println!("\nScanning {target}...");
        match monitor.run(target).await {
            Ok(handle) => finished.push(handle),
            Err(e @ (MonitorError::Stopped | MonitorError::Abandoned)) => {
                warn!(scan_target = %target, "{e}");
                failed += 1;
                break;
            }
            Err(e) => {
                warn!(scan_target = %target, error = %e, "scan did not complete");
                failed += 1;
            }
        }

        if refresh_rx.try_recv().is_ok() && !no_dashboard {
            let dashboard = Dashboard::new(backend.clone());
            if let Some(view) = dashboard.refresh().await {
                println!("\n{}", render::render_dashboard(&view));
            }
        }
    }

    if let Some(path) = opts.output.as_deref() {
        write_json(path, &finished)?;
        println!("Wrote JSON results to {}", path.display());
    }
    if failed > 0 {
        bail!("{failed} of {} scans did not complete", targets.len());
    }
    Ok(())
}

fn emit<T: Serialize>(opts: &Opts, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
    if opts.json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text(value));
    }
    if let Some(path) = opts.output.as_deref() {
        write_json(path, value)?;
        println!("Wrote JSON to {}", path.display());
    }
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}
