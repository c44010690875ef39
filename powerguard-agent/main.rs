use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use powerguard::common::cpuid::CpuSignature;
use powerguard::common::lock::DEFAULT_LOCK_PATH;
use powerguard::common::{CpuModel, InstanceLock, Platform, RegisterAccess};
use powerguard::config::DEFAULT_CONFIG_PATH;
use powerguard::monitor::{MonitorView, MIN_INTERVAL};
use powerguard::watchers::{load, ProcStatSampler, ResumeWatcher};
use powerguard::{
    Capabilities, ConfigFile, ControlEvent, ControlLoop, DaemonState, PowerguardError,
    ProfileSource, Result, SysfsPowerSource,
};

#[derive(Parser, Debug)]
#[command(name = "powerguard")]
#[command(about = "Keep Intel CPU power limits, trip temperature and undervolt applied")]
struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH, help = "Profile configuration file")]
    config: PathBuf,

    #[arg(
        long,
        conflicts_with = "monitor",
        help = "Verify every register write and log each field"
    )]
    debug: bool,

    #[arg(
        long,
        value_name = "SECONDS",
        num_args = 0..=1,
        default_missing_value = "1.0",
        value_parser = parse_refresh,
        help = "Show throttling, power and voltage status, refreshing every SECONDS (min 0.1)"
    )]
    monitor: Option<Duration>,

    #[arg(long, help = "Skip the supported CPU model check")]
    force: bool,

    #[arg(long, value_name = "PATH", help = "Write log output to a file")]
    log: Option<PathBuf>,

    #[arg(short, long, help = "Enable debug logging")]
    verbose: bool,
}

/// Monitor refresh interval, floored at 0.1 s
fn parse_refresh(value: &str) -> std::result::Result<Duration, String> {
    let seconds: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if seconds.is_nan() {
        return Err("not a number".to_string());
    }
    let interval = Duration::try_from_secs_f64(seconds.max(MIN_INTERVAL.as_secs_f64()))
        .map_err(|e| e.to_string())?;
    Ok(interval)
}

fn init_logging(args: &Args) -> Result<()> {
    let level = if args.verbose || args.debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &args.log {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Shutdown triggered by Ctrl+C"),
        _ = terminate => tracing::info!("Shutdown triggered by SIGTERM"),
        _ = cancel_token.cancelled() => return,
    }
    cancel_token.cancel();
}

/// SIGHUP forces a profile reload
async fn reload_signal(events: mpsc::Sender<ControlEvent>, cancel_token: CancellationToken) {
    let mut sighup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(sighup) => sighup,
        Err(e) => {
            tracing::warn!("Failed to install SIGHUP handler: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => return,
            received = sighup.recv() => {
                if received.is_none() || events.send(ControlEvent::Reload).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let signature = if args.force {
        tracing::warn!("Skipping the CPU model check");
        Some(CpuSignature::current())
    } else {
        Some(CpuModel::detect()?.signature)
    };

    let _lock = InstanceLock::acquire(DEFAULT_LOCK_PATH)?;

    let platform = Platform::open(signature)?;
    let regs: Arc<dyn RegisterAccess> = Arc::new(platform);

    let capabilities = Capabilities::probe(regs.as_ref(), args.debug);

    let config = ConfigFile::new(&args.config);
    let marker = config.modified();
    let profiles = config.load()?;
    capabilities.report_unsupported(&profiles);

    let power = SysfsPowerSource::new(profiles.power_supply_path.clone());
    let state = DaemonState::new(profiles, capabilities, marker);

    let (events_tx, events_rx) = mpsc::channel(32);
    let cancel_token = CancellationToken::new();

    let control = ControlLoop::new(
        regs.clone(),
        Box::new(power),
        Box::new(config),
        state,
        events_rx,
        args.debug,
    );
    let hwp_gate = control.hwp_gate();
    let source_updates = control.source_updates();

    let mut tasks = Vec::new();
    let mut control_handle = tokio::spawn(control.run(cancel_token.clone()));

    if capabilities.undervolt {
        let watcher = ResumeWatcher::new(events_tx.clone());
        tasks.push(tokio::spawn(watcher.run(cancel_token.clone())));
    }

    if capabilities.hwp {
        tasks.push(tokio::spawn(load::run(
            ProcStatSampler::default(),
            hwp_gate,
            events_tx.clone(),
            cancel_token.clone(),
        )));
    }

    tasks.push(tokio::spawn(reload_signal(
        events_tx.clone(),
        cancel_token.clone(),
    )));

    if let Some(interval) = args.monitor {
        let view = MonitorView::new(
            regs.clone(),
            capabilities.tj_max,
            source_updates,
            events_tx.clone(),
            interval,
            args.log.is_some(),
        );
        tasks.push(tokio::spawn(view.run(cancel_token.clone())));
    }
    drop(events_tx);

    // a control loop that ends on its own leaves nothing enforced
    let early_exit = tokio::select! {
        _ = shutdown_signal(cancel_token.clone()) => None,
        result = &mut control_handle => Some(result),
    };
    let result = match early_exit {
        Some(result) => {
            cancel_token.cancel();
            Err(PowerguardError::ControlLoop(match result {
                Ok(()) => "exited before shutdown".to_string(),
                Err(e) => e.to_string(),
            }))
        }
        None => control_handle
            .await
            .map_err(|e| PowerguardError::ControlLoop(e.to_string())),
    };

    for task in tasks {
        let _ = task.await;
    }

    tracing::info!("All tasks completed, exiting");
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("Unable to open the log file: {e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_fatal() => {
            tracing::error!("Fatal: {}", e);
            if matches!(e, PowerguardError::InstanceLocked(_)) {
                tracing::error!("Is another powerguard instance running?");
            }
            ExitCode::from(e.exit_code())
        }
        Err(e) => {
            tracing::error!("Unable to start: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
