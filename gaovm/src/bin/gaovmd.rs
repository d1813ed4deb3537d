//! gaovmd — the control-plane daemon.

use std::error::Error as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

use gaovm::config::ConfigStore;
use gaovm::daemon::{Daemon, DAEMON_SOCKET_FILE};
use gaovm::events::EventHub;
use gaovm::logsink::LogSink;
use gaovm::supervisor::{DesiredState, Supervisor, SupervisorSettingsBuilder};
use gaovm::util::LockFile;
use gaovm::Error;

#[derive(Debug, Parser)]
#[command(name = "gaovmd", about = "gaovm control-plane daemon", version)]
struct Args {
    /// Client-facing socket path. Defaults to <state-dir>/run/daemon.sock.
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Directory holding configs, state records, sockets and logs.
    #[arg(long)]
    state_dir: PathBuf,

    /// Runtime driver binary to spawn per VM.
    #[arg(long)]
    driver_bin: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(error) = run(args).await {
        let cause = match error.source() {
            Some(cause) => format!("\ncause: {}", cause),
            None => "".into(),
        };
        eprintln!("gaovmd: {}{}", error, cause);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: Args) -> Result<(), Error> {
    std::fs::create_dir_all(&args.state_dir).map_err(|error| Error::Io {
        context: format!("could not create {}", args.state_dir.display()),
        error,
    })?;

    let daemon_log = LogSink::open(&args.state_dir.join("logs").join("daemon.log"))
        .map_err(|error| Error::Io {
            context: "could not open daemon log".to_owned(),
            error,
        })?;
    tracing_subscriber::fmt()
        .with_writer(daemon_log)
        .with_ansi(false)
        .init();
    info!("gaovmd starting");

    let _lock = LockFile::acquire(&args.state_dir.join("daemon.lock"))?;

    let hub = EventHub::new();
    let store = Arc::new(ConfigStore::new(&args.state_dir, hub.emitter()));
    let settings = SupervisorSettingsBuilder::default()
        .driver_bin(args.driver_bin)
        .state_dir(args.state_dir.clone())
        .build()
        .expect("supervisor settings");
    let supervisor = Supervisor::new(settings, hub.emitter())?;

    let socket_path = args
        .socket_path
        .unwrap_or_else(|| args.state_dir.join("run").join(DAEMON_SOCKET_FILE));
    let daemon = Daemon::new(socket_path.clone(), store, supervisor.clone(), hub);
    let listener = daemon.bind()?;

    // Resume supervising if the last daemon wanted the VM running; the
    // reconcile tick does the actual start.
    if supervisor.recover_desired().await? == DesiredState::Running {
        info!("desired state is running, resuming supervision");
    }
    supervisor.spawn_reconcile();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let mut sigint = signal(SignalKind::interrupt()).map_err(|error| Error::Io {
            context: "could not install SIGINT handler".to_owned(),
            error,
        })?;
        let mut sigterm = signal(SignalKind::terminate()).map_err(|error| Error::Io {
            context: "could not install SIGTERM handler".to_owned(),
            error,
        })?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
            info!("signal received, shutting down");
            let _ = shutdown_tx.send(true);
        });
    }

    daemon.serve(listener, shutdown_rx).await;

    supervisor.shutdown().await;
    let _ = std::fs::remove_file(&socket_path);
    info!("gaovmd stopped");
    Ok(())
}
