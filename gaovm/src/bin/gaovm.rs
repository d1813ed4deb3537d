//! gaovm — the client command-line tool.

use std::error::Error as _;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::Value;

use gaovm::client::DaemonClient;

#[derive(Debug, Parser)]
#[command(name = "gaovm", about = "gaovm client tool", version)]
struct Args {
    /// Daemon socket path.
    #[arg(long)]
    socket_path: PathBuf,

    /// Log client-side details to stderr.
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check daemon liveness.
    Ping,
    /// Show supervisor status for the VM.
    Status,
    /// List VMs.
    List,
    /// Start the VM.
    Start,
    /// Stop the VM.
    Stop,
    /// Subscribe and print daemon events until interrupted.
    Events,
    /// Print the daemon's diagnostics snapshot.
    Doctor,
    /// Forward a method to the runtime driver.
    DriverExec {
        #[arg(long)]
        method: String,
        #[arg(long)]
        params_json: Option<String>,
    },
    /// Print current and pending configuration.
    ConfigGet,
    /// Replace the VM configuration.
    ConfigSet {
        #[arg(long)]
        json: String,
    },
    /// Patch the VM configuration.
    ConfigPatch {
        #[arg(long)]
        json: String,
    },
    /// Ask the driver to open the VM display.
    OpenDisplay,
    /// Ask the driver to close the VM display.
    CloseDisplay,
}

enum CliError {
    /// Bad invocation; exits 2 like a clap parse failure.
    Usage(String),
    Runtime(Box<dyn std::error::Error>),
}

impl<E: std::error::Error + 'static> From<E> for CliError {
    fn from(error: E) -> CliError {
        CliError::Runtime(Box::new(error))
    }
}

fn parse_json(flag: &str, raw: &str) -> Result<Value, CliError> {
    serde_json::from_str(raw)
        .map_err(|err| CliError::Usage(format!("{flag} is not valid JSON: {err}")))
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if args.verbose {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .init();
    }
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Usage(message)) => {
            eprintln!("gaovm: {message}");
            ExitCode::from(2)
        }
        Err(CliError::Runtime(error)) => {
            let cause = match error.source() {
                Some(cause) => format!("\ncause: {}", cause),
                None => "".into(),
            };
            eprintln!("gaovm: {}{}", error, cause);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let client = DaemonClient::connect(&args.socket_path).await?;

    let result = match args.command {
        Command::Ping => client.ping().await?,
        Command::Status => client.status().await?,
        Command::List => client.list_vms().await?,
        Command::Start => client.start().await?,
        Command::Stop => client.stop().await?,
        Command::Doctor => client.doctor().await?,
        Command::ConfigGet => client.config_get().await?,
        Command::ConfigSet { json } => {
            let config = parse_json("--json", &json)?;
            client.config_set(config).await?
        }
        Command::ConfigPatch { json } => {
            let patch = parse_json("--json", &json)?;
            client.config_patch(patch).await?
        }
        Command::DriverExec { method, params_json } => {
            let params = match params_json {
                Some(raw) => Some(parse_json("--params-json", &raw)?),
                None => None,
            };
            client.driver_exec(&method, params).await?
        }
        Command::OpenDisplay => client.open_display().await?,
        Command::CloseDisplay => client.close_display().await?,
        Command::Events => {
            let mut events = client.subscribe_events().await?;
            while let Some(event) = events.recv().await {
                println!("{}", serde_json::to_string(&event)?);
            }
            return Ok(());
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
