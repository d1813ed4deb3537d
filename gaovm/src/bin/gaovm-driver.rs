//! gaovm-driver — the runtime driver spawned by the daemon.

use std::error::Error as _;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use gaovm::driver::{self, DriverSettings};
use gaovm::logsink::LogSink;

#[derive(Debug, Parser)]
#[command(name = "gaovm-driver", about = "gaovm runtime driver", version)]
struct Args {
    /// Control socket to listen on; the daemon connects here.
    #[arg(long)]
    socket_path: PathBuf,

    /// Not accepted: the auth token must come from the AUTH_TOKEN
    /// environment variable so it never shows up in process listings.
    #[arg(long, hide = true)]
    auth_token: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if args.auth_token.is_some() {
        eprintln!("gaovm-driver: --auth-token is not accepted; set AUTH_TOKEN in the environment");
        return ExitCode::from(2);
    }
    let auth_token = match std::env::var("AUTH_TOKEN") {
        Ok(token) if !token.is_empty() => token,
        _ => {
            eprintln!("gaovm-driver: AUTH_TOKEN is not set");
            return ExitCode::FAILURE;
        }
    };

    match std::env::var("DRIVER_LOG_PATH") {
        Ok(path) if !path.is_empty() => match LogSink::open(std::path::Path::new(&path)) {
            Ok(sink) => {
                tracing_subscriber::fmt()
                    .with_writer(sink)
                    .with_ansi(false)
                    .init();
            }
            Err(error) => {
                eprintln!("gaovm-driver: could not open log at {path}: {error}");
                return ExitCode::FAILURE;
            }
        },
        _ => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .init();
        }
    }

    match driver::run(DriverSettings::new(args.socket_path, auth_token)).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(error) => {
            let cause = match error.source() {
                Some(cause) => format!("\ncause: {}", cause),
                None => "".into(),
            };
            eprintln!("gaovm-driver: {}{}", error, cause);
            ExitCode::FAILURE
        }
    }
}
