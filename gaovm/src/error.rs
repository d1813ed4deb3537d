use thiserror::Error;

use crate::channel::ChannelError;
use crate::client::ClientError;
use crate::config::StoreError;
use crate::daemon::DaemonError;
use crate::driver::DriverError;
use crate::persist::PersistError;
use crate::supervisor::SupervisorError;
use crate::util::LockError;

/// Top-level error for the binaries; module errors fold into it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("rpc channel error")]
    Channel(#[from] ChannelError),

    #[error("client error")]
    Client(#[from] ClientError),

    #[error("config store error")]
    Store(#[from] StoreError),

    #[error("daemon error")]
    Daemon(#[from] DaemonError),

    #[error("driver error")]
    Driver(#[from] DriverError),

    #[error("persistence error")]
    Persist(#[from] PersistError),

    #[error("supervisor error")]
    Supervisor(#[from] SupervisorError),

    #[error("lock error")]
    Lock(#[from] LockError),

    #[error("i/o error: {context}")]
    Io {
        context: String,
        #[source]
        error: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
