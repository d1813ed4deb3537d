//! VM configuration: the typed model, validation, diffing and the on-disk
//! store holding the current and pending documents.

pub mod model;
pub mod store;

pub use model::{
    deep_merge, restart_required, validate_config, validate_patch, BootConfig, BootLoader,
    ConfigError, DiskConfig, GraphicsConfig, NetworkConfig, NetworkMode, VmConfig,
};
pub use store::{ConfigStore, SetOutcome, StoreError};
