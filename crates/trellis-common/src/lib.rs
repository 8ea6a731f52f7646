//! Common types for trellis: CRDs, errors, store access and utilities

#![deny(missing_docs)]

pub mod condition;
pub mod crd;
pub mod error;
pub mod keyed_lock;
pub mod labels;
pub mod naming;
pub mod retry;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use error::Error;
pub use settings::Settings;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for control-plane owned records
pub const SYSTEM_NAMESPACE: &str = "trellis-system";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "trellis-controller";

/// Port the config server listens on by default
pub const DEFAULT_CONFIG_SERVER_PORT: u16 = 8443;
