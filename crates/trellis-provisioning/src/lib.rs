//! Cluster provisioning for trellis
//!
//! This crate holds the reconcilers that turn a provisioning `Cluster` into
//! control plane, node pools, machines and per-machine plans, and the config
//! server node agents use to fetch those plans.
//!
//! Related crates:
//! - `trellis-common`: CRDs, errors, store access and settings
//! - `trellis-operator`: binary wiring the controllers to a cluster

#![deny(missing_docs)]

pub mod apply;
pub mod bootstrap;
pub mod cluster;
pub mod configserver;
pub mod context;
pub mod kubeconfig;
pub mod machine_status;
pub mod nodepool;
pub mod planner;
pub mod schema;
pub mod token;

pub use context::Context;

// Re-export common error types
pub use trellis_common::{Error, Result};
