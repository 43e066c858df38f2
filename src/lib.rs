//! Lornu AI DNS Controller Library
//!
//! Reconciles `DNSRecord` intentions against live DNS provider zones while
//! several uncoordinated writers, possibly on different clusters, publish
//! to the same hostnames.
//!
//! ## Architecture
//!
//! - **Ownership Registry** (`registry`): provenance TXT records that tell
//!   which owner contributed which targets to a hostname
//! - **Plan Engine** (`plan`): pure diff of current, previous and desired
//!   endpoints under ownership and policy constraints
//! - **Convergence Controller** (`controller`): per-record loop with a short
//!   validation window while racing and a long one once converged
//! - **Delegation** (`delegation`): authoritative records aggregating
//!   delegated contributions across clusters, gated by active groups

pub mod config;
pub mod controller;
pub mod delegation;
pub mod endpoint;
pub mod plan;
pub mod provider;
pub mod record;
pub mod registry;
pub mod store;

pub use config::ControllerConfig;
pub use controller::{Action, Controller, Reconciler, ReconcileError};
pub use endpoint::{Changes, Endpoint, EndpointKey, RecordType, Zone};
pub use plan::{Plan, PlanError, PlanResult, Policy};
pub use provider::{Provider, ProviderError, ProviderFactory};
pub use record::{DnsRecord, RecordStatus};
pub use registry::TxtRegistry;
pub use store::{RecordKey, RecordStore, StoreError};
