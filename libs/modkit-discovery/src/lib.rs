#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Service registration and discovery over a hierarchical coordination service.
//!
//! A process advertises itself with an ephemeral sequential node under a
//! service path and keeps it alive across session loss and node deletion.
//! Other processes watch the path's children to learn the current membership.
//!
//! - [`ServiceRegistry`] is the entry point: `register`, `discover`,
//!   `list_nodes`, `ping`, `cancel`, `clear_registered_paths`.
//! - [`Coordinator`] is the capability the registry needs from a client;
//!   [`backends::InMemoryCoordinator`] implements it in-process.
//! - Every loop retries forever and only stops on cancellation.

pub mod backends;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod path_state;
pub mod reconnect;
pub mod registered_paths;
pub mod registration;
pub mod registry;
pub mod retry;
pub mod sequencer;

pub use config::RegistryConfig;
pub use coordinator::{
    CoordinationError, Coordinator, SessionState, Watch, WatchEvent, WatchEventKind,
};
pub use discovery::{DiscoveryEvent, DiscoveryEvents, DiscoverySnapshot, ServiceMember};
pub use error::RegistryError;
pub use reconnect::{Recovery, ReconnectSupervisor};
pub use registration::{Advertisement, RegistrationHandle, RegistrationState};
pub use registry::ServiceRegistry;
pub use sequencer::order_by_sequence;
