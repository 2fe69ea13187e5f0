//! ipkeeper CNI Server
//!
//! Address-acquisition endpoint for the ipkeeper CNI plugin, served with `axum`
//! over a Unix socket on every node.
//!
//! When the container runtime sets up a pod sandbox, the plugin posts the pod's
//! identity here and receives the address and gateway to configure:
//! - Standalone pods get the address declared in their own annotations
//! - Deployment pods get the next free address of the Deployment's StaticIP
//! - Everything else gets `doNothing` and falls back to the default network
//!
//! When a Deployment's record does not exist yet or its pool is exhausted, the
//! request waits for the record to change, bounded by a timeout.

pub mod api;
pub mod config;
pub mod error;
pub mod handler;
pub mod link;
pub mod notify;
pub mod server;

pub use api::{PodRequest, PodResponse};
pub use config::ServerConfig;
pub use error::CniServerError;
pub use handler::{Acquisition, AddressAllocator};
pub use link::{DeferredLinkConfigurator, LinkConfigurator};
pub use notify::PoolNotifier;
pub use server::{CniServer, router};
