//! ipkeeper CRD Definitions
//!
//! Kubernetes Custom Resource Definitions and the annotation contract shared by
//! the ipkeeper controller and the CNI server.

pub mod annotations;
pub mod references;
pub mod static_ip;

pub use annotations::*;
pub use references::*;
pub use static_ip::*;
