//! StaticIP allocation engine
//!
//! Bookkeeping for sticky pod addresses backed by the `StaticIP` custom
//! resource. The crate is split the same way the controllers consume it:
//!
//! - [`pool`]: pure operations on a record (create, acquire, release, resize)
//! - [`resolver`]: walks a pod's ownership chain to the record governing it
//! - [`update`]: read-mutate-replace under the API server's optimistic concurrency
//! - [`client`]: the narrow slice of the Kubernetes API the engine needs
//!
//! # Example
//!
//! ```
//! use crds::{OwnerKind, OwnerPod, PoolDeclaration};
//! use staticip::pool;
//!
//! let decl = PoolDeclaration {
//!     pool: "10.0.0.1/24,10.0.0.2/24".to_string(),
//!     gateway: "10.0.0.254".to_string(),
//! };
//! let mut spec = pool::new_spec("default", OwnerKind::Deployment, &decl)?;
//! let (ip, gw) = pool::acquire(&mut spec, &OwnerPod::new("default", "web-1", "uid-1"))?;
//! assert_eq!((ip.as_str(), gw.as_str()), ("10.0.0.1/24", "10.0.0.254"));
//! assert_eq!(spec.ratio, "1/2");
//! # Ok::<(), staticip::StaticIpError>(())
//! ```

pub mod client;
pub mod error;
pub mod pool;
pub mod resolver;
pub mod update;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::{ClusterClient, ClusterClientTrait};
pub use error::StaticIpError;
pub use resolver::{OwnerResolver, ResolvedOwner};
pub use update::{Mutation, update_with_retry};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockClusterClient;
