//! Set reconciliation service.
//!
//! Two peers compute the union or the intersection of their sets while
//! exchanging roughly as much data as the sets differ by.
//!
//! # Architecture
//!
//! - **Store**: generational element storage shared by a set and its lazy
//!   copies, so every operation works on a stable snapshot
//! - **Union**: strata estimator, then IBF exchange (or the full set when
//!   the sets differ a lot)
//! - **Intersection**: alternating Bloom filters until both sides agree
//! - **Service**: sets, listeners and operations behind a client API; emits
//!   channel actions and client events, does no I/O itself
//! - **Transport / Node**: an in-memory network for deterministic runs and an
//!   async tokio node that carries frames over byte streams
//!
//! # Example
//!
//! ```
//! use setrecon_service::{
//!     MemoryNetwork, OperationOptions, ResultMode, ServiceConfig, SetService,
//! };
//! use setrecon_types::{AppId, Element, OperationType, PeerId};
//!
//! let app = AppId::from_name("example");
//! let mut net = MemoryNetwork::new();
//! let alice = net.add_peer(SetService::new(PeerId::new(), ServiceConfig::default()).unwrap());
//! let bob = net.add_peer(SetService::new(PeerId::new(), ServiceConfig::default()).unwrap());
//!
//! let svc = net.service_mut(bob).unwrap();
//! svc.listen(OperationType::Union, app).unwrap();
//!
//! let svc = net.service_mut(alice).unwrap();
//! let set = svc.create_set(OperationType::Union);
//! svc.add_element(set, Element::from_bytes(b"hello".to_vec())).unwrap();
//! svc.evaluate(set, bob, app, None, ResultMode::Added, OperationOptions::default())
//!     .unwrap();
//! net.run().unwrap();
//! ```

pub mod codec;
mod config;
mod error;
mod handle;
mod intersection;
pub mod node;
mod operation;
pub mod protocol;
mod registry;
mod service;
mod set;
mod store;
pub mod transport;
mod union;

pub use config::ServiceConfig;
pub use error::{ReconError, ReconResult};
pub use handle::{ChannelId, ContentId, ListenerId, OperationId, RequestId, SetId};
pub use intersection::{IntersectionOperation, IntersectionPhase};
pub use node::{spawn, spawn_with, Dialer, MemoryHub, NodeHandle};
pub use operation::{Operation, OperationOptions, ResultMode, ResultStatus};
pub use protocol::{ReconMessage, PROTOCOL_VERSION};
pub use registry::{IncomingRequest, Listener, Registry};
pub use service::{ChannelAction, ClientEvent, ServiceStats, SetService};
pub use set::{Set, SetState};
pub use store::{ElementEntry, Generation, GenerationRange, MutationEvent, SetContent, SetView};
pub use transport::MemoryNetwork;
pub use union::{UnionOperation, UnionPhase};
