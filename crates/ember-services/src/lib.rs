//! ember-services — sessions, the question protocol, and coordination
//! primitives shared by the daemon and its tests.

pub mod frame;
pub mod identity;
pub mod lease;
pub mod protocol;
pub mod session;

pub use identity::{new_registry, LocalNode, PeerEntry, PeerRegistry};
pub use lease::{FileLeaseStore, LeaseError, LeaseGuard, LeaseLock, LeaseOptions, LeaseStore, MemoryLeaseStore};
pub use session::{Session, SessionError, SessionOptions, SessionState};
