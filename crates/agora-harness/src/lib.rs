//! Agora Test Harness
//!
//! In-memory implementations of the external collaborator contracts
//! (transport, signing identity, blob store, snapshot records, time) for
//! exercising the engine and snapshot subsystem without real infrastructure.
//! Several transports attached to one [`MemoryNetwork`] behave like peers on
//! a shared pub/sub fabric with a store node.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod identity;
pub mod storage;
pub mod time;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use identity::MemorySigner;
pub use storage::{MemoryBlobStore, MemoryRecordStore};
pub use time::ManualTimeSource;
pub use transport::{MemoryNetwork, MemoryTransport};
