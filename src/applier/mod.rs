//! Parallel oplog applier
//!
//! Entries are routed to a fixed pool of writer threads by conflict key, so
//! writes to one document stay in log order while different documents apply
//! in parallel. `SyncTail` drives the pool from a buffer.

mod multi_apply;
mod router;
mod sync_tail;
mod writer_pool;

pub use multi_apply::{multi_initial_sync_apply, multi_sync_apply};
pub use router::ConflictRouter;
pub use sync_tail::{ApplierStatus, SyncTail, TailExit, TailMode};
pub use writer_pool::{ApplyMode, WriterPool, WriterReport};
