//! Oplog ingestion pipeline
//!
//! `BackgroundSync` pulls entries from a `SyncSource` into the active
//! `OplogBuffer`; `SyncSourceFeedback` pushes local progress back upstream.

mod background_sync;
mod feedback;
mod memory_source;
mod source;

pub use background_sync::{BackgroundSync, FetcherOptions};
pub use feedback::SyncSourceFeedback;
pub use memory_source::InMemorySyncSource;
pub use source::{
    FetchError, FetchOutcome, HostAndPort, MissingDocumentSource, ProgressUpdate, SyncSource, SyncSourceTracker,
};
