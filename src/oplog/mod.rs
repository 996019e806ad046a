//! Oplog entries and the buffers that carry them
//!
//! Entries travel from the producer to the applier driver through an
//! `OplogBuffer`. The record codec is shared with the storage journal.

mod buffer;
mod codec;
mod entry;
mod spill;

pub use buffer::{BatchLimits, BufferError, BufferKind, BufferLimits, OplogBuffer};
pub use codec::{decode_frame, encode_frame, read_frame, CodecError};
pub use entry::{canonical_id, ConflictKey, OpTime, OperationKind, OplogEntry, Timestamp};
