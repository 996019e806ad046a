//! Admin HTTP interface
//!
//! Exposes replication status and the operator controls (snapshot forcing and
//! dropping, sync source reselection, fetch cancellation) over HTTP.

mod handlers;
mod server;

pub use handlers::{AdminStatus, ProcessStats};
pub use server::{admin_router, run_admin_server};
