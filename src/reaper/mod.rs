//! Orphan reaper: removes labelled instances that outlived their lifetime.
//!
//! Talks to the request path only through the owner label and the cleanup
//! log.

mod runner;
mod sweep;

pub use runner::ReaperRunner;
pub use sweep::{OrphanReaper, SweepReport};
