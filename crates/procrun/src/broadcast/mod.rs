//! Output broadcasting.
//!
//! Keeps the append-only output log and fans every new entry out to a
//! dynamic set of subscriber channels.

mod registry;
mod types;

pub(crate) use registry::BroadcastRegistry;
pub use types::OutputSubscription;
