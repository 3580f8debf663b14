// Sluice - client-side ingestion SDK
//
// Connections to remote ingestion nodes: each one connects asynchronously,
// transmits queued buffers one at a time, frames the node's responses and
// keeps itself alive while idle.

// Re-export core functionality
pub use sluice_core::*;

// Re-export optional crates
#[cfg(feature = "testing")]
pub use sluice_testing;
