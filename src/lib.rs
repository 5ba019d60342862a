//! Event-driven activity tracking backbone. The crate samples the focused
//! window through a pluggable [probe::FocusProbe], turns the samples into
//! [storage::activity::Activity] records via the [monitor] state machine,
//! fans lifecycle events out through the [events] dispatcher and persists
//! everything in an encrypted day-partitioned [storage] layer.

pub mod daemon;
pub mod events;
pub mod monitor;
pub mod probe;
pub mod storage;
pub mod utils;
