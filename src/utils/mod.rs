//! Internal utility helpers shared across the crate.

pub(crate) mod math;
pub(crate) mod synchronization;

pub use synchronization::CancellationToken;
