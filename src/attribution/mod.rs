//! Contribution tracking: which owner put which bytes where.
//!
//! The debug database records, for every compiland, the RVA ranges it contributed to
//! each part of the image. This module models that as a hierarchy of owners - [`Library`]
//! owning [`Compiland`]s, with [`SourceFile`]s related through line contributions - each
//! carrying sealed [`Contribution`]s per binary section and per COFF group.
//!
//! The lifecycle invariant is the load-bearing part: contributions accumulate ranges
//! while owners are being enumerated, are sealed exactly once when enumeration
//! completes, and are immutable afterward. Every size query demands a sealed
//! contribution, so partially-constructed state can never leak into results.

mod contribution;
mod owners;

pub use contribution::Contribution;
pub use owners::{Compiland, ContributionMaps, Library, SourceFile};
