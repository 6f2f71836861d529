//! sonar-core: Shared types for the sonar presence prober.
//!
//! This crate provides the foundational types used across all sonar components:
//! - Device and result types (Device, ProbeResult, RoundResult)
//! - Event payloads delivered by a connection (StatusUpdate, UpsertedAction)
//! - Normalization of raw delivery statuses onto a fixed ordinal scale

pub mod events;
pub mod status;
pub mod types;

pub use events::{ActionKind, StatusUpdate, UpsertedAction};
pub use status::{AckLevel, RawStatus};
pub use types::{Device, ProbeResult, RoundResult};
