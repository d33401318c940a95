//! Domain types shared by the canvasgen crates.
//!
//! Jobs and their lifecycle, batch expansion, progress events, and the
//! generation API contract.

pub mod batch;
pub mod error;
pub mod generation;
pub mod job;
pub mod progress;
pub mod types;
