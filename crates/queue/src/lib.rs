//! Sequential generation job queue.
//!
//! [`queue::JobQueue`] runs one job at a time against a
//! [`GenerationApi`](canvasgen_core::generation::GenerationApi), drives the
//! progress service around each request, stores results through the
//! collaborator traits in [`collaborators`], and retries failures.

pub mod collaborators;
pub mod events;
pub mod images;
pub mod queue;
