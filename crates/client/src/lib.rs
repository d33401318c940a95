//! Generation server client library.
//!
//! Provides the HTTP generation API wrapper, typed progress message
//! parsing, the socket and polling progress monitors with their reconnect
//! and phase-inference logic, and the [`service::ProgressService`] that
//! selects between them.

pub mod api;
pub mod client;
pub mod messages;
pub mod monitor;
pub mod polling;
pub mod reconnect;
pub mod service;
pub mod socket;
