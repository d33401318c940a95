//! Building blocks for the `canvasgen-worker` binary: environment
//! configuration, persisted user settings, the request format read from
//! stdin, and filesystem/log adapters for the queue's collaborators.

pub mod config;
pub mod request;
pub mod settings;
pub mod storage;
