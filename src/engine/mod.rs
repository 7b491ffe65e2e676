//! Per-job machinery: spawning imapsync, reading its streams and turning them into events.

mod command;
mod lines;
mod progress;
mod registry;
mod runner;

pub use registry::JobRegistry;
pub use runner::{JobRunner, Termination};
