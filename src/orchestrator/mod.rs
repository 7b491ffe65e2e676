//! Application-level orchestration utilities.
//!
//! This module owns batch scheduling (bounded concurrency) and job lifecycle control
//! (submit/stop/drain/quit). UI/CLI layers call into this module to keep
//! responsibilities separated.

mod controller;
mod pool;

pub(crate) use controller::{run_controller, ControlCommand};
