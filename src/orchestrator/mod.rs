//! Scheduler control surface.
//!
//! This module owns the start/stop/status lifecycle. The worker loop itself
//! lives in `engine`; hosting layers only ever talk to the controller.

mod controller;

pub use controller::{Controller, ControllerBuilder};
