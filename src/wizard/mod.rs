pub mod controller;
pub mod steps;

pub use controller::{ApplyFailure, Controller, Phase, SessionStatus};
