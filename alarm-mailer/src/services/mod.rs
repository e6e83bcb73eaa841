//! Application services.

pub mod container;

pub use container::{AlarmMailer, Destination};
