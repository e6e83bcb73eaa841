//! alarm-mailer library crate.
//!
//! Watches alarm sources, classifies their state transitions and mails
//! batched, rate-limited notifications to subscribed destinations.

pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod notification;
pub mod services;

pub use error::{Error, Result};
