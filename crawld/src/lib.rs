//! crawld library crate.
//!
//! A daemon that queues crawl jobs per project and runs each one as a
//! supervised child process, exposing everything over a small HTTP API.

pub mod api;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod scheduler;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
