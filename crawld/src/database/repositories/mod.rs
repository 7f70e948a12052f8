//! Repository layer.

pub mod job;

pub use job::{JobRepository, SqlxJobRepository, stream_jobs};
