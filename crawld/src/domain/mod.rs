//! Domain layer: the crawl job entity and its lifecycle rules.

pub mod job;

pub use job::{Job, JobState, NewJob};
