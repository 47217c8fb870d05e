pub mod db;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod merge;
pub mod pipeline;
pub mod render;

pub use error::ScrapeError;
pub use pipeline::{Outcome, OutcomeStatus, PipelineOptions};
