pub mod executor;

pub use executor::{CompletionPipeline, PipelineConfig, PipelineError};
