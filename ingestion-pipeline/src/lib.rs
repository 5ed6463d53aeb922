#![allow(clippy::missing_docs_in_private_items)]

pub mod chunker;
pub mod metadata;
pub mod pipeline;
pub mod queue;

pub use chunker::{ChunkLimits, Chunker};
pub use pipeline::{DefaultPipelineServices, IngestionPipeline, PipelineServices, ProcessReport};
pub use queue::{IngestionQueue, QueueStatsSnapshot, QueueTuning};
