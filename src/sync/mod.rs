//! Stream ingestion and temporal synchronization: bounded per-source buffers,
//! pluggable alignment strategies, and the engine that ties them together.

pub mod aligner;
pub mod buffer;
pub mod engine;

pub use aligner::{Aligner, AlignmentStrategy, SourceAlignment};
pub use buffer::{BufferStats, StreamBuffer, StreamBufferConfig};
pub use engine::{LegacySyncEvent, SyncEngine, SyncEngineConfig, SyncTrigger};
