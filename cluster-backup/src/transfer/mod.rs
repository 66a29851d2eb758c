//! Byte accounting for data streamed in and out of pods.

pub mod progress_stream;

pub use progress_stream::{ProgressCallback, ProgressStream, StreamTally};
