//! Safetensors-to-bundle conversion
//!
//! Streaming, memory-bounded: the pipeline holds at most one raw tensor,
//! one converted tensor, and one partially written shard at a time.

pub mod infer;
pub mod pipeline;
pub mod safetensors;

pub use infer::{detect_arch, infer_config};
pub use pipeline::{convert_archive, ConvertOptions, ConvertOutcome, ConvertProgress};
pub use safetensors::{ByteSource, MmapSource, SafetensorsReader, SourceDtype, TensorMeta};
