mod error;
mod manifest;
mod npy;
mod pipeline;
mod progress;
mod shard;
mod source;
mod tokenizer;
mod verify;

pub use error::{Result, SpoolError};
pub use manifest::{Manifest, ManifestBuilder, ShardSummary, MANIFEST_FILE, MANIFEST_VERSION};
pub use npy::{read_i32_array, write_i32_array};
pub use pipeline::{
    prepare_output_dir, should_rotate, EncodeSummary, Pipeline, PipelineOptions, ShardSet,
    DEFAULT_MAX_TOKENS_PER_SHARD,
};
pub use progress::{
    Heartbeat, HeartbeatConfig, ProgressReport, ShardProgress, StatusSink, TracingSink,
    WriterSink, DEFAULT_EVERY_DOCS, DEFAULT_EVERY_SECONDS,
};
pub use shard::{
    parse_shard_dir_name, shard_dir_name, ShardMeta, ShardReader, ShardWriter, META_FILE,
    SIZES_FILE, TOKENS_FILE,
};
pub use source::{
    discover_inputs, memory_source, open_source, Batch, InputFormat, JsonlSource, ParquetSource,
    SourceOptions, TextSource, DEFAULT_BATCH_ROWS, DEFAULT_TEXT_FIELD,
};
pub use tokenizer::{BatchEncoder, TiktokenEncoder, TokenizerKind};
pub use verify::{verify_output, VerifyReport};
