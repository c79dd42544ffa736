use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("input error: {0}")]
    Input(String),
    #[error("encoding error: {0}")]
    Encode(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
    #[error("failed to create shard {index:05} at {path:?}: {source}")]
    ShardCreate {
        index: u32,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shard {index:05} write failed at byte offset {offset}: {source}")]
    ShardIo {
        index: u32,
        offset: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("shard {0:05} is unusable after an earlier write failure")]
    ShardPoisoned(u32),
    #[error("document of {tokens} tokens does not fit the i32 size list of shard {index:05}")]
    DocumentTooLarge { index: u32, tokens: usize },
    #[error("invalid shard {path:?}: {reason}")]
    InvalidShard { path: PathBuf, reason: String },
    #[error("invalid manifest {path:?}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },
    #[error("output directory {0:?} already contains shard data (pass --overwrite to replace it)")]
    OutputNotEmpty(PathBuf),
    #[error("failed to write manifest {path:?}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("other: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SpoolError>;

impl SpoolError {
    pub fn is_manifest_failure(&self) -> bool {
        matches!(self, SpoolError::Manifest { .. })
    }
}

impl From<anyhow::Error> for SpoolError {
    fn from(value: anyhow::Error) -> Self {
        Self::Other(value.to_string())
    }
}
