use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use spool_core::{
    HeartbeatConfig, InputFormat, PipelineOptions, SourceOptions, TokenizerKind,
    DEFAULT_BATCH_ROWS, DEFAULT_EVERY_DOCS, DEFAULT_EVERY_SECONDS, DEFAULT_MAX_TOKENS_PER_SHARD,
    DEFAULT_TEXT_FIELD,
};

use crate::EncodeArgs;

pub const DEFAULT_CONFIG: &str = "spool.toml";
const DEFAULT_TOKENIZER: &str = "gpt2";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub encode: EncodeDefaults,
    #[serde(default)]
    pub progress: ProgressDefaults,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncodeDefaults {
    pub tokenizer: Option<String>,
    pub tokenizer_file: Option<PathBuf>,
    pub max_tokens_per_shard: Option<u64>,
    pub batch_rows: Option<usize>,
    pub input_format: Option<String>,
    pub field: Option<String>,
    pub pattern: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgressDefaults {
    pub every_docs: Option<u64>,
    pub every_seconds: Option<u64>,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedEncodeConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub tokenizer: TokenizerKind,
    pub pattern: String,
    pub source: SourceOptions,
    pub pipeline: PipelineOptions,
}

/// A missing file yields the built-in defaults.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    toml::from_str(&contents).map_err(|e| anyhow!("invalid config {}: {e}", path.display()))
}

/// Command-line values win over the config file, which wins over defaults.
pub fn resolve_encode_config(cli: &EncodeArgs, file: &AppConfig) -> Result<ResolvedEncodeConfig> {
    let defaults = &file.encode;
    let tokenizer_name = cli
        .tokenizer
        .clone()
        .or_else(|| defaults.tokenizer.clone())
        .unwrap_or_else(|| DEFAULT_TOKENIZER.to_string());
    let tokenizer_file = cli
        .tokenizer_file
        .clone()
        .or_else(|| defaults.tokenizer_file.clone());
    let tokenizer = TokenizerKind::parse(&tokenizer_name, tokenizer_file)?;

    let format: InputFormat = cli
        .input_format
        .as_deref()
        .or(defaults.input_format.as_deref())
        .unwrap_or("parquet")
        .parse()?;
    let pattern = cli
        .pattern
        .clone()
        .or_else(|| defaults.pattern.clone())
        .unwrap_or_else(|| format.default_pattern().to_string());
    let batch_rows = cli
        .batch_rows
        .or(defaults.batch_rows)
        .unwrap_or(DEFAULT_BATCH_ROWS);
    if batch_rows == 0 {
        return Err(anyhow!("batch_rows must be at least 1"));
    }
    let field = cli
        .field
        .clone()
        .or_else(|| defaults.field.clone())
        .unwrap_or_else(|| DEFAULT_TEXT_FIELD.to_string());

    let max_tokens_per_shard = cli
        .max_tokens_per_shard
        .or(defaults.max_tokens_per_shard)
        .unwrap_or(DEFAULT_MAX_TOKENS_PER_SHARD);
    if max_tokens_per_shard == 0 {
        return Err(anyhow!("max_tokens_per_shard must be at least 1"));
    }

    let progress = &file.progress;
    let heartbeat = HeartbeatConfig {
        every_docs: cli
            .every_docs
            .or(progress.every_docs)
            .unwrap_or(DEFAULT_EVERY_DOCS),
        interval: Duration::from_secs(
            cli.every_seconds
                .or(progress.every_seconds)
                .unwrap_or(DEFAULT_EVERY_SECONDS),
        ),
        label: progress
            .label
            .clone()
            .unwrap_or_else(|| "encode".to_string()),
    };

    Ok(ResolvedEncodeConfig {
        input: cli.input.clone(),
        output: cli.output.clone(),
        tokenizer,
        pattern,
        source: SourceOptions {
            format,
            batch_rows,
            field,
        },
        pipeline: PipelineOptions {
            max_tokens_per_shard,
            overwrite: cli.overwrite,
            heartbeat,
        },
    })
}
