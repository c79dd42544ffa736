use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{Result, SpoolError};
use crate::manifest::{Manifest, ManifestBuilder, MANIFEST_FILE};
use crate::progress::{Heartbeat, HeartbeatConfig, ShardProgress, StatusSink};
use crate::shard::{parse_shard_dir_name, ShardWriter};
use crate::source::Batch;
use crate::tokenizer::BatchEncoder;

pub const DEFAULT_MAX_TOKENS_PER_SHARD: u64 = 10_000_000;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_tokens_per_shard: u64,
    pub overwrite: bool,
    pub heartbeat: HeartbeatConfig,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_tokens_per_shard: DEFAULT_MAX_TOKENS_PER_SHARD,
            overwrite: false,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodeSummary {
    pub manifest: Manifest,
    pub manifest_path: PathBuf,
    pub batches: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

// Capacity is a target. Documents are never split, so a document longer
// than the cap lands whole in a shard of its own and that shard exceeds it.
pub fn should_rotate(shard_tokens: u64, shard_docs: u64, n: u64, max_tokens_per_shard: u64) -> bool {
    shard_tokens + n > max_tokens_per_shard && shard_docs > 0
}

#[derive(Debug)]
pub struct ShardSet {
    root: PathBuf,
    max_tokens_per_shard: u64,
    current: Option<ShardWriter>,
    next_index: u32,
    manifest: ManifestBuilder,
}

impl ShardSet {
    pub fn new(root: &Path, encoding: &str, max_tokens_per_shard: u64) -> Self {
        Self {
            root: root.to_path_buf(),
            max_tokens_per_shard,
            current: None,
            next_index: 0,
            manifest: ManifestBuilder::new(encoding),
        }
    }

    pub fn push(&mut self, ids: &[u32]) -> Result<()> {
        let n = ids.len() as u64;
        let mut shard = match self.current.take() {
            Some(full)
                if should_rotate(
                    full.num_tokens(),
                    full.num_docs(),
                    n,
                    self.max_tokens_per_shard,
                ) =>
            {
                debug!(
                    shard = full.index(),
                    tokens = full.num_tokens(),
                    incoming = n,
                    "rotating shard"
                );
                self.close_shard(full)?;
                self.open_next()?
            }
            Some(open) => open,
            None => self.open_next()?,
        };
        let added = shard.add(ids);
        self.current = Some(shard);
        added
    }

    pub fn current(&self) -> Option<ShardProgress> {
        self.current.as_ref().map(|shard| ShardProgress {
            index: shard.index(),
            docs: shard.num_docs(),
            tokens: shard.num_tokens(),
        })
    }

    pub fn finish(mut self) -> Result<Manifest> {
        if let Some(last) = self.current.take() {
            self.close_shard(last)?;
        }
        Ok(self.manifest.build())
    }

    fn open_next(&mut self) -> Result<ShardWriter> {
        let shard = ShardWriter::create(&self.root, self.next_index, self.max_tokens_per_shard)?;
        self.next_index += 1;
        Ok(shard)
    }

    fn close_shard(&mut self, shard: ShardWriter) -> Result<()> {
        let index = shard.index();
        let meta = shard.close()?;
        self.manifest.record(index, meta)
    }
}

pub fn prepare_output_dir(root: &Path, overwrite: bool) -> Result<()> {
    fs::create_dir_all(root)?;
    let mut stale = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == MANIFEST_FILE || parse_shard_dir_name(&name).is_some() {
            stale.push(entry.path());
        }
    }
    if stale.is_empty() {
        return Ok(());
    }
    if !overwrite {
        return Err(SpoolError::OutputNotEmpty(root.to_path_buf()));
    }
    for path in stale {
        debug!(path = %path.display(), "removing previous output");
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

pub struct Pipeline<'a, E: ?Sized> {
    encoder: &'a E,
    output_dir: PathBuf,
    options: PipelineOptions,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a, E: BatchEncoder + ?Sized> Pipeline<'a, E> {
    pub fn new(encoder: &'a E, output_dir: impl Into<PathBuf>, options: PipelineOptions) -> Self {
        Self {
            encoder,
            output_dir: output_dir.into(),
            options,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn run<I>(&self, batches: I) -> Result<EncodeSummary>
    where
        I: IntoIterator<Item = Result<Batch>>,
    {
        let mut heartbeat = Heartbeat::new(self.options.heartbeat.clone());
        self.run_with_heartbeat(batches, &mut heartbeat)
    }

    pub fn run_with_heartbeat<I, S>(
        &self,
        batches: I,
        heartbeat: &mut Heartbeat<S>,
    ) -> Result<EncodeSummary>
    where
        I: IntoIterator<Item = Result<Batch>>,
        S: StatusSink,
    {
        let started = Instant::now();
        prepare_output_dir(&self.output_dir, self.options.overwrite)?;
        let mut shards = ShardSet::new(
            &self.output_dir,
            self.encoder.encoding(),
            self.options.max_tokens_per_shard,
        );

        let mut batch_count = 0u64;
        let mut cancelled = false;
        'batches: for batch in batches {
            let texts = batch?;
            if texts.is_empty() {
                continue;
            }
            batch_count += 1;
            let encoded = self.encoder.encode_batch(&texts).map_err(|err| match err {
                SpoolError::Encode(msg) => {
                    SpoolError::Encode(format!("batch {batch_count}: {msg}"))
                }
                other => other,
            })?;
            if encoded.len() != texts.len() {
                return Err(SpoolError::Encode(format!(
                    "batch {batch_count}: encoder returned {} sequences for {} documents",
                    encoded.len(),
                    texts.len()
                )));
            }

            for ids in &encoded {
                if self.is_cancelled() {
                    cancelled = true;
                    break 'batches;
                }
                shards.push(ids)?;
                heartbeat.update(1, ids.len() as u64, shards.current());
            }
        }

        let manifest = shards.finish()?;
        heartbeat.finish();
        let manifest_path = manifest.save(&self.output_dir)?;
        let elapsed = started.elapsed();
        info!(
            shards = manifest.num_shards,
            docs = manifest.docs,
            tokens = manifest.tokens,
            cancelled,
            secs = elapsed.as_secs_f64(),
            "encode finished"
        );
        Ok(EncodeSummary {
            manifest,
            manifest_path,
            batches: batch_count,
            elapsed,
            cancelled,
        })
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Relaxed))
    }
}
