use std::path::Path;

use tracing::debug;

use crate::error::{Result, SpoolError};
use crate::manifest::Manifest;
use crate::shard::ShardReader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub encoding: String,
    pub shards: usize,
    pub docs: u64,
    pub tokens: u64,
    pub max_shard_tokens: u64,
}

pub fn verify_output(root: &Path) -> Result<VerifyReport> {
    let manifest = Manifest::load(root)?;
    let mut report = VerifyReport {
        encoding: manifest.encoding.clone(),
        shards: 0,
        docs: 0,
        tokens: 0,
        max_shard_tokens: 0,
    };
    for entry in &manifest.shards {
        let dir = root.join(&entry.path);
        let reader = ShardReader::open(&dir)?;
        let meta = reader.meta();
        if meta.docs != entry.docs || meta.tokens != entry.tokens {
            return Err(SpoolError::InvalidShard {
                path: dir,
                reason: format!(
                    "manifest lists docs={} tokens={}, shard holds docs={} tokens={}",
                    entry.docs, entry.tokens, meta.docs, meta.tokens
                ),
            });
        }
        debug!(shard = %entry.path, docs = meta.docs, tokens = meta.tokens, "verified shard");
        report.shards += 1;
        report.docs += meta.docs;
        report.tokens += meta.tokens;
        report.max_shard_tokens = report.max_shard_tokens.max(meta.tokens);
    }
    Ok(report)
}
