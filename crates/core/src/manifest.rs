use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SpoolError};
use crate::shard::{shard_dir_name, ShardMeta};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSummary {
    pub path: String,
    pub docs: u64,
    pub tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub encoding: String,
    pub num_shards: usize,
    pub docs: u64,
    pub tokens: u64,
    pub shards: Vec<ShardSummary>,
}

impl Manifest {
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(MANIFEST_FILE)
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::path_in(root);
        let raw = fs::read(&path)?;
        let manifest: Manifest = serde_json::from_slice(&raw)?;
        manifest.validate().map_err(|reason| SpoolError::InvalidManifest {
            path: path.clone(),
            reason,
        })?;
        Ok(manifest)
    }

    pub fn save(&self, root: &Path) -> Result<PathBuf> {
        let path = Self::path_in(root);
        let tmp = root.join(format!("{MANIFEST_FILE}.tmp"));
        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, self)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|source| SpoolError::Manifest {
            path: path.clone(),
            source,
        })?;
        info!(
            path = %path.display(),
            shards = self.num_shards,
            docs = self.docs,
            tokens = self.tokens,
            "wrote manifest"
        );
        Ok(path)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.version != MANIFEST_VERSION {
            return Err(format!("unsupported manifest version {}", self.version));
        }
        if self.num_shards != self.shards.len() {
            return Err(format!(
                "num_shards is {} but {} shards are listed",
                self.num_shards,
                self.shards.len()
            ));
        }
        let docs: u64 = self.shards.iter().map(|s| s.docs).sum();
        let tokens: u64 = self.shards.iter().map(|s| s.tokens).sum();
        if docs != self.docs || tokens != self.tokens {
            return Err(format!(
                "totals docs={} tokens={} disagree with shard sums docs={docs} tokens={tokens}",
                self.docs, self.tokens
            ));
        }
        if let Some(empty) = self.shards.iter().find(|s| s.docs == 0) {
            return Err(format!("shard {} is listed with zero documents", empty.path));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    encoding: String,
    shards: Vec<ShardSummary>,
    last_index: Option<u32>,
}

impl ManifestBuilder {
    pub fn new(encoding: impl Into<String>) -> Self {
        Self {
            encoding: encoding.into(),
            shards: Vec::new(),
            last_index: None,
        }
    }

    pub fn record(&mut self, index: u32, meta: ShardMeta) -> Result<()> {
        if let Some(last) = self.last_index {
            if index <= last {
                return Err(SpoolError::Other(format!(
                    "shard {index:05} recorded after shard {last:05}"
                )));
            }
        }
        self.last_index = Some(index);
        if meta.docs == 0 {
            debug!(shard = index, "skipping empty shard");
            return Ok(());
        }
        self.shards.push(ShardSummary {
            path: shard_dir_name(index),
            docs: meta.docs,
            tokens: meta.tokens,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn build(self) -> Manifest {
        let docs = self.shards.iter().map(|s| s.docs).sum();
        let tokens = self.shards.iter().map(|s| s.tokens).sum();
        Manifest {
            version: MANIFEST_VERSION,
            encoding: self.encoding,
            num_shards: self.shards.len(),
            docs,
            tokens,
            shards: self.shards,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn meta(docs: u64, tokens: u64) -> ShardMeta {
        ShardMeta { docs, tokens }
    }

    #[test]
    fn builder_sums_in_creation_order() {
        let mut builder = ManifestBuilder::new("gpt2");
        builder.record(0, meta(2, 9)).unwrap();
        builder.record(1, meta(1, 3)).unwrap();
        builder.record(2, meta(1, 8)).unwrap();
        let manifest = builder.build();
        assert_eq!(manifest.num_shards, 3);
        assert_eq!(manifest.docs, 4);
        assert_eq!(manifest.tokens, 20);
        let paths: Vec<&str> = manifest.shards.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["shard-00000", "shard-00001", "shard-00002"]);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn builder_skips_empty_and_rejects_reordering() {
        let mut builder = ManifestBuilder::new("gpt2");
        builder.record(0, meta(0, 0)).unwrap();
        assert!(builder.is_empty());
        builder.record(1, meta(1, 1)).unwrap();
        assert!(builder.record(1, meta(1, 1)).is_err());
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn serialized_layout_matches_contract() {
        let mut builder = ManifestBuilder::new("cl100k_base");
        builder.record(0, meta(3, 12)).unwrap();
        let value = serde_json::to_value(builder.build()).unwrap();
        assert_eq!(
            value,
            json!({
                "version": 1,
                "encoding": "cl100k_base",
                "num_shards": 1,
                "docs": 3,
                "tokens": 12,
                "shards": [{"path": "shard-00000", "docs": 3, "tokens": 12}],
            })
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let manifest = ManifestBuilder::new("gpt2").build();
        let path = manifest.save(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(MANIFEST_FILE));
        assert!(!dir.path().join("manifest.json.tmp").exists());
        assert_eq!(Manifest::load(dir.path()).unwrap(), manifest);
    }

    #[test]
    fn save_failure_is_distinct() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        let err = ManifestBuilder::new("gpt2").build().save(&missing).unwrap_err();
        assert!(err.is_manifest_failure());
    }

    #[test]
    fn validate_catches_inconsistent_totals() {
        let mut manifest = ManifestBuilder::new("gpt2").build();
        manifest.docs = 1;
        assert!(manifest.validate().unwrap_err().contains("disagree"));

        let mut manifest = ManifestBuilder::new("gpt2").build();
        manifest.shards.push(ShardSummary {
            path: "shard-00000".into(),
            docs: 0,
            tokens: 0,
        });
        manifest.num_shards = 1;
        assert!(manifest.validate().unwrap_err().contains("zero documents"));
    }
}
