use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SpoolError};
use crate::npy;

pub const TOKENS_FILE: &str = "tokens.bin";
pub const SIZES_FILE: &str = "sizes.npy";
pub const META_FILE: &str = "meta.json";
pub const TOKEN_BYTES: u64 = 4;

const MIN_BUFFER_BYTES: usize = 64 * 1024;
const MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;

pub fn shard_dir_name(index: u32) -> String {
    format!("shard-{index:05}")
}

pub fn parse_shard_dir_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("shard-")?;
    if digits.len() < 5 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMeta {
    pub docs: u64,
    pub tokens: u64,
}

#[derive(Debug)]
pub struct ShardWriter {
    index: u32,
    dir: PathBuf,
    sink: Option<BufWriter<File>>,
    sizes: Vec<i32>,
    num_docs: u64,
    num_tokens: u64,
    scratch: Vec<u8>,
    poisoned: bool,
    closed: bool,
}

impl ShardWriter {
    pub fn create(root: &Path, index: u32, capacity_hint: u64) -> Result<Self> {
        let dir = root.join(shard_dir_name(index));
        let create_err = |source| SpoolError::ShardCreate {
            index,
            path: dir.clone(),
            source,
        };
        fs::create_dir_all(&dir).map_err(create_err)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(TOKENS_FILE))
            .map_err(create_err)?;
        let buffer = usize::try_from(capacity_hint.saturating_mul(TOKEN_BYTES))
            .unwrap_or(MAX_BUFFER_BYTES)
            .clamp(MIN_BUFFER_BYTES, MAX_BUFFER_BYTES);
        debug!(shard = index, path = %dir.display(), "opened shard");
        Ok(Self {
            index,
            dir,
            sink: Some(BufWriter::with_capacity(buffer, file)),
            sizes: Vec::new(),
            num_docs: 0,
            num_tokens: 0,
            scratch: Vec::new(),
            poisoned: false,
            closed: false,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn num_docs(&self) -> u64 {
        self.num_docs
    }

    pub fn num_tokens(&self) -> u64 {
        self.num_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.num_docs == 0
    }

    pub fn add(&mut self, ids: &[u32]) -> Result<()> {
        if self.poisoned {
            return Err(SpoolError::ShardPoisoned(self.index));
        }
        let size = i32::try_from(ids.len()).map_err(|_| SpoolError::DocumentTooLarge {
            index: self.index,
            tokens: ids.len(),
        })?;
        let offset = self.num_tokens * TOKEN_BYTES;
        let sink = self
            .sink
            .as_mut()
            .ok_or(SpoolError::ShardPoisoned(self.index))?;

        self.scratch.clear();
        self.scratch.reserve(ids.len() * TOKEN_BYTES as usize);
        for id in ids {
            self.scratch.extend_from_slice(&id.to_le_bytes());
        }
        if let Err(source) = sink.write_all(&self.scratch) {
            self.poisoned = true;
            return Err(SpoolError::ShardIo {
                index: self.index,
                offset,
                source,
            });
        }

        self.sizes.push(size);
        self.num_docs += 1;
        self.num_tokens += ids.len() as u64;
        Ok(())
    }

    pub fn meta(&self) -> ShardMeta {
        ShardMeta {
            docs: self.num_docs,
            tokens: self.num_tokens,
        }
    }

    pub fn close(mut self) -> Result<ShardMeta> {
        if self.poisoned {
            return Err(SpoolError::ShardPoisoned(self.index));
        }
        let index = self.index;
        let offset = self.num_tokens * TOKEN_BYTES;
        let io_err = |source| SpoolError::ShardIo {
            index,
            offset,
            source,
        };

        let sink = self.sink.take().ok_or(SpoolError::ShardPoisoned(index))?;
        let file = sink.into_inner().map_err(|e| io_err(e.into_error()))?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        npy::write_i32_array(&self.dir.join(SIZES_FILE), &self.sizes)?;

        let meta = self.meta();
        let tmp = self.dir.join(format!("{META_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec(&meta)?)?;
        fs::rename(&tmp, self.dir.join(META_FILE))?;
        self.closed = true;

        info!(
            shard = index,
            docs = meta.docs,
            tokens = meta.tokens,
            "closed shard"
        );
        Ok(meta)
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                shard = self.index,
                docs = self.num_docs,
                tokens = self.num_tokens,
                "shard dropped without a successful close; its files are incomplete"
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShardReader {
    dir: PathBuf,
    meta: ShardMeta,
    sizes: Vec<i32>,
    offsets: Vec<usize>,
    tokens: Vec<u32>,
}

impl ShardReader {
    pub fn open(dir: &Path) -> Result<Self> {
        let invalid = |reason: String| SpoolError::InvalidShard {
            path: dir.to_path_buf(),
            reason,
        };

        let meta_raw = match fs::read(dir.join(META_FILE)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(invalid(format!("missing {META_FILE}; shard was never closed")))
            }
            Err(err) => return Err(err.into()),
        };
        let meta: ShardMeta = serde_json::from_slice(&meta_raw)?;
        let sizes = npy::read_i32_array(&dir.join(SIZES_FILE))?;

        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        offsets.push(0usize);
        for size in &sizes {
            let size = usize::try_from(*size)
                .map_err(|_| invalid(format!("negative document size {size}")))?;
            offsets.push(offsets[offsets.len() - 1] + size);
        }
        let total = offsets[offsets.len() - 1];

        if sizes.len() as u64 != meta.docs {
            return Err(invalid(format!(
                "{SIZES_FILE} lists {} documents, {META_FILE} says {}",
                sizes.len(),
                meta.docs
            )));
        }
        if total as u64 != meta.tokens {
            return Err(invalid(format!(
                "{SIZES_FILE} sums to {total} tokens, {META_FILE} says {}",
                meta.tokens
            )));
        }

        let mut bytes = Vec::new();
        File::open(dir.join(TOKENS_FILE))?.read_to_end(&mut bytes)?;
        if bytes.len() as u64 != total as u64 * TOKEN_BYTES {
            return Err(invalid(format!(
                "{TOKENS_FILE} holds {} bytes, expected {}",
                bytes.len(),
                total as u64 * TOKEN_BYTES
            )));
        }
        let tokens = bytes
            .chunks_exact(TOKEN_BYTES as usize)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            sizes,
            offsets,
            tokens,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> ShardMeta {
        self.meta
    }

    pub fn sizes(&self) -> &[i32] {
        &self.sizes
    }

    pub fn num_docs(&self) -> usize {
        self.sizes.len()
    }

    pub fn document(&self, idx: usize) -> Option<&[u32]> {
        let start = *self.offsets.get(idx)?;
        let end = *self.offsets.get(idx + 1)?;
        Some(&self.tokens[start..end])
    }

    pub fn documents(&self) -> impl Iterator<Item = &[u32]> + '_ {
        self.offsets
            .windows(2)
            .map(move |w| &self.tokens[w[0]..w[1]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;
    use tracing_subscriber::fmt::MakeWriter;

    #[test]
    fn dir_names_are_zero_padded() {
        assert_eq!(shard_dir_name(0), "shard-00000");
        assert_eq!(shard_dir_name(42), "shard-00042");
        assert_eq!(parse_shard_dir_name("shard-00042"), Some(42));
        assert_eq!(parse_shard_dir_name("shard-123456"), Some(123_456));
        assert_eq!(parse_shard_dir_name("shard-1"), None);
        assert_eq!(parse_shard_dir_name("manifest.json"), None);
    }

    #[test]
    fn close_writes_all_three_files() {
        let dir = tempdir().unwrap();
        let mut shard = ShardWriter::create(dir.path(), 3, 16).unwrap();
        shard.add(&[1, 2, 3]).unwrap();
        shard.add(&[u32::MAX]).unwrap();
        assert_eq!(shard.num_docs(), 2);
        assert_eq!(shard.num_tokens(), 4);
        let shard_dir = shard.path().to_path_buf();
        let meta = shard.close().unwrap();
        assert_eq!(meta, ShardMeta { docs: 2, tokens: 4 });

        assert_eq!(shard_dir, dir.path().join("shard-00003"));
        let bytes = fs::read(shard_dir.join(TOKENS_FILE)).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[12..], &[0xff, 0xff, 0xff, 0xff]);

        let raw_meta: serde_json::Value =
            serde_json::from_slice(&fs::read(shard_dir.join(META_FILE)).unwrap()).unwrap();
        assert_eq!(raw_meta, serde_json::json!({"docs": 2, "tokens": 4}));
        assert!(!shard_dir.join("meta.json.tmp").exists());
    }

    #[test]
    fn reader_reconstructs_documents_in_order() {
        let dir = tempdir().unwrap();
        let mut shard = ShardWriter::create(dir.path(), 0, 0).unwrap();
        shard.add(&[10, 11]).unwrap();
        shard.add(&[]).unwrap();
        shard.add(&[12, 13, 14]).unwrap();
        let path = shard.path().to_path_buf();
        shard.close().unwrap();

        let reader = ShardReader::open(&path).unwrap();
        assert_eq!(reader.meta(), ShardMeta { docs: 3, tokens: 5 });
        assert_eq!(reader.sizes(), &[2, 0, 3]);
        let docs: Vec<Vec<u32>> = reader.documents().map(|d| d.to_vec()).collect();
        assert_eq!(docs, vec![vec![10, 11], vec![], vec![12, 13, 14]]);
        assert_eq!(reader.document(2), Some(&[12u32, 13, 14][..]));
        assert_eq!(reader.document(3), None);
    }

    #[test]
    fn existing_token_stream_is_not_clobbered() {
        let dir = tempdir().unwrap();
        let shard = ShardWriter::create(dir.path(), 0, 0).unwrap();
        shard.close().unwrap();
        let err = ShardWriter::create(dir.path(), 0, 0).unwrap_err();
        assert!(matches!(err, SpoolError::ShardCreate { index: 0, .. }));
    }

    #[test]
    fn unclosed_shard_is_rejected_by_reader() {
        let dir = tempdir().unwrap();
        let mut shard = ShardWriter::create(dir.path(), 1, 0).unwrap();
        shard.add(&[7, 8, 9]).unwrap();
        let path = shard.path().to_path_buf();
        drop(shard);

        let err = ShardReader::open(&path).unwrap_err();
        match err {
            SpoolError::InvalidShard { reason, .. } => assert!(reason.contains("never closed")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn failed_close_is_flagged_and_leaves_no_meta() {
        let dir = tempdir().unwrap();
        let mut shard = ShardWriter::create(dir.path(), 2, 0).unwrap();
        shard.add(&[5, 6]).unwrap();
        let path = shard.path().to_path_buf();
        fs::create_dir(path.join(SIZES_FILE)).unwrap();

        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, || shard.close());

        assert!(result.is_err());
        assert!(!path.join(META_FILE).exists());
        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("without a successful close"));
    }

    #[test]
    fn clean_close_logs_no_warning() {
        let dir = tempdir().unwrap();
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let mut shard = ShardWriter::create(dir.path(), 0, 0).unwrap();
            shard.add(&[1]).unwrap();
            shard.close().unwrap();
        });
        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("closed shard"));
        assert!(!output.contains("without a successful close"));
    }

    #[test]
    fn truncated_token_stream_is_detected() {
        let dir = tempdir().unwrap();
        let mut shard = ShardWriter::create(dir.path(), 0, 0).unwrap();
        shard.add(&[1, 2, 3, 4]).unwrap();
        let path = shard.path().to_path_buf();
        shard.close().unwrap();

        let tokens = path.join(TOKENS_FILE);
        let bytes = fs::read(&tokens).unwrap();
        fs::write(&tokens, &bytes[..10]).unwrap();
        let err = ShardReader::open(&path).unwrap_err();
        assert!(matches!(err, SpoolError::InvalidShard { .. }));
    }
}
