use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::{Result, SpoolError};

pub trait BatchEncoder {
    fn encoding(&self) -> &str;

    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<u32>>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerKind {
    Gpt2,
    P50k,
    Cl100k,
    O200k,
    Custom(PathBuf),
}

impl TokenizerKind {
    pub fn parse(name: &str, file: Option<PathBuf>) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "gpt2" | "r50k" | "r50k_base" => Ok(TokenizerKind::Gpt2),
            "p50k" | "p50k_base" => Ok(TokenizerKind::P50k),
            "cl100k" | "cl100k_base" => Ok(TokenizerKind::Cl100k),
            "o200k" | "o200k_base" => Ok(TokenizerKind::O200k),
            "custom" => file.map(TokenizerKind::Custom).ok_or_else(|| {
                SpoolError::Tokenizer("a tokenizer file is required when tokenizer=custom".into())
            }),
            other => Err(SpoolError::Tokenizer(format!("unknown tokenizer {other}"))),
        }
    }

    pub fn name(&self) -> String {
        match self {
            TokenizerKind::Gpt2 => "gpt2".to_string(),
            TokenizerKind::P50k => "p50k_base".to_string(),
            TokenizerKind::Cl100k => "cl100k_base".to_string(),
            TokenizerKind::O200k => "o200k_base".to_string(),
            TokenizerKind::Custom(path) => format!("custom:{}", path.display()),
        }
    }

    pub fn build(&self) -> Result<tiktoken_rs::CoreBPE> {
        match self {
            TokenizerKind::Gpt2 => {
                tiktoken_rs::r50k_base().map_err(|e| SpoolError::Tokenizer(e.to_string()))
            }
            TokenizerKind::P50k => {
                tiktoken_rs::p50k_base().map_err(|e| SpoolError::Tokenizer(e.to_string()))
            }
            TokenizerKind::Cl100k => {
                tiktoken_rs::cl100k_base().map_err(|e| SpoolError::Tokenizer(e.to_string()))
            }
            TokenizerKind::O200k => {
                tiktoken_rs::o200k_base().map_err(|e| SpoolError::Tokenizer(e.to_string()))
            }
            TokenizerKind::Custom(path) => load_custom_tokenizer(path),
        }
    }
}

pub struct TiktokenEncoder {
    name: String,
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenEncoder {
    pub fn new(kind: &TokenizerKind) -> Result<Self> {
        Ok(Self {
            name: kind.name(),
            bpe: kind.build()?,
        })
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        self.bpe
            .encode_ordinary(text)
            .into_iter()
            .map(|id| {
                u32::try_from(id)
                    .map_err(|_| SpoolError::Encode(format!("token id {id} does not fit in u32")))
            })
            .collect()
    }
}

impl BatchEncoder for TiktokenEncoder {
    fn encoding(&self) -> &str {
        &self.name
    }

    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<u32>>> {
        texts.iter().map(|text| self.encode(text)).collect()
    }
}

fn load_custom_tokenizer(path: &Path) -> Result<tiktoken_rs::CoreBPE> {
    let data = fs::read_to_string(path).map_err(|e| {
        SpoolError::Tokenizer(format!(
            "failed to read tokenizer file {}: {e}",
            path.display()
        ))
    })?;
    let spec: CustomTokenizerSpec = serde_json::from_str(&data)
        .map_err(|e| SpoolError::Tokenizer(format!("invalid tokenizer json: {e}")))?;
    let mut encoder: FxHashMap<Vec<u8>, usize> = FxHashMap::default();
    for (token, rank) in spec.mergeable_ranks {
        encoder.insert(decode_token_key(&token), rank);
    }
    let mut special_tokens: FxHashMap<String, usize> = FxHashMap::default();
    special_tokens.extend(spec.special_tokens);
    tiktoken_rs::CoreBPE::new(encoder, special_tokens, &spec.pat_str)
        .map_err(|e| SpoolError::Tokenizer(format!("failed to build tokenizer: {e}")))
}

#[derive(Deserialize)]
struct CustomTokenizerSpec {
    pat_str: String,
    mergeable_ranks: HashMap<String, usize>,
    #[serde(default)]
    special_tokens: HashMap<String, usize>,
}

fn decode_token_key(key: &str) -> Vec<u8> {
    general_purpose::STANDARD
        .decode(key)
        .unwrap_or_else(|_| key.as_bytes().to_vec())
}
