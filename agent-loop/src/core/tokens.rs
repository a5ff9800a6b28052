//! Token counting for context budget tracking.
//!
//! A [`Tokenizer`] gives an exact count for the encoding it implements. When
//! none is configured, or the encoding fails to load, callers fall back to
//! [`estimate_tokens`], which assumes roughly four characters per token.

use anyhow::{Context, Result};
use tiktoken_rs::CoreBPE;

/// Token counter for one encoding.
pub trait Tokenizer: Send + Sync {
    /// Stable name recorded alongside measurements.
    fn name(&self) -> &str;

    /// Number of tokens `text` encodes to.
    fn count(&self, text: &str) -> usize;
}

/// Character-length heuristic used when no tokenizer is available.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Exact counts with the `cl100k_base` BPE encoding.
pub struct Cl100kTokenizer {
    bpe: CoreBPE,
}

impl Cl100kTokenizer {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base().context("load cl100k_base encoding")?;
        Ok(Self { bpe })
    }
}

impl Tokenizer for Cl100kTokenizer {
    fn name(&self) -> &str {
        "cl100k_base"
    }

    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}
