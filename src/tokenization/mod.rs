//! # Vocabulary artifact shared by the ingest pipeline and the training driver
//!
//! The same vocabulary file must be used to tokenize the corpus and to resolve the special
//! tokens (padding, end of sequence, span-corruption sentinels) at training time, otherwise the
//! ids stored in the token shards and the ids the model is trained with silently disagree.
//!
//! Three vocabulary formats are supported, selected from the file extension:
//! - `tokenizer.json` files produced by the Tokenizers library (`.json`)
//! - SentencePiece models (`.model`)
//! - WordPiece vocabularies, one token per line (any other extension)
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use t5_pretrain::tokenization::TokenizerOption;
//! let tokenizer = TokenizerOption::from_file("path/to/wordpiece.json", false)?;
//! let token_ids = tokenizer.encode_raw("Hello world")?;
//! # Ok(())
//! # }
//! ```

pub mod hf_tokenizers;

use crate::PretrainError;
use hf_tokenizers::HFTokenizer;
use rust_tokenizers::tokenizer::{BertTokenizer, SentencePieceTokenizer, Tokenizer};
use rust_tokenizers::vocab::Vocab;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// # Enum wrapping the supported tokenizer backends
pub enum TokenizerOption {
    /// WordPiece tokenizer from a plain vocabulary file
    Bert(BertTokenizer),
    /// SentencePiece unigram tokenizer
    SentencePiece(SentencePieceTokenizer),
    /// Tokenizer loaded from a Tokenizers library `tokenizer.json`
    HF(HFTokenizer),
}

impl TokenizerOption {
    /// Loads the tokenizer matching the vocabulary file format.
    ///
    /// # Arguments
    ///
    /// * `vocab_path` - path to the vocabulary file
    /// * `lower_case` - lower-case the input before tokenization (ignored for `tokenizer.json`
    ///   files, whose normalizer is part of the file)
    pub fn from_file<P: AsRef<Path>>(vocab_path: P, lower_case: bool) -> Result<Self, PretrainError> {
        let vocab_path = vocab_path.as_ref();
        if !vocab_path.is_file() {
            return Err(PretrainError::IOError(format!(
                "vocabulary file {} not found",
                vocab_path.display()
            )));
        }
        let extension = vocab_path
            .extension()
            .and_then(|extension| extension.to_str())
            .unwrap_or_default();
        let tokenizer = match extension {
            "json" => TokenizerOption::HF(HFTokenizer::from_file(vocab_path)?),
            "model" => TokenizerOption::SentencePiece(SentencePieceTokenizer::from_file(
                vocab_path, lower_case,
            )?),
            _ => TokenizerOption::Bert(BertTokenizer::from_file(
                vocab_path, lower_case, lower_case,
            )?),
        };
        Ok(tokenizer)
    }

    /// Encodes a line of raw text without special tokens.
    ///
    /// The text is treated as raw input (no pre-splitting by the caller) and neither BOS/EOS nor
    /// any other model-specific token is inserted.
    pub fn encode_raw(&self, text: &str) -> Result<Vec<i64>, PretrainError> {
        match *self {
            Self::Bert(ref tokenizer) => {
                let tokens = tokenizer.tokenize(text);
                Ok(tokenizer.convert_tokens_to_ids(&tokens))
            }
            Self::SentencePiece(ref tokenizer) => {
                let tokens = tokenizer.tokenize(text);
                Ok(tokenizer.convert_tokens_to_ids(&tokens))
            }
            Self::HF(ref tokenizer) => tokenizer.encode_raw(text),
        }
    }

    /// Exact lookup of a token in the vocabulary (including special tokens).
    pub fn token_to_id(&self, token: &str) -> Option<i64> {
        match *self {
            Self::Bert(ref tokenizer) => lookup(tokenizer.vocab(), token),
            Self::SentencePiece(ref tokenizer) => lookup(tokenizer.vocab(), token),
            Self::HF(ref tokenizer) => tokenizer.token_to_id(token),
        }
    }

    pub fn vocab_size(&self) -> usize {
        match *self {
            Self::Bert(ref tokenizer) => tokenizer.vocab().values().len(),
            Self::SentencePiece(ref tokenizer) => tokenizer.vocab().values().len(),
            Self::HF(ref tokenizer) => tokenizer.vocab_size(),
        }
    }
}

fn lookup<V: Vocab>(vocab: &V, token: &str) -> Option<i64> {
    vocab
        .values()
        .get(token)
        .or_else(|| vocab.special_values().get(token))
        .copied()
}

/// Names of the special tokens the pretraining objective relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialTokenNames {
    pub pad_token: String,
    pub eos_token: String,
    /// Sentinel `i` is named `{sentinel_prefix}{i}{sentinel_suffix}`
    pub sentinel_prefix: String,
    pub sentinel_suffix: String,
}

impl Default for SpecialTokenNames {
    fn default() -> Self {
        SpecialTokenNames {
            pad_token: "[PAD]".to_string(),
            eos_token: "[EOS]".to_string(),
            sentinel_prefix: "[MASK_".to_string(),
            sentinel_suffix: "]".to_string(),
        }
    }
}

/// Resolved special token ids.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecialTokens {
    pub pad_token_id: i64,
    pub eos_token_id: i64,
    /// Span-corruption sentinels, in order
    pub sentinel_token_ids: Vec<i64>,
}

impl SpecialTokens {
    /// Resolves the special tokens by exact id lookup.
    ///
    /// Fails with a `TokenizerError` if any of the tokens is missing from the vocabulary, or if
    /// no sentinel is requested.
    pub fn resolve(
        tokenizer: &TokenizerOption,
        names: &SpecialTokenNames,
        num_sentinels: usize,
    ) -> Result<SpecialTokens, PretrainError> {
        if num_sentinels == 0 {
            return Err(PretrainError::TokenizerError(
                "at least one sentinel token is required for span corruption".to_string(),
            ));
        }
        let resolve = |token: &str| {
            tokenizer.token_to_id(token).ok_or_else(|| {
                PretrainError::TokenizerError(format!("{token} not found in vocabulary"))
            })
        };
        let pad_token_id = resolve(&names.pad_token)?;
        let eos_token_id = resolve(&names.eos_token)?;
        let sentinel_token_ids = (0..num_sentinels)
            .map(|index| {
                resolve(&format!(
                    "{}{}{}",
                    names.sentinel_prefix, index, names.sentinel_suffix
                ))
            })
            .collect::<Result<Vec<i64>, PretrainError>>()?;
        Ok(SpecialTokens {
            pad_token_id,
            eos_token_id,
            sentinel_token_ids,
        })
    }
}
