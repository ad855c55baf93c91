/// # Support for [tokenizers](https://github.com/huggingface/tokenizers)
///
/// Pretraining vocabularies are usually produced with the Python bindings of the Tokenizers
/// library and stored as a single `tokenizer.json` holding the model, the pre- and
/// post-processing options and the vocabulary. This wrapper exposes the two operations the
/// pretraining pipeline needs from it: raw encoding without special tokens and exact token lookup.
use crate::PretrainError;
use std::path::Path;
use tokenizers::tokenizer::Tokenizer as HFBaseTokenizer;

/// Wrapper around a tokenizer from the Tokenizers library
pub struct HFTokenizer {
    /// Base tokenizer object
    tokenizer: HFBaseTokenizer,
}

impl HFTokenizer {
    /// Create a new tokenizer from a `tokenizer.json` file.
    ///
    /// # Arguments
    /// - `tokenizer_file` path to location containing the tokenizer model, pre- and post-processing options and vocabulary
    ///
    /// # Example
    ///
    /// ```no_run
    ///  # fn main() -> anyhow::Result<()> {
    /// use t5_pretrain::tokenization::hf_tokenizers::HFTokenizer;
    /// let tokenizer = HFTokenizer::from_file("path/to/tokenizer.json")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(tokenizer_file: P) -> Result<Self, PretrainError> {
        let tokenizer_file = tokenizer_file.as_ref();
        if !tokenizer_file.is_file() {
            return Err(PretrainError::IOError(format!(
                "{} tokenizer file not found",
                tokenizer_file.display()
            )));
        }
        let tokenizer = HFBaseTokenizer::from_file(tokenizer_file)?;
        Ok(Self { tokenizer })
    }

    /// Encodes raw (not pre-tokenized) text without adding special tokens.
    pub fn encode_raw(&self, text: &str) -> Result<Vec<i64>, PretrainError> {
        let encoding = self.tokenizer.encode(text, false)?;
        Ok(encoding
            .get_ids()
            .iter()
            .map(|token_id| *token_id as i64)
            .collect())
    }

    /// Exact vocabulary lookup, `None` if the token is not part of the vocabulary.
    pub fn token_to_id(&self, token: &str) -> Option<i64> {
        self.tokenizer
            .token_to_id(token)
            .map(|token_id| token_id as i64)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}
