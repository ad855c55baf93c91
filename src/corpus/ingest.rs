// Copyright 2020 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::common::io_utils::open_gzip;
use crate::corpus::template::PathTemplate;
use crate::corpus::Document;
use crate::tokenization::TokenizerOption;
use crate::PretrainError;
use std::io::BufRead;
use std::path::Path;

/// # Output of the tokenizing ingest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenizedCorpus {
    /// Non-empty documents, in corpus order
    pub documents: Vec<Document>,
    /// Number of tokens over all documents
    pub total_tokens: usize,
}

/// Splits a stream of lines into tokenized documents.
///
/// Blank lines are document delimiters. The accumulator starts with one open (empty) document;
/// every delimiter seals the current document and opens a new one. Lines that tokenize to
/// nothing are skipped. Empty documents are only removed when the accumulator is finished, so
/// consecutive delimiters and a trailing delimiter never produce documents.
pub struct DocumentAccumulator<'a> {
    tokenizer: &'a TokenizerOption,
    documents: Vec<Document>,
    total_tokens: usize,
}

impl<'a> DocumentAccumulator<'a> {
    pub fn new(tokenizer: &'a TokenizerOption) -> DocumentAccumulator<'a> {
        DocumentAccumulator {
            tokenizer,
            documents: vec![Vec::new()],
            total_tokens: 0,
        }
    }

    pub fn push_line(&mut self, line: &str) -> Result<(), PretrainError> {
        let line = line.trim();
        if line.is_empty() {
            self.documents.push(Vec::new());
            return Ok(());
        }

        let token_ids = self.tokenizer.encode_raw(line)?;
        if !token_ids.is_empty() {
            self.total_tokens += token_ids.len();
            // there is always an open document
            if let Some(document) = self.documents.last_mut() {
                document.push(token_ids);
            }
        }
        Ok(())
    }

    /// Feeds every line of `reader` to the accumulator.
    ///
    /// `\n`, `\r\n` and a lone `\r` all end a line.
    pub fn push_reader<R: BufRead>(&mut self, mut reader: R) -> Result<(), PretrainError> {
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            let read = reader.read_until(b'\n', &mut buffer).map_err(|e| {
                PretrainError::IOError(format!("could not read corpus line: {e}"))
            })?;
            if read == 0 {
                return Ok(());
            }
            let mut line = buffer.as_slice();
            if let Some(stripped) = line.strip_suffix(b"\n") {
                line = stripped;
            }
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = std::str::from_utf8(line).map_err(|e| {
                PretrainError::IOError(format!("corpus line is not valid UTF-8: {e}"))
            })?;
            for part in line.split('\r') {
                self.push_line(part)?;
            }
        }
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn finish(self) -> TokenizedCorpus {
        let documents = self
            .documents
            .into_iter()
            .filter(|document| !document.is_empty())
            .collect();
        TokenizedCorpus {
            documents,
            total_tokens: self.total_tokens,
        }
    }
}

/// # Tokenizing ingest for one worker rank
///
/// Each input template produces exactly one gzip-compressed text file per rank. Files are consumed
/// fully and in the order the templates are given.
///
/// ```no_run
/// # fn main() -> anyhow::Result<()> {
/// use t5_pretrain::corpus::{CorpusProcessor, PathTemplate};
/// use t5_pretrain::tokenization::TokenizerOption;
///
/// let tokenizer = TokenizerOption::from_file("data/wordpiece.json", false)?;
/// let processor = CorpusProcessor::new(&tokenizer);
/// let templates = [
///     PathTemplate::parse("data/ncc/{:03d}.txt.gz")?,
///     PathTemplate::parse("data/c4/{:03d}.txt.gz")?,
/// ];
/// let corpus = processor.load_and_tokenize(3, &templates)?;
/// # Ok(())
/// # }
/// ```
pub struct CorpusProcessor<'a> {
    tokenizer: &'a TokenizerOption,
}

impl<'a> CorpusProcessor<'a> {
    pub fn new(tokenizer: &'a TokenizerOption) -> CorpusProcessor<'a> {
        CorpusProcessor { tokenizer }
    }

    pub fn load_and_tokenize(
        &self,
        rank: usize,
        templates: &[PathTemplate],
    ) -> Result<TokenizedCorpus, PretrainError> {
        let mut accumulator = DocumentAccumulator::new(self.tokenizer);
        for template in templates {
            let path = template.render(rank);
            self.load_file(&path, &mut accumulator)?;
        }
        let corpus = accumulator.finish();
        tracing::info!(
            rank,
            documents = corpus.documents.len(),
            "Loaded {} tokens",
            corpus.total_tokens
        );
        Ok(corpus)
    }

    fn load_file(
        &self,
        path: &Path,
        accumulator: &mut DocumentAccumulator<'_>,
    ) -> Result<(), PretrainError> {
        tracing::debug!(path = %path.display(), "reading corpus file");
        let reader = open_gzip(path)?;
        accumulator.push_reader(reader).map_err(|error| match error {
            PretrainError::IOError(message) => {
                PretrainError::IOError(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }
}
