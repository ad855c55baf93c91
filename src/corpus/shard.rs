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

//! # Token shards
//!
//! A token shard is a gzip-compressed binary container holding a list of documents, each a list
//! of token id arrays. The layout is explicit (little-endian) so that readers written in any
//! language agree on document and array boundaries:
//!
//! ```text
//! magic      8 bytes   "T5SHARD\0"
//! version    u32       1
//! documents  u64       number of documents
//! per document:
//!   arrays   u64       number of token arrays (source lines)
//!   per array:
//!     dtype  u8        1 = u16, 2 = u32, 3 = i64
//!     length u64       number of token ids
//!     ids    length * sizeof(dtype)
//! ```

use crate::common::io_utils::{open_gzip, publish_atomically};
use crate::corpus::template::PathTemplate;
use crate::corpus::Document;
use crate::PretrainError;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const SHARD_MAGIC: &[u8; 8] = b"T5SHARD\0";
pub const SHARD_VERSION: u32 = 1;
/// Number of output shards produced per worker rank.
pub const DEFAULT_FAN_OUT: usize = 8;

/// Element type of a serialized token array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenDtype {
    U16,
    U32,
    I64,
}

impl TokenDtype {
    fn tag(self) -> u8 {
        match self {
            TokenDtype::U16 => 1,
            TokenDtype::U32 => 2,
            TokenDtype::I64 => 3,
        }
    }

    fn from_tag(tag: u8) -> Option<TokenDtype> {
        match tag {
            1 => Some(TokenDtype::U16),
            2 => Some(TokenDtype::U32),
            3 => Some(TokenDtype::I64),
            _ => None,
        }
    }

    fn size(self) -> usize {
        match self {
            TokenDtype::U16 => 2,
            TokenDtype::U32 => 4,
            TokenDtype::I64 => 8,
        }
    }

    /// Narrowest type able to represent every id of `token_ids`.
    pub fn narrowest(token_ids: &[i64]) -> TokenDtype {
        let fits = |max: i64| token_ids.iter().all(|&id| (0..=max).contains(&id));
        if fits(u16::MAX as i64) {
            TokenDtype::U16
        } else if fits(u32::MAX as i64) {
            TokenDtype::U32
        } else {
            TokenDtype::I64
        }
    }
}

/// Shard receiving the document at `position` of the ingest output.
pub fn shard_assignment(position: usize, fan_out: usize) -> usize {
    position % fan_out
}

/// Redistributes documents round-robin: shard `i` receives positions `i, i + N, i + 2N...`,
/// preserving their relative order.
pub fn partition_documents(documents: &[Document], fan_out: usize) -> Vec<Vec<&Document>> {
    let mut shards: Vec<Vec<&Document>> = vec![Vec::new(); fan_out];
    if fan_out == 0 {
        return shards;
    }
    for (position, document) in documents.iter().enumerate() {
        shards[shard_assignment(position, fan_out)].push(document);
    }
    shards
}

pub(crate) fn encode_documents<'a, W, I>(
    writer: &mut W,
    n_documents: usize,
    documents: I,
) -> Result<(), PretrainError>
where
    W: Write,
    I: IntoIterator<Item = &'a Document>,
{
    writer.write_all(SHARD_MAGIC)?;
    writer.write_all(&SHARD_VERSION.to_le_bytes())?;
    writer.write_all(&(n_documents as u64).to_le_bytes())?;
    for document in documents {
        writer.write_all(&(document.len() as u64).to_le_bytes())?;
        for token_ids in document {
            let dtype = TokenDtype::narrowest(token_ids);
            writer.write_all(&[dtype.tag()])?;
            writer.write_all(&(token_ids.len() as u64).to_le_bytes())?;
            let mut buffer = Vec::with_capacity(token_ids.len() * dtype.size());
            for &id in token_ids {
                match dtype {
                    TokenDtype::U16 => buffer.extend_from_slice(&(id as u16).to_le_bytes()),
                    TokenDtype::U32 => buffer.extend_from_slice(&(id as u32).to_le_bytes()),
                    TokenDtype::I64 => buffer.extend_from_slice(&id.to_le_bytes()),
                }
            }
            writer.write_all(&buffer)?;
        }
    }
    Ok(())
}

struct ByteCursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteCursor<'a> {
    fn take(&mut self, length: usize) -> Result<&'a [u8], PretrainError> {
        let end = self
            .position
            .checked_add(length)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| PretrainError::IOError("truncated token shard".to_string()))?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PretrainError> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    fn read_u64(&mut self) -> Result<u64, PretrainError> {
        Ok(u64::from_le_bytes(self.take_array::<8>()?))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }
}

pub(crate) fn decode_documents(bytes: &[u8]) -> Result<Vec<Document>, PretrainError> {
    let mut cursor = ByteCursor { bytes, position: 0 };
    if cursor.take(SHARD_MAGIC.len())? != SHARD_MAGIC {
        return Err(PretrainError::IOError(
            "not a token shard (bad magic)".to_string(),
        ));
    }
    let version = u32::from_le_bytes(cursor.take_array::<4>()?);
    if version != SHARD_VERSION {
        return Err(PretrainError::IOError(format!(
            "unsupported token shard version {version}"
        )));
    }

    let n_documents = cursor.read_u64()? as usize;
    // every document takes at least 8 bytes, cap the allocation on corrupted counts
    let mut documents = Vec::with_capacity(n_documents.min(cursor.remaining() / 8));
    for _ in 0..n_documents {
        let n_arrays = cursor.read_u64()? as usize;
        let mut document = Vec::with_capacity(n_arrays.min(cursor.remaining() / 9));
        for _ in 0..n_arrays {
            let tag = cursor.take_array::<1>()?[0];
            let dtype = TokenDtype::from_tag(tag).ok_or_else(|| {
                PretrainError::IOError(format!("unknown token dtype tag {tag}"))
            })?;
            let length = cursor.read_u64()? as usize;
            let byte_length = length.checked_mul(dtype.size()).ok_or_else(|| {
                PretrainError::IOError("token array length overflow".to_string())
            })?;
            let raw = cursor.take(byte_length)?;
            let token_ids = match dtype {
                TokenDtype::U16 => raw
                    .chunks_exact(2)
                    .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]) as i64)
                    .collect(),
                TokenDtype::U32 => raw
                    .chunks_exact(4)
                    .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as i64)
                    .collect(),
                TokenDtype::I64 => raw
                    .chunks_exact(8)
                    .map(|chunk| {
                        let mut array = [0u8; 8];
                        array.copy_from_slice(chunk);
                        i64::from_le_bytes(array)
                    })
                    .collect(),
            };
            document.push(token_ids);
        }
        documents.push(document);
    }

    if cursor.remaining() != 0 {
        return Err(PretrainError::IOError(format!(
            "{} trailing bytes after the last document",
            cursor.remaining()
        )));
    }
    Ok(documents)
}

/// # Shard writer
///
/// Writes the documents of one worker rank into `fan_out` independent shards. Shard `i` of rank
/// `r` is named by rendering the output template with `r * fan_out + i`.
pub struct ShardWriter {
    output_template: PathTemplate,
    fan_out: usize,
}

impl ShardWriter {
    pub fn new(output_template: PathTemplate, fan_out: usize) -> Result<ShardWriter, PretrainError> {
        if fan_out == 0 {
            return Err(PretrainError::InvalidConfigurationError(
                "shard fan-out must be at least 1".to_string(),
            ));
        }
        Ok(ShardWriter {
            output_template,
            fan_out,
        })
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    pub fn shard_path(&self, rank: usize, index: usize) -> PathBuf {
        self.output_template.render(rank * self.fan_out + index)
    }

    /// Writes every shard of `rank` and returns their paths, in shard order.
    ///
    /// Each shard is published atomically: it is written to a temporary file next to its final
    /// location and renamed once complete.
    pub fn write(&self, rank: usize, documents: &[Document]) -> Result<Vec<PathBuf>, PretrainError> {
        let mut paths = Vec::with_capacity(self.fan_out);
        for (index, members) in partition_documents(documents, self.fan_out)
            .into_iter()
            .enumerate()
        {
            let path = self.shard_path(rank, index);
            write_shard(&path, members.len(), members.into_iter())?;
            tracing::debug!(path = %path.display(), "wrote token shard");
            paths.push(path);
        }
        Ok(paths)
    }
}

fn write_shard<'a, I>(path: &Path, n_documents: usize, documents: I) -> Result<(), PretrainError>
where
    I: Iterator<Item = &'a Document>,
{
    publish_atomically(path, |writer| {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        encode_documents(&mut encoder, n_documents, documents)?;
        encoder.finish()?;
        Ok(())
    })
}

/// # Token shard opened for random access
#[derive(Debug, Clone, PartialEq)]
pub struct TokenShard {
    documents: Vec<Document>,
}

impl TokenShard {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<TokenShard, PretrainError> {
        let path = path.as_ref();
        let mut bytes = Vec::new();
        open_gzip(path)?.read_to_end(&mut bytes).map_err(|e| {
            PretrainError::IOError(format!("could not decompress {}: {e}", path.display()))
        })?;
        let documents = decode_documents(&bytes).map_err(|error| match error {
            PretrainError::IOError(message) => {
                PretrainError::IOError(format!("{}: {message}", path.display()))
            }
            other => other,
        })?;
        Ok(TokenShard { documents })
    }

    pub fn from_documents(documents: Vec<Document>) -> TokenShard {
        TokenShard { documents }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Document> {
        self.documents.get(index)
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn into_documents(self) -> Vec<Document> {
        self.documents
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dtype_is_narrowed_per_array() {
        assert_eq!(TokenDtype::narrowest(&[0, 1, 65535]), TokenDtype::U16);
        assert_eq!(TokenDtype::narrowest(&[65536]), TokenDtype::U32);
        assert_eq!(TokenDtype::narrowest(&[1 << 33]), TokenDtype::I64);
        assert_eq!(TokenDtype::narrowest(&[-1]), TokenDtype::I64);
        assert_eq!(TokenDtype::narrowest(&[]), TokenDtype::U16);
    }

    #[test]
    fn decoding_restores_array_boundaries() {
        let documents: Vec<Document> = vec![
            vec![vec![1, 2, 3], vec![70000]],
            vec![vec![-5, 1 << 40]],
            vec![],
        ];
        let mut bytes = Vec::new();
        encode_documents(&mut bytes, documents.len(), documents.iter()).unwrap();
        assert_eq!(decode_documents(&bytes).unwrap(), documents);
    }

    #[test]
    fn corrupted_payloads_are_rejected() {
        let documents: Vec<Document> = vec![vec![vec![1, 2, 3]]];
        let mut bytes = Vec::new();
        encode_documents(&mut bytes, documents.len(), documents.iter()).unwrap();

        let mut truncated = bytes.clone();
        truncated.pop();
        assert!(decode_documents(&truncated).is_err());

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(decode_documents(&trailing).is_err());

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(decode_documents(&bad_magic).is_err());

        let mut bad_dtype = bytes;
        // magic + version + n_documents + n_arrays
        bad_dtype[8 + 4 + 8 + 8] = 9;
        assert!(decode_documents(&bad_dtype).is_err());
    }
}
