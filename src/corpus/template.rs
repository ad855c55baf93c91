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

use crate::PretrainError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// # Path containing a single numeric placeholder
///
/// Corpus inputs and token shard outputs are addressed by a zero-padded index substituted in a
/// path, for example `data/segmented/{:03d}.txt.gz` or `tokenized/shard_{:04}.bin.gz`.
/// The placeholder may be written `{}`, `{:0N}` or `{:0Nd}` (N being the padding width).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    prefix: String,
    suffix: String,
    width: usize,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<PathTemplate, PretrainError> {
        let invalid = |reason: &str| {
            PretrainError::InvalidConfigurationError(format!(
                "invalid path template `{template}`: {reason}"
            ))
        };
        let start = template
            .find('{')
            .ok_or_else(|| invalid("missing `{}` placeholder"))?;
        let end = template[start..]
            .find('}')
            .map(|offset| start + offset)
            .ok_or_else(|| invalid("unterminated placeholder"))?;
        let (prefix, spec, suffix) = (
            &template[..start],
            &template[start + 1..end],
            &template[end + 1..],
        );
        if suffix.contains('{') || suffix.contains('}') || prefix.contains('}') {
            return Err(invalid("exactly one placeholder is expected"));
        }

        let width = if spec.is_empty() {
            0
        } else {
            let digits = spec
                .strip_prefix(':')
                .ok_or_else(|| invalid("format spec must start with `:`"))?;
            let digits = digits.strip_suffix('d').unwrap_or(digits);
            let digits = digits.strip_prefix('0').unwrap_or(digits);
            if digits.is_empty() {
                0
            } else {
                digits
                    .parse::<usize>()
                    .map_err(|_| invalid("padding width must be a number"))?
            }
        };

        Ok(PathTemplate {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            width,
        })
    }

    /// Substitutes `index` in the template.
    pub fn render(&self, index: usize) -> PathBuf {
        PathBuf::from(format!(
            "{}{:0width$}{}",
            self.prefix,
            index,
            self.suffix,
            width = self.width
        ))
    }

    /// Template rooted in `directory` (used when the template only names files).
    pub fn in_directory(&self, directory: &Path) -> PathTemplate {
        PathTemplate {
            prefix: directory.join(&self.prefix).to_string_lossy().into_owned(),
            suffix: self.suffix.clone(),
            width: self.width,
        }
    }

    /// Index encoded in `path` if it was produced by this template.
    pub fn match_index(&self, path: &Path) -> Option<usize> {
        let path = path.to_str()?;
        let digits = path
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.suffix.as_str())?;
        if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

impl FromStr for PathTemplate {
    type Err = PretrainError;

    fn from_str(template: &str) -> Result<Self, Self::Err> {
        PathTemplate::parse(template)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.width == 0 {
            write!(f, "{}{{}}{}", self.prefix, self.suffix)
        } else {
            write!(f, "{}{{:0{}d}}{}", self.prefix, self.width, self.suffix)
        }
    }
}

/// Counts the files of `directory` named after `file_template`.
pub fn count_shards(directory: &Path, file_template: &PathTemplate) -> Result<usize, PretrainError> {
    let entries = fs::read_dir(directory).map_err(|e| {
        PretrainError::IOError(format!(
            "could not list shard directory {}: {e}",
            directory.display()
        ))
    })?;
    let mut count = 0;
    for entry in entries {
        let entry = entry?;
        if file_template
            .match_index(Path::new(&entry.file_name()))
            .is_some()
        {
            count += 1;
        }
    }
    Ok(count)
}
