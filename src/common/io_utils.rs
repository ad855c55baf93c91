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
use flate2::read::MultiGzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Opens a gzip-compressed file for buffered reading.
pub(crate) fn open_gzip(path: &Path) -> Result<BufReader<MultiGzDecoder<File>>, PretrainError> {
    let file = File::open(path).map_err(|e| {
        PretrainError::IOError(format!("could not open {}: {e}", path.display()))
    })?;
    Ok(BufReader::new(MultiGzDecoder::new(file)))
}

/// Writes a file through a temporary sibling and renames it into place once complete.
///
/// The temporary file lives in the destination directory so that the final rename stays on
/// one filesystem. Readers either see the previous content of `path` or the complete new one.
pub(crate) fn publish_atomically<F>(path: &Path, write: F) -> Result<(), PretrainError>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> Result<(), PretrainError>,
{
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(directory)?;

    let mut temp_file = NamedTempFile::new_in(directory)?;
    {
        let mut writer = BufWriter::new(temp_file.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| {
        PretrainError::IOError(format!("could not publish {}: {}", path.display(), e.error))
    })?;
    Ok(())
}
