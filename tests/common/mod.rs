#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Special tokens written at the top of every test vocabulary, in id order.
pub const SPECIAL_TOKENS: [&str; 6] = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "[EOS]"];

pub const NUM_SENTINELS: usize = 4;

/// Writes a WordPiece vocabulary: special tokens, sentinels `[MASK_i]`, then `words`.
/// Returns the path of the file and the id of the first word.
pub fn write_vocab(directory: &Path, words: &[&str]) -> anyhow::Result<(PathBuf, i64)> {
    let path = directory.join("vocab.txt");
    let mut file = File::create(&path)?;
    for token in SPECIAL_TOKENS {
        writeln!(file, "{token}")?;
    }
    for index in 0..NUM_SENTINELS {
        writeln!(file, "[MASK_{index}]")?;
    }
    for word in words {
        writeln!(file, "{word}")?;
    }
    Ok((path, (SPECIAL_TOKENS.len() + NUM_SENTINELS) as i64))
}

pub fn write_gzip_lines(path: &Path, lines: &[&str]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut encoder = GzEncoder::new(File::create(path)?, Compression::default());
    for line in lines {
        writeln!(encoder, "{line}")?;
    }
    encoder.finish()?;
    Ok(())
}
