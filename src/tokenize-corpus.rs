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

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use t5_pretrain::corpus::{CorpusProcessor, PathTemplate, ShardWriter, DEFAULT_FAN_OUT};
use t5_pretrain::distributed::{HOSTNAME_VAR, RANK_VAR};
use t5_pretrain::tokenization::TokenizerOption;
use t5_pretrain::PretrainError;
use tracing_subscriber::EnvFilter;

/// Tokenizes the corpus files of one worker rank and writes them as token shards
#[derive(Parser, Debug)]
#[command(author, version)]
struct TokenizeArgs {
    /// Vocabulary used to tokenize the corpus
    #[arg(long)]
    vocab_path: PathBuf,
    /// Corpus file templates, rendered with the rank and read in the given order
    #[arg(long = "input", required = true, num_args = 1..)]
    inputs: Vec<PathTemplate>,
    /// Shard file template, rendered with `rank * fan_out + i`
    #[arg(long)]
    output_path: PathTemplate,
    /// Number of shards written per rank
    #[arg(long, default_value_t = DEFAULT_FAN_OUT)]
    fan_out: usize,
    /// Worker rank, selects the corpus files and the shard names
    #[arg(long, env = RANK_VAR)]
    rank: usize,
    #[arg(long)]
    lower_case: bool,
}

fn run(args: &TokenizeArgs, phase: &mut &'static str) -> Result<(), PretrainError> {
    *phase = "setup";
    let tokenizer = TokenizerOption::from_file(&args.vocab_path, args.lower_case)?;
    let writer = ShardWriter::new(args.output_path.clone(), args.fan_out)?;

    *phase = "tokenize";
    tracing::info!(rank = args.rank, "loading corpus");
    let corpus = CorpusProcessor::new(&tokenizer).load_and_tokenize(args.rank, &args.inputs)?;

    *phase = "write-shards";
    tracing::info!(rank = args.rank, "saving shards");
    let paths = writer.write(args.rank, &corpus.documents)?;
    tracing::info!(rank = args.rank, shards = paths.len(), "done");
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = TokenizeArgs::parse();
    let mut phase = "setup";
    match run(&args, &mut phase) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let hostname = std::env::var(HOSTNAME_VAR).unwrap_or_else(|_| "localhost".to_string());
            eprintln!(
                "rank {} on {hostname} failed during {phase}: {error}",
                args.rank
            );
            ExitCode::from(error.exit_code() as u8)
        }
    }
}
