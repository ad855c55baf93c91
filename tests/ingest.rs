mod common;

use common::{write_gzip_lines, write_vocab};
use t5_pretrain::corpus::{CorpusProcessor, DocumentAccumulator, PathTemplate};
use t5_pretrain::tokenization::{SpecialTokenNames, SpecialTokens, TokenizerOption};
use t5_pretrain::PretrainError;
use std::io::Cursor;
use tempfile::TempDir;

#[test]
fn blank_lines_delimit_documents() -> anyhow::Result<()> {
    let directory = TempDir::new()?;
    let (vocab_path, first_word) = write_vocab(directory.path(), &["hello", "world", "foo", "bar"])?;
    let (hello, world, foo, bar) = (first_word, first_word + 1, first_word + 2, first_word + 3);
    let tokenizer = TokenizerOption::from_file(&vocab_path, false)?;

    let template = directory.path().join("segmented").join("{:03d}.txt.gz");
    let template = PathTemplate::parse(template.to_str().unwrap())?;
    write_gzip_lines(&template.render(2), &["hello world", "", "foo", "bar", ""])?;

    let corpus = CorpusProcessor::new(&tokenizer).load_and_tokenize(2, &[template])?;

    assert_eq!(
        corpus.documents,
        vec![vec![vec![hello, world]], vec![vec![foo], vec![bar]]]
    );
    assert_eq!(corpus.total_tokens, 4);
    Ok(())
}

#[test]
fn corpora_are_read_in_order_through_one_accumulator() -> anyhow::Result<()> {
    let directory = TempDir::new()?;
    let (vocab_path, first_word) = write_vocab(directory.path(), &["hello", "world", "foo", "bar"])?;
    let tokenizer = TokenizerOption::from_file(&vocab_path, false)?;

    let ncc = PathTemplate::parse(directory.path().join("ncc_{:03d}.txt.gz").to_str().unwrap())?;
    let c4 = PathTemplate::parse(directory.path().join("c4_{:03d}.txt.gz").to_str().unwrap())?;
    write_gzip_lines(&ncc.render(0), &["hello", "", "", "world"])?;
    write_gzip_lines(&c4.render(0), &["foo", "", "bar"])?;

    let corpus = CorpusProcessor::new(&tokenizer).load_and_tokenize(0, &[ncc, c4])?;

    // no delimiter at the end of the first corpus: its last document continues in the second one
    assert_eq!(
        corpus.documents,
        vec![
            vec![vec![first_word]],
            vec![vec![first_word + 1], vec![first_word + 2]],
            vec![vec![first_word + 3]],
        ]
    );
    Ok(())
}

#[test]
fn lines_without_tokens_are_skipped() -> anyhow::Result<()> {
    let directory = TempDir::new()?;
    let (vocab_path, first_word) = write_vocab(directory.path(), &["hello"])?;
    let tokenizer = TokenizerOption::from_file(&vocab_path, false)?;

    let mut accumulator = DocumentAccumulator::new(&tokenizer);
    for line in ["  ", "\t", "hello  ", "", "", ""] {
        accumulator.push_line(line)?;
    }
    assert_eq!(accumulator.total_tokens(), 1);
    let corpus = accumulator.finish();
    assert_eq!(corpus.documents, vec![vec![vec![first_word]]]);
    Ok(())
}

#[test]
fn carriage_returns_end_lines() -> anyhow::Result<()> {
    let directory = TempDir::new()?;
    let (vocab_path, first_word) = write_vocab(directory.path(), &["hello", "world", "foo", "bar"])?;
    let (hello, world, foo, bar) = (first_word, first_word + 1, first_word + 2, first_word + 3);
    let tokenizer = TokenizerOption::from_file(&vocab_path, false)?;

    let mut accumulator = DocumentAccumulator::new(&tokenizer);
    accumulator.push_reader(Cursor::new("hello\r\rworld\r\nfoo\rbar\r\n\r\n"))?;
    assert_eq!(
        accumulator.finish().documents,
        vec![vec![vec![hello]], vec![vec![world], vec![foo], vec![bar]]]
    );

    let mut accumulator = DocumentAccumulator::new(&tokenizer);
    assert!(matches!(
        accumulator.push_reader(Cursor::new(vec![b'h', 0xff, b'\n'])),
        Err(PretrainError::IOError(_))
    ));
    Ok(())
}

#[test]
fn missing_or_invalid_sources_are_io_errors() -> anyhow::Result<()> {
    let directory = TempDir::new()?;
    let (vocab_path, _) = write_vocab(directory.path(), &["hello"])?;
    let tokenizer = TokenizerOption::from_file(&vocab_path, false)?;
    let template = PathTemplate::parse(directory.path().join("{:03d}.txt.gz").to_str().unwrap())?;
    let processor = CorpusProcessor::new(&tokenizer);

    assert!(matches!(
        processor.load_and_tokenize(0, &[template.clone()]),
        Err(PretrainError::IOError(_))
    ));

    std::fs::write(template.render(1), "plain text, not gzip")?;
    assert!(matches!(
        processor.load_and_tokenize(1, &[template]),
        Err(PretrainError::IOError(_))
    ));

    assert!(matches!(
        TokenizerOption::from_file(directory.path().join("missing.txt"), false),
        Err(PretrainError::IOError(_))
    ));
    Ok(())
}

#[test]
fn special_tokens_resolve_from_the_vocabulary() -> anyhow::Result<()> {
    let directory = TempDir::new()?;
    let (vocab_path, _) = write_vocab(directory.path(), &["hello"])?;
    let tokenizer = TokenizerOption::from_file(&vocab_path, false)?;

    let special_tokens = SpecialTokens::resolve(&tokenizer, &SpecialTokenNames::default(), 4)?;
    assert_eq!(special_tokens.pad_token_id, 0);
    assert_eq!(special_tokens.eos_token_id, 5);
    assert_eq!(special_tokens.sentinel_token_ids, vec![6, 7, 8, 9]);

    assert!(matches!(
        SpecialTokens::resolve(&tokenizer, &SpecialTokenNames::default(), 5),
        Err(PretrainError::TokenizerError(_))
    ));
    Ok(())
}
