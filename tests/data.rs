use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use t5_pretrain::corpus::{Document, TokenShard};
use t5_pretrain::data::{BatchLoader, PretrainingDataset, SpanMaskingConfig, TrainingExample};
use t5_pretrain::tokenization::SpecialTokens;
use t5_pretrain::PretrainError;
use tch::Kind;

const PAD: i64 = 0;
const EOS: i64 = 1;

fn special_tokens(num_sentinels: i64) -> SpecialTokens {
    SpecialTokens {
        pad_token_id: PAD,
        eos_token_id: EOS,
        sentinel_token_ids: (2..2 + num_sentinels).collect(),
    }
}

/// Document made of lines of consecutive word ids, starting at `first`.
fn document(first: i64, line_lengths: &[i64]) -> Document {
    let mut next = first;
    line_lengths
        .iter()
        .map(|&length| {
            let line: Vec<i64> = (next..next + length).collect();
            next += length;
            line
        })
        .collect()
}

fn masking(seq_length: usize, mask_p: f64, short_p: f64) -> SpanMaskingConfig {
    SpanMaskingConfig {
        seq_length,
        mask_p,
        short_p,
        mean_span_length: 3.0,
    }
}

/// Puts the target spans back in place of their sentinels.
fn reconstruct(example: &TrainingExample, sentinels: &[i64]) -> Vec<i64> {
    let mut tokens = Vec::new();
    for &token in &example.input_ids[..example.input_ids.len() - 1] {
        if sentinels.contains(&token) {
            let start = example
                .target_ids
                .iter()
                .position(|&target| target == token)
                .expect("sentinel missing from the target")
                + 1;
            tokens.extend(
                example.target_ids[start..]
                    .iter()
                    .take_while(|&&target| target != EOS && !sentinels.contains(&target)),
            );
        } else {
            tokens.push(token);
        }
    }
    tokens
}

#[test]
fn documents_are_split_into_segments() -> anyhow::Result<()> {
    let shard = TokenShard::from_documents(vec![
        document(1000, &[10, 25]),
        document(2000, &[4]),
    ]);
    let dataset = PretrainingDataset::new(shard, special_tokens(10), masking(16, 0.15, 0.0))?;

    assert_eq!(dataset.len(), 4);
    let lengths: Vec<usize> = (0..4).map(|i| dataset.segment(i).unwrap().len()).collect();
    assert_eq!(lengths, vec![15, 15, 5, 4]);
    // lines of a document are concatenated
    assert_eq!(dataset.segment(0).unwrap(), (1000..1015).collect::<Vec<_>>().as_slice());
    assert_eq!(dataset.segment(3).unwrap(), &[2000, 2001, 2002, 2003]);
    assert!(dataset.segment(4).is_none());
    Ok(())
}

#[test]
fn examples_fit_the_sequence_length_and_restore_the_segment() -> anyhow::Result<()> {
    let special_tokens = special_tokens(10);
    let sentinels = special_tokens.sentinel_token_ids.clone();
    let shard = TokenShard::from_documents((0..20).map(|d| document(1000 * (d + 1), &[7, 30])).collect());
    let dataset = PretrainingDataset::new(shard, special_tokens, masking(32, 0.3, 0.0))?;
    let mut rng = StdRng::seed_from_u64(3);

    for index in 0..dataset.len() {
        for _ in 0..5 {
            let example = dataset.get(index, &mut rng).unwrap();
            assert!(example.input_ids.len() <= 32);
            assert_eq!(example.input_ids.last(), Some(&EOS));
            assert_eq!(example.target_ids.last(), Some(&EOS));
            assert!(sentinels.contains(&example.target_ids[0]));
            assert_eq!(
                reconstruct(&example, &sentinels),
                dataset.segment(index).unwrap()
            );
        }
    }
    Ok(())
}

#[test]
fn spans_are_capped_by_the_sentinel_count() -> anyhow::Result<()> {
    let special_tokens = special_tokens(1);
    let shard = TokenShard::from_documents(vec![document(1000, &[40])]);
    let config = SpanMaskingConfig {
        seq_length: 64,
        mask_p: 0.5,
        short_p: 0.0,
        mean_span_length: 1.0,
    };
    let dataset = PretrainingDataset::new(shard, special_tokens, config)?;
    let mut rng = StdRng::seed_from_u64(11);

    for _ in 0..20 {
        let example = dataset.get(0, &mut rng).unwrap();
        assert_eq!(example.input_ids.iter().filter(|&&token| token == 2).count(), 1);
        assert_eq!(example.target_ids[0], 2);
        // 20 masked tokens, the sentinel and EOS
        assert_eq!(example.target_ids.len(), 22);
        assert_eq!(example.input_ids.len(), 22);
    }
    Ok(())
}

#[test]
fn short_segments_are_prefixes() -> anyhow::Result<()> {
    let special_tokens = special_tokens(10);
    let sentinels = special_tokens.sentinel_token_ids.clone();
    let shard = TokenShard::from_documents(vec![document(1000, &[30])]);
    let dataset = PretrainingDataset::new(shard, special_tokens, masking(64, 0.15, 1.0))?;
    let mut rng = StdRng::seed_from_u64(5);

    for _ in 0..20 {
        let example = dataset.get(0, &mut rng).unwrap();
        let restored = reconstruct(&example, &sentinels);
        assert!(restored.len() < 30);
        assert_eq!(restored.as_slice(), &dataset.segment(0).unwrap()[..restored.len()]);
    }
    Ok(())
}

#[test]
fn invalid_settings_are_rejected() {
    let shard = || TokenShard::from_documents(vec![document(1000, &[3])]);
    assert!(matches!(
        PretrainingDataset::new(shard(), special_tokens(2), masking(1, 0.15, 0.1)),
        Err(PretrainError::InvalidConfigurationError(_))
    ));
    assert!(matches!(
        PretrainingDataset::new(shard(), special_tokens(2), masking(8, 1.5, 0.1)),
        Err(PretrainError::InvalidConfigurationError(_))
    ));
    assert!(matches!(
        PretrainingDataset::new(shard(), special_tokens(0), masking(8, 0.15, 0.1)),
        Err(PretrainError::TokenizerError(_))
    ));
}

#[test]
fn loader_yields_full_seeded_batches() -> anyhow::Result<()> {
    let shard = TokenShard::from_documents((0..10).map(|d| document(1000 * (d + 1), &[6])).collect());
    let dataset = Arc::new(PretrainingDataset::new(
        shard,
        special_tokens(4),
        masking(16, 0.3, 0.1),
    )?);
    let loader = BatchLoader::new(dataset, 3, 2)?;
    assert_eq!(loader.batches_available(), 3);

    let first: Vec<_> = loader.epoch(7).collect();
    let second: Vec<_> = loader.epoch(7).collect();
    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 3);
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.size(), 3);
        assert!(a.input_ids.equal(&b.input_ids));
        assert!(a.target_ids.equal(&b.target_ids));
        assert_eq!(a.input_ids.kind(), Kind::Int64);
        // real tokens are exactly the unmasked positions
        let real = a.attention_mask.sum(Kind::Int64).int64_value(&[]);
        let non_pad = a.input_ids.ne(PAD).sum(Kind::Int64).int64_value(&[]);
        assert_eq!(real, non_pad);
    }

    // an abandoned epoch stops its worker
    let mut partial = loader.epoch(8);
    assert!(partial.next().is_some());
    drop(partial);

    assert!(matches!(
        BatchLoader::new(loader_dataset()?, 0, 1),
        Err(PretrainError::InvalidConfigurationError(_))
    ));
    Ok(())
}

fn loader_dataset() -> Result<Arc<PretrainingDataset>, PretrainError> {
    let shard = TokenShard::from_documents(vec![document(1000, &[4])]);
    Ok(Arc::new(PretrainingDataset::new(
        shard,
        special_tokens(2),
        masking(8, 0.15, 0.0),
    )?))
}
