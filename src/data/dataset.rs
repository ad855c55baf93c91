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

use crate::corpus::TokenShard;
use crate::tokenization::SpecialTokens;
use crate::PretrainError;
use rand::seq::index::sample;
use rand::Rng;

/// # Span corruption settings
#[derive(Debug, Clone, PartialEq)]
pub struct SpanMaskingConfig {
    /// Maximum number of input tokens of an example (including the final EOS)
    pub seq_length: usize,
    /// Fraction of the tokens of a segment replaced by sentinels
    pub mask_p: f64,
    /// Probability to train on a randomly shortened segment
    pub short_p: f64,
    /// Average length of a masked span
    pub mean_span_length: f64,
}

impl Default for SpanMaskingConfig {
    fn default() -> Self {
        SpanMaskingConfig {
            seq_length: 512,
            mask_p: 0.15,
            short_p: 0.1,
            mean_span_length: 3.0,
        }
    }
}

/// # Training example
/// Span-corrupted input and the matching target, both terminated by EOS. Not padded.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub input_ids: Vec<i64>,
    pub target_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    document: usize,
    start: usize,
    end: usize,
}

/// # Span corruption dataset over a token shard
///
/// The lines of every document are concatenated and split into segments of at most
/// `seq_length - 1` tokens, which leaves room for the end-of-sequence token. Segments never cross
/// document boundaries. Examples are produced on demand from a segment index and a random
/// generator, so that the same index yields a different corruption at every epoch.
pub struct PretrainingDataset {
    documents: Vec<Vec<i64>>,
    segments: Vec<Segment>,
    special_tokens: SpecialTokens,
    config: SpanMaskingConfig,
}

impl PretrainingDataset {
    pub fn new(
        shard: TokenShard,
        special_tokens: SpecialTokens,
        config: SpanMaskingConfig,
    ) -> Result<PretrainingDataset, PretrainError> {
        if config.seq_length < 2 {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "sequence length must be at least 2, got {}",
                config.seq_length
            )));
        }
        if !(0.0..=1.0).contains(&config.mask_p) || !(0.0..=1.0).contains(&config.short_p) {
            return Err(PretrainError::InvalidConfigurationError(
                "masking and short sequence probabilities must lie in [0, 1]".to_string(),
            ));
        }
        if config.mean_span_length < 1.0 {
            return Err(PretrainError::InvalidConfigurationError(format!(
                "mean span length must be at least 1, got {}",
                config.mean_span_length
            )));
        }
        if special_tokens.sentinel_token_ids.is_empty() {
            return Err(PretrainError::TokenizerError(
                "span corruption requires at least one sentinel token".to_string(),
            ));
        }

        let window = config.seq_length - 1;
        let documents: Vec<Vec<i64>> = shard
            .into_documents()
            .into_iter()
            .map(|document| document.concat())
            .collect();
        let mut segments = Vec::new();
        for (index, tokens) in documents.iter().enumerate() {
            let mut start = 0;
            while start < tokens.len() {
                let end = (start + window).min(tokens.len());
                segments.push(Segment {
                    document: index,
                    start,
                    end,
                });
                start = end;
            }
        }

        Ok(PretrainingDataset {
            documents,
            segments,
            special_tokens,
            config,
        })
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn seq_length(&self) -> usize {
        self.config.seq_length
    }

    pub fn pad_token_id(&self) -> i64 {
        self.special_tokens.pad_token_id
    }

    /// Tokens of the segment at `index`, before corruption.
    pub fn segment(&self, index: usize) -> Option<&[i64]> {
        self.segments
            .get(index)
            .map(|segment| &self.documents[segment.document][segment.start..segment.end])
    }

    pub fn get<R: Rng + ?Sized>(&self, index: usize, rng: &mut R) -> Option<TrainingExample> {
        let mut tokens = self.segment(index)?;
        if tokens.len() > 1 && rng.gen_bool(self.config.short_p) {
            let length = rng.gen_range(1..tokens.len());
            tokens = &tokens[..length];
        }
        Some(self.corrupt_spans(tokens, rng))
    }

    fn corrupt_spans<R: Rng + ?Sized>(&self, tokens: &[i64], rng: &mut R) -> TrainingExample {
        let length = tokens.len();
        let sentinels = &self.special_tokens.sentinel_token_ids;
        let eos = self.special_tokens.eos_token_id;

        let n_noise = ((length as f64 * self.config.mask_p).round() as usize).clamp(1, length);
        let n_clean = length - n_noise;
        // spans are separated by at least one clean token
        let n_spans = ((n_noise as f64 / self.config.mean_span_length).round() as usize)
            .clamp(1, n_noise)
            .min(sentinels.len())
            .min(n_clean + 1);

        let noise_lengths = random_composition(n_noise, n_spans, rng);
        // n_spans + 1 clean runs: before the first span, between spans, after the last one
        let mut clean_lengths = random_composition_with_zeros(n_clean - (n_spans - 1), n_spans + 1, rng);
        for clean_length in clean_lengths.iter_mut().take(n_spans).skip(1) {
            *clean_length += 1;
        }

        let mut input_ids = Vec::with_capacity(n_clean + n_spans + 1);
        let mut target_ids = Vec::with_capacity(n_noise + n_spans + 1);
        let mut position = 0;
        for span in 0..n_spans {
            input_ids.extend_from_slice(&tokens[position..position + clean_lengths[span]]);
            position += clean_lengths[span];

            input_ids.push(sentinels[span]);
            target_ids.push(sentinels[span]);
            target_ids.extend_from_slice(&tokens[position..position + noise_lengths[span]]);
            position += noise_lengths[span];
        }
        input_ids.extend_from_slice(&tokens[position..]);
        input_ids.push(eos);
        target_ids.push(eos);

        TrainingExample {
            input_ids,
            target_ids,
        }
    }
}

/// Splits `total` into `parts` strictly positive integers.
fn random_composition<R: Rng + ?Sized>(total: usize, parts: usize, rng: &mut R) -> Vec<usize> {
    if parts <= 1 {
        return vec![total];
    }
    let mut cuts = sample(rng, total - 1, parts - 1).into_vec();
    cuts.iter_mut().for_each(|cut| *cut += 1);
    cuts.sort_unstable();
    let mut lengths = Vec::with_capacity(parts);
    let mut previous = 0;
    for cut in cuts {
        lengths.push(cut - previous);
        previous = cut;
    }
    lengths.push(total - previous);
    lengths
}

/// Splits `total` into `parts` non-negative integers.
fn random_composition_with_zeros<R: Rng + ?Sized>(
    total: usize,
    parts: usize,
    rng: &mut R,
) -> Vec<usize> {
    random_composition(total + parts, parts, rng)
        .into_iter()
        .map(|length| length - 1)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn compositions_sum_to_total() {
        let mut rng = StdRng::seed_from_u64(0);
        for total in 1..40 {
            for parts in 1..=total {
                let lengths = random_composition(total, parts, &mut rng);
                assert_eq!(lengths.len(), parts);
                assert_eq!(lengths.iter().sum::<usize>(), total);
                assert!(lengths.iter().all(|&length| length > 0));
            }
            let lengths = random_composition_with_zeros(total, 5, &mut rng);
            assert_eq!(lengths.len(), 5);
            assert_eq!(lengths.iter().sum::<usize>(), total);
        }
    }
}
