// Copyright 2018 Mesh TensorFlow authors, T5 Authors and HuggingFace Inc. team.
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

use crate::t5::encoder::{padding_bias, T5Stack};
use crate::{Config, PretrainError};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use tch::nn::{embedding, LinearConfig};
use tch::{nn, Kind, Reduction, Tensor};

#[derive(Clone, Debug, Serialize, Deserialize, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
/// # Options for T5 Feed-forward projection layer
pub enum FeedForwardProj {
    /// ReLU
    Relu,
    /// Gated geLU
    GatedGelu,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
/// # T5 model configuration
/// Defines the T5 model architecture (e.g. number of layers, hidden layer size...)
pub struct T5Config {
    pub dropout_rate: f64,
    pub d_model: i64,
    pub d_ff: i64,
    pub d_kv: i64,
    pub layer_norm_epsilon: f64,
    pub num_heads: i64,
    pub num_layers: i64,
    /// Defaults to `num_layers`
    #[serde(default)]
    pub num_decoder_layers: Option<i64>,
    pub relative_attention_num_buckets: i64,
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: i64,
    pub vocab_size: i64,
    #[serde(default = "default_feed_forward_proj")]
    pub feed_forward_proj: FeedForwardProj,
    #[serde(default)]
    pub tie_word_embeddings: Option<bool>,
}

fn default_max_distance() -> i64 {
    128
}

fn default_feed_forward_proj() -> FeedForwardProj {
    FeedForwardProj::Relu
}

impl Config for T5Config {}

impl Default for T5Config {
    fn default() -> Self {
        T5Config {
            dropout_rate: 0.1,
            d_model: 512,
            d_ff: 2048,
            d_kv: 64,
            layer_norm_epsilon: 1e-6,
            num_heads: 8,
            num_layers: 6,
            num_decoder_layers: None,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
            vocab_size: 32128,
            feed_forward_proj: FeedForwardProj::Relu,
            tie_word_embeddings: None,
        }
    }
}

/// # Output of a pretraining forward pass
pub struct PretrainingOutput {
    /// Mean cross-entropy over the non-padding target positions (scalar)
    pub loss: Tensor,
    /// Fraction of non-padding target positions predicted exactly (scalar)
    pub accuracy: Tensor,
}

/// # Narrow interface of a model trained by the training loop
///
/// Inputs are `Int64` tensors of shape (*batch size*, *length*); targets are padded with the
/// padding id, which does not contribute to the loss nor to the accuracy.
pub trait PretrainingModel {
    fn forward_t(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        target_ids: &Tensor,
        train: bool,
    ) -> Result<PretrainingOutput, PretrainError>;
}

/// # T5 encoder-decoder with a language modeling head
/// It is made of the following blocks:
/// - `word_embedding`: `nn::Embedding` shared by the encoder and the decoder
/// - `encoder`: `T5Stack` of bidirectional self-attention blocks
/// - `decoder`: `T5Stack` of causal self-attention and encoder cross-attention blocks
/// - `lm_head`: projection to the vocabulary, tied to the embeddings unless configured otherwise
///
/// Decoder inputs are the targets shifted right by one position, starting with the padding token.
pub struct T5ForPretraining {
    word_embedding: nn::Embedding,
    encoder: T5Stack,
    decoder: T5Stack,
    lm_head: Option<nn::Linear>,
    model_dim: f64,
    pad_token_id: i64,
}

impl T5ForPretraining {
    /// Build a new `T5ForPretraining`
    ///
    /// # Arguments
    ///
    /// * `p` - Variable store path for the root of the T5 model
    /// * `config` - `T5Config` object defining the model architecture
    /// * `pad_token_id` - padding id of the vocabulary, also used as decoder start token
    ///
    /// # Example
    ///
    /// ```no_run
    /// use t5_pretrain::t5::{T5Config, T5ForPretraining};
    /// use t5_pretrain::Config;
    /// use tch::{nn, Device};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let vs = nn::VarStore::new(Device::Cpu);
    /// let config = T5Config::from_file("path/to/config.json")?;
    /// let model = T5ForPretraining::new(vs.root(), &config, 0);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new<'p, P>(p: P, config: &T5Config, pad_token_id: i64) -> T5ForPretraining
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();

        let word_embedding = embedding(
            p / "word_embedding",
            config.vocab_size,
            config.d_model,
            Default::default(),
        );
        let encoder = T5Stack::new(p / "encoder", config, config.num_layers, false);
        let decoder = T5Stack::new(
            p / "decoder",
            config,
            config.num_decoder_layers.unwrap_or(config.num_layers),
            true,
        );
        let lm_head = if config.tie_word_embeddings.unwrap_or(true) {
            None
        } else {
            Some(nn::linear(
                p / "lm_head",
                config.d_model,
                config.vocab_size,
                LinearConfig {
                    bias: false,
                    ..Default::default()
                },
            ))
        };

        T5ForPretraining {
            word_embedding,
            encoder,
            decoder,
            lm_head,
            model_dim: config.d_model as f64,
            pad_token_id,
        }
    }

    fn shift_right(&self, target_ids: &Tensor) -> Tensor {
        let start = target_ids.narrow(1, 0, 1).full_like(self.pad_token_id);
        let length = target_ids.size()[1];
        Tensor::cat(&[start, target_ids.narrow(1, 0, length - 1)], 1)
    }

    /// Logits of shape (*batch size*, *target length*, *vocab size*)
    pub fn logits(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        target_ids: &Tensor,
        train: bool,
    ) -> Tensor {
        let encoder_output = self.encoder.forward_t(
            &input_ids.apply(&self.word_embedding),
            attention_mask,
            None,
            train,
        );
        let encoder_bias = padding_bias(attention_mask);

        let decoder_input_ids = self.shift_right(target_ids);
        let decoder_mask = decoder_input_ids.ones_like();
        let decoder_output = self.decoder.forward_t(
            &decoder_input_ids.apply(&self.word_embedding),
            &decoder_mask,
            Some((&encoder_output, &encoder_bias)),
            train,
        );

        match &self.lm_head {
            Some(lm_head) => decoder_output.apply(lm_head),
            None => {
                (decoder_output * self.model_dim.powf(-0.5))
                    .linear::<Tensor>(&self.word_embedding.ws, None)
            }
        }
    }
}

impl PretrainingModel for T5ForPretraining {
    fn forward_t(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        target_ids: &Tensor,
        train: bool,
    ) -> Result<PretrainingOutput, PretrainError> {
        let input_size = input_ids.size();
        let target_size = target_ids.size();
        if input_size.len() != 2
            || target_size.len() != 2
            || input_size[0] != target_size[0]
            || attention_mask.size() != input_size
            || target_size[1] == 0
        {
            return Err(PretrainError::TchError(format!(
                "invalid batch shapes: inputs {input_size:?}, mask {:?}, targets {target_size:?}",
                attention_mask.size()
            )));
        }

        let logits = self
            .logits(input_ids, attention_mask, target_ids, train)
            .to_kind(Kind::Float);
        let vocab_size = logits.size()[2];

        let loss = logits.view([-1, vocab_size]).cross_entropy_loss::<Tensor>(
            &target_ids.view(-1),
            None,
            Reduction::Mean,
            self.pad_token_id,
            0.0,
        );

        let accuracy = tch::no_grad(|| {
            let is_target = target_ids.ne(self.pad_token_id);
            let correct = logits
                .argmax(-1, false)
                .eq_tensor(target_ids)
                .logical_and(&is_target)
                .sum(Kind::Float);
            correct / is_target.sum(Kind::Float).clamp_min(1.0)
        });

        Ok(PretrainingOutput { loss, accuracy })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tch::Device;

    fn tiny_config() -> T5Config {
        T5Config {
            dropout_rate: 0.0,
            d_model: 16,
            d_ff: 32,
            d_kv: 4,
            num_heads: 4,
            num_layers: 2,
            vocab_size: 24,
            ..Default::default()
        }
    }

    #[test]
    fn forward_returns_scalar_metrics() -> anyhow::Result<()> {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let model = T5ForPretraining::new(vs.root(), &tiny_config(), 0);

        let input_ids = Tensor::from_slice(&[5i64, 6, 7, 1, 8, 9, 1, 0]).view([2, 4]);
        let attention_mask = input_ids.ne(0).to_kind(Kind::Int64);
        let target_ids = Tensor::from_slice(&[10i64, 11, 1, 10, 1, 0]).view([2, 3]);

        let output = model.forward_t(&input_ids, &attention_mask, &target_ids, true)?;
        assert_eq!(output.loss.size(), Vec::<i64>::new());
        let loss = output.loss.double_value(&[]);
        assert!(loss.is_finite() && loss > 0.0);
        let accuracy = output.accuracy.double_value(&[]);
        assert!((0.0..=1.0).contains(&accuracy));

        output.loss.backward();
        let embedding_grad = vs
            .variables()
            .get("word_embedding.weight")
            .map(|variable| variable.grad().defined());
        assert_eq!(embedding_grad, Some(true));
        Ok(())
    }

    #[test]
    fn mismatched_batches_are_rejected() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = T5ForPretraining::new(vs.root(), &tiny_config(), 0);
        let input_ids = Tensor::from_slice(&[5i64, 6, 1]).view([1, 3]);
        let target_ids = Tensor::from_slice(&[5i64, 1, 5, 1]).view([2, 2]);
        let result = model.forward_t(&input_ids, &input_ids.ones_like(), &target_ids, false);
        assert!(result.is_err());
    }
}
