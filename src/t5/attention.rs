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

use crate::t5::encoder::T5LayerNorm;
use crate::t5::T5Config;
use std::borrow::Borrow;
use tch::nn::LinearConfig;
use tch::{nn, Device, Kind, Tensor};

/// # Bucketed relative position bias
/// Shared by all the self-attention layers of a stack. Relative distances are mapped to
/// `relative_attention_num_buckets` buckets: exact buckets for short distances, logarithmically
/// sized buckets up to `relative_attention_max_distance`.
#[derive(Debug)]
pub struct RelativePositionBias {
    embedding: nn::Embedding,
    num_buckets: i64,
    max_distance: i64,
    bidirectional: bool,
}

impl RelativePositionBias {
    pub fn new<'p, P>(p: P, config: &T5Config, bidirectional: bool) -> RelativePositionBias
    where
        P: Borrow<nn::Path<'p>>,
    {
        let embedding = nn::embedding(
            p,
            config.relative_attention_num_buckets,
            config.num_heads,
            Default::default(),
        );
        RelativePositionBias {
            embedding,
            num_buckets: config.relative_attention_num_buckets,
            max_distance: config.relative_attention_max_distance,
            bidirectional,
        }
    }

    fn bucket(&self, relative_position: &Tensor) -> Tensor {
        let (num_buckets, offset, distance) = if self.bidirectional {
            let num_buckets = self.num_buckets / 2;
            (
                num_buckets,
                relative_position.gt(0).to_kind(Kind::Int64) * num_buckets,
                relative_position.abs(),
            )
        } else {
            (
                self.num_buckets,
                relative_position.zeros_like(),
                -relative_position.clamp_max(0),
            )
        };

        let max_exact = num_buckets / 2;
        let is_small = distance.lt(max_exact);
        let log_ratio = (self.max_distance as f64 / max_exact as f64).ln();
        let large = ((distance.to_kind(Kind::Float) / max_exact as f64).log() / log_ratio
            * (num_buckets - max_exact) as f64)
            .to_kind(Kind::Int64)
            + max_exact;
        let large = large.clamp_max(num_buckets - 1);

        offset + distance.where_self(&is_small, &large)
    }

    /// Bias of shape (1, *num_heads*, *query_length*, *key_length*)
    pub fn forward(&self, query_length: i64, key_length: i64, device: Device) -> Tensor {
        let context_position = Tensor::arange(query_length, (Kind::Int64, device)).unsqueeze(1);
        let memory_position = Tensor::arange(key_length, (Kind::Int64, device)).unsqueeze(0);
        let relative_position = memory_position - context_position;
        self.bucket(&relative_position)
            .apply(&self.embedding)
            .permute([2, 0, 1])
            .unsqueeze(0)
    }
}

#[derive(Debug)]
pub struct T5Attention {
    n_heads: i64,
    d_kv: i64,
    inner_dim: i64,
    dropout_rate: f64,
    q: nn::Linear,
    k: nn::Linear,
    v: nn::Linear,
    o: nn::Linear,
}

impl T5Attention {
    pub fn new<'p, P>(p: P, config: &T5Config) -> T5Attention
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let linear_config = LinearConfig {
            bias: false,
            ..Default::default()
        };

        let inner_dim = config.num_heads * config.d_kv;
        let q = nn::linear(p / "q", config.d_model, inner_dim, linear_config);
        let k = nn::linear(p / "k", config.d_model, inner_dim, linear_config);
        let v = nn::linear(p / "v", config.d_model, inner_dim, linear_config);
        let o = nn::linear(p / "o", inner_dim, config.d_model, linear_config);

        T5Attention {
            n_heads: config.num_heads,
            d_kv: config.d_kv,
            inner_dim,
            dropout_rate: config.dropout_rate,
            q,
            k,
            v,
            o,
        }
    }

    fn shape(&self, x: Tensor, bs: i64) -> Tensor {
        x.view((bs, -1, self.n_heads, self.d_kv)).transpose(1, 2)
    }

    fn unshape(&self, x: Tensor, bs: i64) -> Tensor {
        x.transpose(1, 2)
            .contiguous()
            .view((bs, -1, self.inner_dim))
    }

    /// Attention of `hidden_states` over `kv` (itself for self-attention).
    ///
    /// `bias` is added to the attention scores in single precision and broadcasts to
    /// (*batch size*, *num_heads*, *query_length*, *key_length*). It carries both the relative
    /// position bias and the masking.
    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        kv: Option<&Tensor>,
        bias: &Tensor,
        train: bool,
    ) -> Tensor {
        let bs = hidden_states.size()[0];
        let kv = kv.unwrap_or(hidden_states);

        let q = self.shape(hidden_states.apply(&self.q), bs);
        let k = self.shape(kv.apply(&self.k), bs);
        let v = self.shape(kv.apply(&self.v), bs);

        let scores = q.matmul(&k.transpose(-1, -2)).to_kind(Kind::Float) + bias;
        let attention_weights = scores
            .softmax(-1, Kind::Float)
            .to_kind(v.kind())
            .dropout(self.dropout_rate, train);

        self.unshape(attention_weights.matmul(&v), bs)
            .apply(&self.o)
    }
}

pub struct T5LayerSelfAttention {
    self_attention: T5Attention,
    layer_norm: T5LayerNorm,
    dropout_rate: f64,
}

impl T5LayerSelfAttention {
    pub fn new<'p, P>(p: P, config: &T5Config) -> T5LayerSelfAttention
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        T5LayerSelfAttention {
            self_attention: T5Attention::new(p / "SelfAttention", config),
            layer_norm: T5LayerNorm::new(p / "layer_norm", config),
            dropout_rate: config.dropout_rate,
        }
    }

    pub fn forward_t(&self, hidden_states: &Tensor, bias: &Tensor, train: bool) -> Tensor {
        let y = self.self_attention.forward_t(
            &hidden_states.apply(&self.layer_norm),
            None,
            bias,
            train,
        );
        hidden_states + y.dropout(self.dropout_rate, train)
    }
}

pub struct T5LayerCrossAttention {
    encoder_decoder_attention: T5Attention,
    layer_norm: T5LayerNorm,
    dropout_rate: f64,
}

impl T5LayerCrossAttention {
    pub fn new<'p, P>(p: P, config: &T5Config) -> T5LayerCrossAttention
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        T5LayerCrossAttention {
            encoder_decoder_attention: T5Attention::new(p / "EncDecAttention", config),
            layer_norm: T5LayerNorm::new(p / "layer_norm", config),
            dropout_rate: config.dropout_rate,
        }
    }

    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        encoder_hidden_states: &Tensor,
        encoder_mask: &Tensor,
        train: bool,
    ) -> Tensor {
        let y = self.encoder_decoder_attention.forward_t(
            &hidden_states.apply(&self.layer_norm),
            Some(encoder_hidden_states),
            encoder_mask,
            train,
        );
        hidden_states + y.dropout(self.dropout_rate, train)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bidirectional_buckets_split_directions() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = T5Config::default();
        let bias = RelativePositionBias::new(vs.root() / "bias", &config, true);
        let positions = Tensor::from_slice(&[-3i64, -1, 0, 1, 3, 500]);
        let buckets = Vec::<i64>::try_from(&bias.bucket(&positions)).unwrap();
        assert_eq!(buckets[2], 0);
        assert_eq!(buckets[0], 3);
        assert_eq!(buckets[3], 16 + 1);
        // distances beyond the maximum saturate on the last bucket
        assert_eq!(buckets[5], 31);
    }
}
