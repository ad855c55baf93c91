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

use crate::t5::attention::{RelativePositionBias, T5LayerCrossAttention, T5LayerSelfAttention};
use crate::t5::{FeedForwardProj, T5Config};
use std::borrow::Borrow;
use tch::nn::{Init, LinearConfig, Module};
use tch::{nn, Kind, Tensor};

/// Large negative score for masked positions, representable in half precision once softmaxed.
const MASK_VALUE: f64 = -1e9;

/// # Root mean square layer norm without bias nor centering
#[derive(Debug)]
pub struct T5LayerNorm {
    weight: Tensor,
    epsilon: f64,
}

impl T5LayerNorm {
    pub fn new<'p, P>(p: P, config: &T5Config) -> T5LayerNorm
    where
        P: Borrow<nn::Path<'p>>,
    {
        T5LayerNorm {
            weight: p.borrow().var("weight", &[config.d_model], Init::Const(1.0)),
            epsilon: config.layer_norm_epsilon,
        }
    }
}

impl Module for T5LayerNorm {
    fn forward(&self, x: &Tensor) -> Tensor {
        let input_kind = x.kind();
        let x = x.to_kind(Kind::Float);
        let variance = x.square().mean_dim([-1].as_slice(), true, Kind::Float);
        (&self.weight * (x * (variance + self.epsilon).rsqrt())).to_kind(input_kind)
    }
}

enum DenseProjection {
    Relu { wi: nn::Linear },
    GatedGelu { wi_0: nn::Linear, wi_1: nn::Linear },
}

pub struct T5DenseActDense {
    projection: DenseProjection,
    wo: nn::Linear,
    dropout_rate: f64,
}

impl T5DenseActDense {
    pub fn new<'p, P>(p: P, config: &T5Config) -> T5DenseActDense
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let linear_config = LinearConfig {
            bias: false,
            ..Default::default()
        };
        let projection = match config.feed_forward_proj {
            FeedForwardProj::Relu => DenseProjection::Relu {
                wi: nn::linear(p / "wi", config.d_model, config.d_ff, linear_config),
            },
            FeedForwardProj::GatedGelu => DenseProjection::GatedGelu {
                wi_0: nn::linear(p / "wi_0", config.d_model, config.d_ff, linear_config),
                wi_1: nn::linear(p / "wi_1", config.d_model, config.d_ff, linear_config),
            },
        };
        let wo = nn::linear(p / "wo", config.d_ff, config.d_model, linear_config);

        T5DenseActDense {
            projection,
            wo,
            dropout_rate: config.dropout_rate,
        }
    }

    pub fn forward_t(&self, hidden_states: &Tensor, train: bool) -> Tensor {
        let hidden_states = match &self.projection {
            DenseProjection::Relu { wi } => hidden_states.apply(wi).relu(),
            DenseProjection::GatedGelu { wi_0, wi_1 } => {
                hidden_states.apply(wi_0).gelu("tanh") * hidden_states.apply(wi_1)
            }
        };
        hidden_states
            .dropout(self.dropout_rate, train)
            .apply(&self.wo)
    }
}

pub struct T5LayerFF {
    dense_act_dense: T5DenseActDense,
    layer_norm: T5LayerNorm,
    dropout_rate: f64,
}

impl T5LayerFF {
    pub fn new<'p, P>(p: P, config: &T5Config) -> T5LayerFF
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        T5LayerFF {
            dense_act_dense: T5DenseActDense::new(p / "DenseReluDense", config),
            layer_norm: T5LayerNorm::new(p / "layer_norm", config),
            dropout_rate: config.dropout_rate,
        }
    }

    pub fn forward_t(&self, hidden_states: &Tensor, train: bool) -> Tensor {
        let y = self
            .dense_act_dense
            .forward_t(&hidden_states.apply(&self.layer_norm), train);
        hidden_states + y.dropout(self.dropout_rate, train)
    }
}

pub struct T5Block {
    self_attention: T5LayerSelfAttention,
    cross_attention: Option<T5LayerCrossAttention>,
    ff_layer: T5LayerFF,
}

impl T5Block {
    pub fn new<'p, P>(p: P, config: &T5Config, is_decoder: bool) -> T5Block
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow() / "layer";
        let self_attention = T5LayerSelfAttention::new(&p / 0, config);
        let (cross_attention, ff_index) = if is_decoder {
            (Some(T5LayerCrossAttention::new(&p / 1, config)), 2)
        } else {
            (None, 1)
        };
        let ff_layer = T5LayerFF::new(&p / ff_index, config);

        T5Block {
            self_attention,
            cross_attention,
            ff_layer,
        }
    }

    pub fn forward_t(
        &self,
        hidden_states: &Tensor,
        self_attention_bias: &Tensor,
        encoder: Option<(&Tensor, &Tensor)>,
        train: bool,
    ) -> Tensor {
        let mut hidden_states =
            self.self_attention
                .forward_t(hidden_states, self_attention_bias, train);
        if let (Some(cross_attention), Some((encoder_hidden_states, encoder_mask))) =
            (&self.cross_attention, encoder)
        {
            hidden_states = cross_attention.forward_t(
                &hidden_states,
                encoder_hidden_states,
                encoder_mask,
                train,
            );
        }
        self.ff_layer.forward_t(&hidden_states, train)
    }
}

/// Additive mask of shape (*batch size*, 1, 1, *key_length*) from a 0/1 padding mask.
pub(crate) fn padding_bias(attention_mask: &Tensor) -> Tensor {
    let inverted: Tensor = 1.0 - attention_mask.to_kind(Kind::Float);
    inverted
        .unsqueeze(1)
        .unsqueeze(1)
        * MASK_VALUE
}

/// Additive mask of shape (1, 1, *length*, *length*) hiding future positions.
fn causal_bias(length: i64, device: tch::Device) -> Tensor {
    let future = Tensor::ones([length, length], (Kind::Float, device)).triu(1);
    (future * MASK_VALUE).unsqueeze(0).unsqueeze(0)
}

/// # Stack of encoder or decoder blocks
pub struct T5Stack {
    blocks: Vec<T5Block>,
    position_bias: RelativePositionBias,
    final_layer_norm: T5LayerNorm,
    dropout_rate: f64,
    is_decoder: bool,
}

impl T5Stack {
    pub fn new<'p, P>(p: P, config: &T5Config, num_layers: i64, is_decoder: bool) -> T5Stack
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let p_blocks = p / "block";
        let blocks = (0..num_layers)
            .map(|layer_index| T5Block::new(&p_blocks / layer_index, config, is_decoder))
            .collect();

        T5Stack {
            blocks,
            position_bias: RelativePositionBias::new(
                p / "relative_attention_bias",
                config,
                !is_decoder,
            ),
            final_layer_norm: T5LayerNorm::new(p / "final_layer_norm", config),
            dropout_rate: config.dropout_rate,
            is_decoder,
        }
    }

    /// Runs the stack over embedded inputs of shape (*batch size*, *length*, *d_model*).
    ///
    /// For a decoder, `encoder` holds the encoder output and its additive padding mask.
    pub fn forward_t(
        &self,
        input_embeds: &Tensor,
        attention_mask: &Tensor,
        encoder: Option<(&Tensor, &Tensor)>,
        train: bool,
    ) -> Tensor {
        let length = input_embeds.size()[1];
        let device = input_embeds.device();

        let mut self_attention_bias =
            self.position_bias.forward(length, length, device) + padding_bias(attention_mask);
        if self.is_decoder {
            self_attention_bias = self_attention_bias + causal_bias(length, device);
        }

        let mut hidden_states = input_embeds.dropout(self.dropout_rate, train);
        for block in &self.blocks {
            hidden_states = block.forward_t(&hidden_states, &self_attention_bias, encoder, train);
        }
        hidden_states
            .apply(&self.final_layer_norm)
            .dropout(self.dropout_rate, train)
    }
}
