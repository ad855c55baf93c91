//! # T5 (Raffel et al.)
//!
//! Implementation of the T5 encoder-decoder used as the model trained by the pretraining loop
//! ([Exploring the Limits of Transfer Learning with a Unified Text-to-Text Transformer](https://arxiv.org/abs/1910.10683)).
//! The model is built fresh from a `T5Config` JSON file and exposes the narrow
//! [`PretrainingModel`] interface: given span-corrupted inputs and targets, it returns the loss
//! and the token accuracy.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use t5_pretrain::t5::{PretrainingModel, T5Config, T5ForPretraining};
//! use t5_pretrain::Config;
//! use tch::{nn, Device, Tensor};
//!
//! let vs = nn::VarStore::new(Device::cuda_if_available());
//! let config = T5Config::from_file("path/to/config.json")?;
//! let model = T5ForPretraining::new(vs.root(), &config, 0);
//!
//! let input_ids = Tensor::from_slice(&[37i64, 32099, 9, 1]).view([1, 4]);
//! let target_ids = Tensor::from_slice(&[32099i64, 1782, 1]).view([1, 3]);
//! let output = model.forward_t(&input_ids, &input_ids.ones_like(), &target_ids, true)?;
//! output.loss.backward();
//! # Ok(())
//! # }
//! ```

mod attention;
mod encoder;
mod t5_model;

pub use attention::RelativePositionBias;
pub use encoder::{T5LayerNorm, T5Stack};
pub use t5_model::{
    FeedForwardProj, PretrainingModel, PretrainingOutput, T5Config, T5ForPretraining,
};
