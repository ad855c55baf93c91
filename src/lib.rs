//! # T5 pretraining
//!
//! Sharded corpus preparation and multi-process pretraining of T5 sequence-to-sequence models
//! with the span-corruption objective, built on [tch](https://github.com/LaurentMazare/tch-rs).
//!
//! The crate covers two stages:
//! - corpus preparation (`tokenize-corpus` binary): every worker rank reads its compressed text
//!   files, splits them into documents at blank lines, tokenizes every line and writes its
//!   documents round-robin into a fixed number of token shards ([`corpus`])
//! - pretraining (`pretrain` binary): one process per accelerator, each reading a different shard
//!   per epoch ([`data`]), with gradients averaged across processes ([`distributed`]), mixed
//!   precision, clipping, learning rate schedule and a single-file checkpoint allowing an exact
//!   resume ([`training`], [`optim`])
//!
//! The model ([`t5`]) is a compact T5 encoder-decoder whose architecture is read from a JSON
//! configuration file.

pub mod common;
pub mod corpus;
pub mod data;
pub mod distributed;
pub mod optim;
pub mod t5;
pub mod tokenization;
pub mod training;

pub use common::error::PretrainError;
pub use common::Config;
