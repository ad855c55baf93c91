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

use rust_tokenizers::error::TokenizerError;
use tch::TchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PretrainError {
    #[error("Invalid configuration error: {0}")]
    InvalidConfigurationError(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("Collective communication error: {0}")]
    CollectiveCommunicationError(String),

    #[error("Checkpoint corruption error: {0}")]
    CheckpointCorruptionError(String),

    #[error("Tch tensor error: {0}")]
    TchError(String),
}

impl PretrainError {
    /// Process exit status used by the binaries' top-level handler.
    ///
    /// Configuration and communication failures get their own codes so that the
    /// orchestrator can tell "fix the job definition" apart from "restart from checkpoint".
    pub fn exit_code(&self) -> i32 {
        match self {
            PretrainError::InvalidConfigurationError(_) => 2,
            PretrainError::CollectiveCommunicationError(_) => 3,
            PretrainError::CheckpointCorruptionError(_) => 4,
            PretrainError::IOError(_)
            | PretrainError::TokenizerError(_)
            | PretrainError::TchError(_) => 1,
        }
    }
}

impl From<std::io::Error> for PretrainError {
    fn from(error: std::io::Error) -> Self {
        PretrainError::IOError(error.to_string())
    }
}

impl From<TokenizerError> for PretrainError {
    fn from(error: TokenizerError) -> Self {
        PretrainError::TokenizerError(error.to_string())
    }
}

impl From<TchError> for PretrainError {
    fn from(error: TchError) -> Self {
        PretrainError::TchError(error.to_string())
    }
}

impl From<tokenizers::Error> for PretrainError {
    fn from(error: tokenizers::Error) -> Self {
        PretrainError::TokenizerError(error.to_string())
    }
}
