// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error handling for weft operations
//!
//! Two error families matter at this layer: contract violations, which are
//! detected locally on the offending rank before anything touches the wire,
//! and transport failures, which are fatal for the calling rank. Mismatched
//! collective ordering across ranks is neither; it manifests as deadlock and
//! is never reported here.

use std::fmt;

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// Local precondition violation, caught before any transport call
    Contract = 1,
    /// Received payload does not match the posted receive buffer
    Truncation = 2,
    /// Failure inside the rank fabric; the calling rank cannot continue
    Fatal = 3,
    /// Invalid group construction parameters
    Config = 4,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Contract => write!(f, "Contract violation"),
            Code::Truncation => write!(f, "Truncation"),
            Code::Fatal => write!(f, "Fatal transport failure"),
            Code::Config => write!(f, "Configuration error"),
        }
    }
}

/// Main error type for weft operations
#[derive(thiserror::Error, Debug)]
pub enum WeftError {
    /// A caller broke a local precondition. Carries the rank that detected
    /// the violation so interleaved SPMD logs stay attributable.
    #[error("rank {rank}: contract violation: {message}")]
    Contract { rank: usize, message: String },

    /// A message arrived whose length does not match the posted buffer.
    #[error("rank {rank}: message from rank {src} is {got} bytes, receive buffer is {expected}")]
    Truncation {
        rank: usize,
        src: usize,
        expected: usize,
        got: usize,
    },

    /// A data operation reached a window handle that is not attached to a
    /// live window. Carries the operation name; no rank identity exists on
    /// a detached handle.
    #[error("operation '{0}' on a null window")]
    NullWindow(String),

    /// The fabric itself failed, typically because a peer rank aborted
    /// mid-operation. Not recoverable at this layer.
    #[error("fatal transport failure: {0}")]
    Fatal(String),

    /// Group construction was handed unusable parameters.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl WeftError {
    /// Build a contract violation attributed to `rank`
    pub fn contract(rank: usize, message: impl Into<String>) -> Self {
        WeftError::Contract {
            rank,
            message: message.into(),
        }
    }

    /// Get the error code
    pub fn code(&self) -> Code {
        match self {
            WeftError::Contract { .. } | WeftError::NullWindow(_) => Code::Contract,
            WeftError::Truncation { .. } => Code::Truncation,
            WeftError::Fatal(_) => Code::Fatal,
            WeftError::Config(_) => Code::Config,
        }
    }
}

/// Type alias for Results using WeftError
pub type WeftResult<T> = Result<T, WeftError>;
