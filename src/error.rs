//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error types for the pipeline engine.

use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, TdpError>;

/// Error taxonomy of the engine.
///
/// Build-time problems (`InvalidArgument`, `GraphInvalid`) surface
/// synchronously; execution-time problems are attached to the iteration
/// that hit them and surface from `Pipeline::outputs()` in FIFO order.
#[derive(Error, Debug)]
pub enum TdpError {
    /// Bad OpSpec, dtype mismatch, empty batch, out-of-range parameter.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Cycle, missing producer, device mismatch at an edge.
    #[error("Invalid pipeline graph: {0}")]
    GraphInvalid(String),

    /// Non-blocking input operator consumed with an empty queue.
    #[error("No data: {0}")]
    NoData(String),

    /// Allocation failure (host or device).
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// CUDA API failure or device unavailable.
    #[error("Device error: {0}")]
    Device(String),

    /// A user operator failed; carries the operator name and iteration.
    #[error("Operator '{op}' failed in iteration {iteration}: {message}")]
    OperatorFailure {
        op: String,
        iteration: u64,
        message: String,
    },

    /// A blocked wait was released by `break_waiting` / shutdown.
    /// Distinguishable so consumer loops can exit quietly.
    #[error("Cancelled")]
    Cancelled,

    /// An opaque checkpoint blob failed validation.
    #[error("Corrupt checkpoint: {0}")]
    CheckpointCorrupt(String),
}

impl TdpError {
    /// Whether this error merely signals a cancelled wait.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TdpError::Cancelled)
    }

    /// Tags an execution error with the operator and iteration it belongs to.
    /// `Cancelled` passes through untouched so callers can still detect it.
    pub(crate) fn into_operator_failure(self, op: &str, iteration: u64) -> TdpError {
        match self {
            TdpError::Cancelled => TdpError::Cancelled,
            TdpError::OperatorFailure { .. } => self,
            other => TdpError::OperatorFailure {
                op: op.to_string(),
                iteration,
                message: other.to_string(),
            },
        }
    }
}

/// Human-readable names for the CUDA runtime error codes the engine
/// actually encounters. Unknown codes keep their numeric value in the
/// surrounding message.
pub fn cuda_error_to_string(code: i32) -> &'static str {
    match code {
        0 => "cudaSuccess",
        1 => "cudaErrorInvalidValue",
        2 => "cudaErrorMemoryAllocation",
        3 => "cudaErrorInitializationError",
        34 => "cudaErrorNotReady",
        100 => "cudaErrorNoDevice",
        101 => "cudaErrorInvalidDevice",
        801 => "cudaErrorNotSupported",
        _ => "unknown CUDA error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_failure_carries_context() {
        let err = TdpError::InvalidArgument("bad shape".to_string())
            .into_operator_failure("Resize", 7);
        let msg = err.to_string();
        assert!(msg.contains("Resize"));
        assert!(msg.contains("7"));
        assert!(msg.contains("bad shape"));
    }

    #[test]
    fn cancelled_is_not_retagged() {
        let err = TdpError::Cancelled.into_operator_failure("Resize", 7);
        assert!(err.is_cancelled());
    }

    #[test]
    fn cuda_error_names() {
        assert_eq!(cuda_error_to_string(0), "cudaSuccess");
        assert_eq!(cuda_error_to_string(2), "cudaErrorMemoryAllocation");
        assert_eq!(cuda_error_to_string(12345), "unknown CUDA error");
    }
}
