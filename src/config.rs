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

//! Pipeline construction parameters with env overrides and validation.
//!
//! **Env:** `TDP_PREFETCH_DEPTH` (1–8), `TDP_NUM_THREADS` (1–256).
//! Parse failures leave the programmatic value untouched.

use crate::error::{Result, TdpError};

/// Parameters of a pipeline.
#[derive(Clone, Debug)]
pub struct PipelineParams {
    /// Upper bound on the batch size of any iteration.
    pub max_batch_size: usize,
    /// Host thread pool size for CPU-stage per-sample work.
    pub num_threads: usize,
    /// CUDA device ordinal; −1 for a host-only pipeline.
    pub device_id: i32,
    /// Seed forwarded to operators that randomize.
    pub seed: u64,
    /// Overlap iterations across stages with depth-`prefetch_depth` queues.
    pub pipelined: bool,
    /// Maximum iterations simultaneously in flight per stage.
    pub prefetch_depth: usize,
    /// Drive the stages from background threads; `run()` only enqueues.
    pub async_execution: bool,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            max_batch_size: 1,
            num_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            device_id: -1,
            seed: 0,
            pipelined: true,
            prefetch_depth: 2,
            async_execution: true,
        }
    }
}

impl PipelineParams {
    /// Applies `TDP_*` env overrides on top of the programmatic values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(depth) = parse_env::<usize>("TDP_PREFETCH_DEPTH") {
            self.prefetch_depth = depth;
        }
        if let Some(threads) = parse_env::<usize>("TDP_NUM_THREADS") {
            self.num_threads = threads;
        }
        self
    }

    /// Validates bounds: batch size > 0, threads 1..=256, prefetch 1..=8.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(TdpError::InvalidArgument(
                "max_batch_size must be greater than zero".to_string(),
            ));
        }
        if !(1..=256).contains(&self.num_threads) {
            return Err(TdpError::InvalidArgument(format!(
                "num_threads must be 1..=256, got {}",
                self.num_threads
            )));
        }
        if !(1..=8).contains(&self.prefetch_depth) {
            return Err(TdpError::InvalidArgument(format!(
                "prefetch_depth must be 1..=8, got {}",
                self.prefetch_depth
            )));
        }
        Ok(())
    }

    /// Effective stage queue depth: 1 unless pipelined.
    pub(crate) fn queue_depth(&self) -> usize {
        if self.pipelined { self.prefetch_depth } else { 1 }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialize env-dependent tests so parallel runs don't cross-talk.
    static ENV_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn defaults_validate() {
        PipelineParams::default().validate().unwrap();
    }

    #[test]
    fn bad_bounds_are_rejected() {
        let mut p = PipelineParams::default();
        p.prefetch_depth = 0;
        assert!(p.validate().is_err());
        p.prefetch_depth = 9;
        assert!(p.validate().is_err());
        p.prefetch_depth = 2;
        p.max_batch_size = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn env_overrides_parse() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        unsafe { std::env::set_var("TDP_PREFETCH_DEPTH", "3") };
        let p = PipelineParams::default().with_env_overrides();
        assert_eq!(p.prefetch_depth, 3);
        unsafe { std::env::set_var("TDP_PREFETCH_DEPTH", "junk") };
        let p = PipelineParams {
            prefetch_depth: 4,
            ..Default::default()
        }
        .with_env_overrides();
        assert_eq!(p.prefetch_depth, 4);
        unsafe { std::env::remove_var("TDP_PREFETCH_DEPTH") };
    }

    #[test]
    fn queue_depth_collapses_when_not_pipelined() {
        let p = PipelineParams {
            pipelined: false,
            prefetch_depth: 3,
            ..Default::default()
        };
        assert_eq!(p.queue_depth(), 1);
    }
}
