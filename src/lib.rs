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

//! TDP — a pipelined data-loading and preprocessing engine for
//! deep-learning training.
//!
//! A user declares a DAG of operators over batched tensors; the engine
//! executes it repeatedly, overlapping host compute, host→device copies
//! and device compute across prefetched iterations. External producers
//! feed batches through input operators with a configurable copy/share
//! policy; temporary memory is served from per-invocation stream-ordered
//! scratchpads.

// Allow unused_unsafe: CUDA FFI functions are unsafe in CUDA builds but
// safe stubs in host-only builds. The compiler can't statically determine
// which path is taken.
#![allow(unused_unsafe)]

pub mod caching_list;
pub mod config;
pub mod error;
pub mod gpu;
pub mod graph;
pub mod ops;
pub mod services;
pub mod tensor;
pub mod types;
pub mod workspace;

mod executor;
mod worker_thread;
#[macro_use]
pub mod profiling;

pub use config::PipelineParams;
pub use error::{Result, TdpError, cuda_error_to_string};
pub use gpu::{MemoryKind, Scratchpad};
pub use graph::{IoDesc, OpSpec};
pub use ops::{CopyMode, InputSettingMode, Operator};
pub use tensor::TensorList;
pub use types::{AccessOrder, ArgValue, DType, ElementType, OpBackend, StorageDevice, TensorShape};
pub use workspace::Workspace;

use std::collections::HashMap;
use std::sync::Arc;

use crate::executor::Executor;
use crate::ops::input::InputOperator;
use crate::services::SharedServices;

const CHECKPOINT_MAGIC: [u8; 4] = *b"TDPC";
const CHECKPOINT_VERSION: u32 = 1;

struct BuiltPipeline {
    executor: Executor,
    inputs: HashMap<String, Arc<InputOperator>>,
    input_order: Vec<String>,
    output_descs: Vec<IoDesc>,
}

/// Main entry point.
///
/// Owns the operators, the executor and the shared services (memory
/// resources, event/stream pools, thread pool). Construction declares the
/// graph; [`build`](Pipeline::build) freezes and validates it; then
/// [`run`](Pipeline::run)/[`outputs`](Pipeline::outputs) cycle iterations
/// while [`feed_input`](Pipeline::feed_input) supplies data.
pub struct Pipeline {
    params: PipelineParams,
    services: Arc<SharedServices>,
    specs: Vec<OpSpec>,
    built: Option<BuiltPipeline>,
}

impl Pipeline {
    /// Creates an empty pipeline with its own service bundle.
    pub fn new(params: PipelineParams) -> Result<Self> {
        params.validate()?;
        let services = SharedServices::new(params.device_id, params.num_threads)?;
        Ok(Self {
            params,
            services,
            specs: Vec::new(),
            built: None,
        })
    }

    /// Creates a pipeline against an injected service bundle (tests).
    pub fn with_services(params: PipelineParams, services: Arc<SharedServices>) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            services,
            specs: Vec::new(),
            built: None,
        })
    }

    pub fn params(&self) -> &PipelineParams {
        &self.params
    }

    pub fn services(&self) -> &Arc<SharedServices> {
        &self.services
    }

    /// Adds an operator. Operators must be added in topological order.
    pub fn add_operator(&mut self, spec: OpSpec) -> Result<()> {
        if self.built.is_some() {
            return Err(TdpError::InvalidArgument(
                "cannot add operators to a built pipeline".to_string(),
            ));
        }
        self.specs.push(spec);
        Ok(())
    }

    /// Freezes the graph, validates it and brings up the executor.
    pub fn build(&mut self, outputs: &[(&str, StorageDevice)]) -> Result<()> {
        if self.built.is_some() {
            return Err(TdpError::InvalidArgument(
                "pipeline is already built".to_string(),
            ));
        }
        let requested: Vec<(String, StorageDevice)> = outputs
            .iter()
            .map(|(name, device)| (name.to_string(), *device))
            .collect();
        let graph = graph::build_graph(&self.specs, &requested)?;

        let output_descs = graph
            .pipeline_outputs
            .iter()
            .map(|&edge| {
                let edge = &graph.edges[edge];
                IoDesc {
                    name: edge.name.clone(),
                    device: edge.device,
                    ndim: None,
                    dtype: None,
                    layout: String::new(),
                }
            })
            .collect();

        let (executor, inputs) =
            Executor::new(graph, Arc::clone(&self.services), self.params.clone())?;
        let input_order = self
            .specs
            .iter()
            .filter(|spec| spec.schema() == "ExternalSource")
            .map(|spec| {
                spec.arg_str("name", spec.name())
                    .expect("validated at instantiation")
            })
            .collect();

        self.built = Some(BuiltPipeline {
            executor,
            inputs,
            input_order,
            output_descs,
        });
        Ok(())
    }

    fn built(&self) -> Result<&BuiltPipeline> {
        self.built.as_ref().ok_or_else(|| {
            TdpError::InvalidArgument("pipeline has not been built".to_string())
        })
    }

    fn input(&self, name: &str) -> Result<&Arc<InputOperator>> {
        let built = self.built()?;
        built.inputs.get(name).ok_or_else(|| {
            TdpError::InvalidArgument(format!(
                "unknown input '{}'. Available: {}",
                name,
                built.input_order.join(", ")
            ))
        })
    }

    /// Enqueues a batch on the named input operator.
    pub fn feed_input(
        &self,
        name: &str,
        batch: &TensorList,
        data_id: Option<&str>,
        flags: InputSettingMode,
        order: AccessOrder,
    ) -> Result<()> {
        crate::profile_scope!("Pipeline::FeedInput");
        self.input(name)?
            .set_data_source(batch, order, flags, data_id.map(str::to_string))
    }

    /// Number of batches queued on the named input.
    pub fn input_feed_count(&self, name: &str) -> Result<usize> {
        Ok(self.input(name)?.feed_count())
    }

    /// Schedules one iteration without blocking on stage completion.
    pub fn run(&self) -> Result<()> {
        self.built()?.executor.run()
    }

    /// Warm-up: schedules `prefetch_depth` iterations so steady-state
    /// overlap is reached before the first `outputs()`.
    pub fn prefetch(&self) -> Result<()> {
        let n = self.params.queue_depth();
        for _ in 0..n {
            self.run()?;
        }
        Ok(())
    }

    /// Retrieves the next completed iteration in FIFO order, blocking if
    /// necessary. Execution errors surface here, tagged with the operator
    /// and iteration that caused them.
    pub fn outputs(&self) -> Result<Workspace> {
        self.built()?.executor.outputs()
    }

    /// Iterations scheduled but not yet surfaced.
    pub fn in_flight(&self) -> usize {
        self.built
            .as_ref()
            .map(|b| b.executor.in_flight())
            .unwrap_or(0)
    }

    /// Cancels blocked producers and consumers. The pipeline no longer
    /// schedules iterations afterwards; pending device work drains.
    pub fn break_waiting(&self) {
        if let Some(built) = &self.built {
            for input in built.inputs.values() {
                input.break_waiting();
            }
            built.executor.break_waiting();
        }
    }

    pub fn input_count(&self) -> usize {
        self.built
            .as_ref()
            .map(|b| b.input_order.len())
            .unwrap_or(0)
    }

    pub fn output_count(&self) -> usize {
        self.built
            .as_ref()
            .map(|b| b.output_descs.len())
            .unwrap_or(0)
    }

    pub fn input_desc(&self, idx: usize) -> Result<IoDesc> {
        let built = self.built()?;
        let name = built.input_order.get(idx).ok_or_else(|| {
            TdpError::InvalidArgument(format!(
                "input index {} out of range ({} inputs)",
                idx,
                built.input_order.len()
            ))
        })?;
        self.input_desc_by_name(name)
    }

    pub fn input_desc_by_name(&self, name: &str) -> Result<IoDesc> {
        Ok(self.input(name)?.desc())
    }

    pub fn output_desc(&self, idx: usize) -> Result<IoDesc> {
        let built = self.built()?;
        built.output_descs.get(idx).cloned().ok_or_else(|| {
            TdpError::InvalidArgument(format!(
                "output index {} out of range ({} outputs)",
                idx,
                built.output_descs.len()
            ))
        })
    }

    /// Opaque checkpoint blob: engine counters plus per-operator sections
    /// (serialization of operator state is a collaborator concern; the
    /// engine contributes its iteration counter).
    pub fn checkpoint(&self) -> Result<Vec<u8>> {
        let built = self.built()?;
        let mut blob = Vec::with_capacity(20);
        blob.extend_from_slice(&CHECKPOINT_MAGIC);
        blob.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        blob.extend_from_slice(&built.executor.iterations_scheduled().to_le_bytes());
        blob.extend_from_slice(&0u32.to_le_bytes()); // operator sections
        Ok(blob)
    }

    /// Restores engine counters from a checkpoint blob.
    pub fn restore(&mut self, blob: &[u8]) -> Result<()> {
        if blob.len() < 20 || blob[..4] != CHECKPOINT_MAGIC {
            return Err(TdpError::CheckpointCorrupt(
                "missing checkpoint header".to_string(),
            ));
        }
        let version = u32::from_le_bytes(blob[4..8].try_into().unwrap());
        if version != CHECKPOINT_VERSION {
            return Err(TdpError::CheckpointCorrupt(format!(
                "unsupported checkpoint version {}",
                version
            )));
        }
        let iterations = u64::from_le_bytes(blob[8..16].try_into().unwrap());
        self.built()?.executor.restore_iteration_counter(iterations);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_pipeline() -> Pipeline {
        let params = PipelineParams {
            max_batch_size: 4,
            num_threads: 2,
            pipelined: false,
            async_execution: false,
            ..Default::default()
        };
        let mut pipe = Pipeline::new(params).unwrap();
        pipe.add_operator(
            OpSpec::new("ExternalSource")
                .with_name("x")
                .arg("name", "x")
                .output("x", StorageDevice::Cpu),
        )
        .unwrap();
        pipe.add_operator(
            OpSpec::new("Passthrough")
                .with_name("pass")
                .input("x", StorageDevice::Cpu)
                .output("y", StorageDevice::Cpu),
        )
        .unwrap();
        pipe.build(&[("y", StorageDevice::Cpu)]).unwrap();
        pipe
    }

    #[test]
    fn unknown_operator_is_rejected_at_build() {
        let mut pipe = Pipeline::new(PipelineParams {
            max_batch_size: 1,
            num_threads: 1,
            ..Default::default()
        })
        .unwrap();
        pipe.add_operator(
            OpSpec::new("DoesNotExist").output("y", StorageDevice::Cpu),
        )
        .unwrap();
        let err = pipe.build(&[("y", StorageDevice::Cpu)]);
        assert!(matches!(err, Err(TdpError::InvalidArgument(_))));
    }

    #[test]
    fn feed_to_unknown_input_is_rejected() {
        let pipe = identity_pipeline();
        let batch = TensorList::from_host_data(
            vec![TensorShape::new(vec![1])],
            &[1i32],
            false,
            &pipe.services().memory,
        )
        .unwrap();
        let err = pipe.feed_input(
            "nope",
            &batch,
            None,
            InputSettingMode::default(),
            AccessOrder::host(),
        );
        assert!(matches!(err, Err(TdpError::InvalidArgument(_))));
    }

    #[test]
    fn introspection_reports_schema() {
        let pipe = identity_pipeline();
        assert_eq!(pipe.input_count(), 1);
        assert_eq!(pipe.output_count(), 1);
        let input = pipe.input_desc(0).unwrap();
        assert_eq!(input.name, "x");
        assert_eq!(input.device, StorageDevice::Cpu);
        let output = pipe.output_desc(0).unwrap();
        assert_eq!(output.name, "y");
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut pipe = identity_pipeline();
        let blob = pipe.checkpoint().unwrap();
        pipe.restore(&blob).unwrap();
        assert!(matches!(
            pipe.restore(b"garbage-blob-of-sufficient-length"),
            Err(TdpError::CheckpointCorrupt(_))
        ));
    }

    #[test]
    fn run_before_build_is_rejected() {
        let pipe = Pipeline::new(PipelineParams {
            max_batch_size: 1,
            num_threads: 1,
            ..Default::default()
        })
        .unwrap();
        assert!(pipe.run().is_err());
    }
}
