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

//! Per-invocation view handed to an operator: ordered inputs, write-once
//! outputs, scratch memory, the host thread pool and the access order the
//! operator's work is sequenced in.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, TdpError};
use crate::gpu::memory::{MemoryKind, MemoryResources};
use crate::gpu::scratchpad::Scratchpad;
use crate::tensor::TensorList;
use crate::types::AccessOrder;

pub struct Workspace {
    iteration: u64,
    batch_size: usize,
    order: AccessOrder,
    inputs: Vec<TensorList>,
    outputs: Vec<Option<TensorList>>,
    traces: HashMap<String, String>,
    thread_pool: Option<Arc<rayon::ThreadPool>>,
    scratchpad: Option<Scratchpad>,
    resources: MemoryResources,
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("iteration", &self.iteration)
            .field("batch_size", &self.batch_size)
            .field("order", &self.order)
            .field("traces", &self.traces)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    pub fn new(
        iteration: u64,
        batch_size: usize,
        order: AccessOrder,
        thread_pool: Option<Arc<rayon::ThreadPool>>,
        resources: MemoryResources,
    ) -> Self {
        Self {
            iteration,
            batch_size,
            order,
            inputs: Vec::new(),
            outputs: Vec::new(),
            traces: HashMap::new(),
            thread_pool,
            scratchpad: None,
            resources,
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The order this invocation's work is sequenced in (the stage stream
    /// for mixed/GPU operators, host order for CPU operators).
    pub fn order(&self) -> AccessOrder {
        self.order
    }

    pub fn resources(&self) -> &MemoryResources {
        &self.resources
    }

    pub(crate) fn add_input(&mut self, input: TensorList) {
        self.inputs.push(input);
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn input(&self, idx: usize) -> Result<&TensorList> {
        self.inputs.get(idx).ok_or_else(|| {
            TdpError::InvalidArgument(format!(
                "input slot {} out of range (workspace has {})",
                idx,
                self.inputs.len()
            ))
        })
    }

    pub(crate) fn set_output_count(&mut self, count: usize) {
        self.outputs = (0..count).map(|_| None).collect();
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Writes an output slot. Slots are write-once per iteration.
    pub fn set_output(&mut self, idx: usize, output: TensorList) -> Result<()> {
        let slot = self.outputs.get_mut(idx).ok_or_else(|| {
            TdpError::InvalidArgument(format!("output slot {} out of range", idx))
        })?;
        if slot.is_some() {
            return Err(TdpError::InvalidArgument(format!(
                "output slot {} already written this iteration",
                idx
            )));
        }
        *slot = Some(output);
        Ok(())
    }

    pub fn output(&self, idx: usize) -> Option<&TensorList> {
        self.outputs.get(idx).and_then(Option::as_ref)
    }

    pub(crate) fn take_output(&mut self, idx: usize) -> Result<TensorList> {
        self.outputs
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or_else(|| {
                TdpError::InvalidArgument(format!("output slot {} was never written", idx))
            })
    }

    pub(crate) fn set_scratchpad(&mut self, scratchpad: Scratchpad) {
        self.scratchpad = Some(scratchpad);
    }

    /// Scratch memory scoped to this invocation. Never hold the pointer
    /// past the operator's return.
    pub fn scratch_alloc(
        &mut self,
        kind: MemoryKind,
        bytes: usize,
        alignment: usize,
    ) -> Result<*mut u8> {
        let pad = self.scratchpad.as_mut().ok_or_else(|| {
            TdpError::InvalidArgument("workspace carries no scratchpad".to_string())
        })?;
        pad.alloc(kind, bytes, alignment)
    }

    pub fn thread_pool(&self) -> Result<&Arc<rayon::ThreadPool>> {
        self.thread_pool.as_ref().ok_or_else(|| {
            TdpError::InvalidArgument("workspace carries no thread pool".to_string())
        })
    }

    /// Attaches a string trace for this operator and iteration.
    pub fn set_trace(&mut self, key: &str, value: &str) {
        self.traces.insert(key.to_string(), value.to_string());
    }

    pub fn trace(&self, key: &str) -> Option<&str> {
        self.traces.get(key).map(String::as_str)
    }

    pub(crate) fn take_traces(&mut self) -> HashMap<String, String> {
        std::mem::take(&mut self.traces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StorageDevice;

    fn workspace() -> Workspace {
        Workspace::new(
            0,
            4,
            AccessOrder::host(),
            None,
            MemoryResources::host_only(),
        )
    }

    #[test]
    fn outputs_are_write_once() {
        let mut ws = workspace();
        ws.set_output_count(1);
        ws.set_output(0, TensorList::new(StorageDevice::Cpu)).unwrap();
        let err = ws.set_output(0, TensorList::new(StorageDevice::Cpu));
        assert!(err.is_err());
    }

    #[test]
    fn missing_output_is_reported() {
        let mut ws = workspace();
        ws.set_output_count(2);
        ws.set_output(0, TensorList::new(StorageDevice::Cpu)).unwrap();
        assert!(ws.take_output(1).is_err());
    }

    #[test]
    fn traces_round_trip() {
        let mut ws = workspace();
        ws.set_trace("depleted", "false");
        assert_eq!(ws.trace("depleted"), Some("false"));
        assert_eq!(ws.take_traces().len(), 1);
        assert_eq!(ws.trace("depleted"), None);
    }
}
