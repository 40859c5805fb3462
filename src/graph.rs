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

//! Operator specifications and the pipeline graph.
//!
//! An [`OpSpec`] names an operator schema, carries a string-keyed argument
//! dictionary and declares named inputs/outputs tagged with a storage
//! device. Operators must be added in topological order; `build` validates
//! producers, single-producer edges and device placement, and classifies
//! every node into its executor stage.

use std::collections::HashMap;

use crate::error::{Result, TdpError};
use crate::types::{ArgValue, DType, OpBackend, StorageDevice};

/// A named, device-tagged buffer reference on an OpSpec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeRef {
    pub name: String,
    pub device: StorageDevice,
}

/// Declarative description of one operator instance.
#[derive(Clone, Debug)]
pub struct OpSpec {
    schema: String,
    instance_name: String,
    backend: OpBackend,
    args: HashMap<String, ArgValue>,
    inputs: Vec<EdgeRef>,
    outputs: Vec<EdgeRef>,
}

impl OpSpec {
    pub fn new(schema: &str) -> Self {
        Self {
            schema: schema.to_string(),
            instance_name: schema.to_string(),
            backend: OpBackend::Cpu,
            args: HashMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.instance_name = name.to_string();
        self
    }

    pub fn device(mut self, backend: OpBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn arg(mut self, key: &str, value: impl Into<ArgValue>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn input(mut self, name: &str, device: StorageDevice) -> Self {
        self.inputs.push(EdgeRef {
            name: name.to_string(),
            device,
        });
        self
    }

    pub fn output(mut self, name: &str, device: StorageDevice) -> Self {
        self.outputs.push(EdgeRef {
            name: name.to_string(),
            device,
        });
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn name(&self) -> &str {
        &self.instance_name
    }

    pub fn backend(&self) -> OpBackend {
        self.backend
    }

    pub fn inputs(&self) -> &[EdgeRef] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[EdgeRef] {
        &self.outputs
    }

    fn arg_mismatch(&self, key: &str, expected: &str, got: &ArgValue) -> TdpError {
        TdpError::InvalidArgument(format!(
            "operator '{}': argument '{}' should be {}, got {:?}",
            self.instance_name, key, expected, got
        ))
    }

    pub fn arg_bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.args.get(key) {
            None => Ok(default),
            Some(ArgValue::Bool(v)) => Ok(*v),
            Some(other) => Err(self.arg_mismatch(key, "a bool", other)),
        }
    }

    pub fn arg_int(&self, key: &str, default: i64) -> Result<i64> {
        match self.args.get(key) {
            None => Ok(default),
            Some(ArgValue::Int(v)) => Ok(*v),
            Some(other) => Err(self.arg_mismatch(key, "an int", other)),
        }
    }

    pub fn arg_float(&self, key: &str, default: f64) -> Result<f64> {
        match self.args.get(key) {
            None => Ok(default),
            Some(ArgValue::Float(v)) => Ok(*v),
            Some(ArgValue::Int(v)) => Ok(*v as f64),
            Some(other) => Err(self.arg_mismatch(key, "a float", other)),
        }
    }

    pub fn arg_str(&self, key: &str, default: &str) -> Result<String> {
        match self.args.get(key) {
            None => Ok(default.to_string()),
            Some(ArgValue::Str(v)) => Ok(v.clone()),
            Some(other) => Err(self.arg_mismatch(key, "a string", other)),
        }
    }

    pub fn has_arg(&self, key: &str) -> bool {
        self.args.contains_key(key)
    }
}

/// Schema of one pipeline input or output, as reported by introspection.
#[derive(Clone, Debug)]
pub struct IoDesc {
    pub name: String,
    pub device: StorageDevice,
    pub ndim: Option<usize>,
    pub dtype: Option<DType>,
    pub layout: String,
}

/// One buffer of the built graph.
#[derive(Clone, Debug)]
pub(crate) struct EdgeDef {
    pub name: String,
    pub device: StorageDevice,
    #[allow(dead_code)]
    pub producer: usize,
    #[allow(dead_code)]
    pub producer_slot: usize,
}

/// One operator of the built graph, with resolved edge ids.
#[derive(Clone, Debug)]
pub(crate) struct NodeDef {
    pub spec: OpSpec,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

/// Validated, frozen pipeline graph.
pub(crate) struct BuiltGraph {
    pub nodes: Vec<NodeDef>,
    pub edges: Vec<EdgeDef>,
    pub pipeline_outputs: Vec<usize>,
}

fn edge_key(name: &str, device: StorageDevice) -> String {
    format!("{}_{}", name, device.name())
}

/// Device placement rules per backend: which devices an operator may
/// consume from and produce to.
fn placement_valid(backend: OpBackend, edge: StorageDevice, is_input: bool) -> bool {
    match (backend, is_input) {
        (OpBackend::Cpu, _) => edge == StorageDevice::Cpu,
        (OpBackend::Mixed, true) => edge == StorageDevice::Cpu,
        (OpBackend::Mixed, false) => edge == StorageDevice::Gpu,
        (OpBackend::Gpu, _) => edge == StorageDevice::Gpu,
    }
}

/// Validates the specs (added in topological order) and freezes the graph.
pub(crate) fn build_graph(
    specs: &[OpSpec],
    requested_outputs: &[(String, StorageDevice)],
) -> Result<BuiltGraph> {
    let mut nodes = Vec::with_capacity(specs.len());
    let mut edges: Vec<EdgeDef> = Vec::new();
    let mut edge_ids: HashMap<String, usize> = HashMap::new();

    for (node_id, spec) in specs.iter().enumerate() {
        let mut input_ids = Vec::with_capacity(spec.inputs().len());
        for edge in spec.inputs() {
            if !placement_valid(spec.backend(), edge.device, true) {
                return Err(TdpError::GraphInvalid(format!(
                    "operator '{}' ({}) cannot consume {} buffer '{}'",
                    spec.name(),
                    spec.backend().name(),
                    edge.device.name(),
                    edge.name
                )));
            }
            let key = edge_key(&edge.name, edge.device);
            let id = *edge_ids.get(&key).ok_or_else(|| {
                TdpError::GraphInvalid(format!(
                    "buffer '{}' ({}) consumed by operator '{}' has no producer",
                    edge.name,
                    edge.device.name(),
                    spec.name()
                ))
            })?;
            input_ids.push(id);
        }

        let mut output_ids = Vec::with_capacity(spec.outputs().len());
        for (slot, edge) in spec.outputs().iter().enumerate() {
            if !placement_valid(spec.backend(), edge.device, false) {
                return Err(TdpError::GraphInvalid(format!(
                    "operator '{}' ({}) cannot produce {} buffer '{}'",
                    spec.name(),
                    spec.backend().name(),
                    edge.device.name(),
                    edge.name
                )));
            }
            let key = edge_key(&edge.name, edge.device);
            if edge_ids.contains_key(&key) {
                return Err(TdpError::GraphInvalid(format!(
                    "buffer '{}' ({}) has more than one producer",
                    edge.name,
                    edge.device.name()
                )));
            }
            let id = edges.len();
            edges.push(EdgeDef {
                name: edge.name.clone(),
                device: edge.device,
                producer: node_id,
                producer_slot: slot,
            });
            edge_ids.insert(key, id);
            output_ids.push(id);
        }

        nodes.push(NodeDef {
            spec: spec.clone(),
            inputs: input_ids,
            outputs: output_ids,
        });
    }

    if requested_outputs.is_empty() {
        return Err(TdpError::GraphInvalid(
            "pipeline must declare at least one output".to_string(),
        ));
    }
    let mut pipeline_outputs = Vec::with_capacity(requested_outputs.len());
    for (name, device) in requested_outputs {
        let key = edge_key(name, *device);
        let id = *edge_ids.get(&key).ok_or_else(|| {
            TdpError::GraphInvalid(format!(
                "requested pipeline output '{}' ({}) is not produced by any operator",
                name,
                device.name()
            ))
        })?;
        pipeline_outputs.push(id);
    }

    Ok(BuiltGraph {
        nodes,
        edges,
        pipeline_outputs,
    })
}
