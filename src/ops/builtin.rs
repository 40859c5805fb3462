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

//! Built-in operators the engine ships with.

use std::sync::Arc;

use crate::error::{Result, TdpError};
use crate::graph::OpSpec;
use crate::services::SharedServices;
use crate::tensor::TensorList;
use crate::types::{AccessOrder, DType, StorageDevice, TensorShape};
use crate::workspace::Workspace;

use super::Operator;

/// Identity: forwards its input by sharing storage (zero copy).
pub struct Passthrough;

impl Operator for Passthrough {
    fn setup(&mut self, ws: &mut Workspace) -> Result<Option<Vec<TensorShape>>> {
        Ok(Some(ws.input(0)?.shapes().to_vec()))
    }

    fn run(&mut self, ws: &mut Workspace) -> Result<()> {
        let mut out = TensorList::default();
        out.share_data(ws.input(0)?);
        ws.set_output(0, out)
    }
}

/// Host→device transfer (the canonical mixed-backend operator). The copy
/// is issued on the invocation's stream; the executor records the stage
/// completion event after the mixed stage finishes.
pub struct CopyToDevice {
    device_id: i32,
}

impl CopyToDevice {
    pub fn from_spec(spec: &OpSpec, services: &Arc<SharedServices>) -> Result<Self> {
        services.require_device()?;
        let device_id = spec.arg_int("device_id", services.device_id() as i64)? as i32;
        Ok(Self { device_id })
    }
}

impl Operator for CopyToDevice {
    fn run(&mut self, ws: &mut Workspace) -> Result<()> {
        crate::profile_scope!("CopyToDevice::Run");
        let mut out = TensorList::new(StorageDevice::Gpu);
        out.set_device_id(self.device_id);
        {
            let input = ws.input(0)?;
            out.copy_from(input, ws.order(), false, ws.resources())?;
            out.set_layout(input.layout());
        }
        out.set_order(ws.order());
        ws.set_output(0, out)
    }
}

/// Adds a scalar to every element of a device batch.
///
/// Reference implementation: stages through the host with synchronous
/// copies (concrete kernels live outside this crate). Adequate for
/// correctness; not a throughput path.
pub struct AddScalar {
    value: f64,
}

impl AddScalar {
    pub fn from_spec(spec: &OpSpec) -> Result<Self> {
        Ok(Self {
            value: spec.arg_float("value", 1.0)?,
        })
    }

    fn apply<T, F>(&self, ws: &mut Workspace, add: F) -> Result<()>
    where
        T: crate::types::ElementType,
        F: Fn(T) -> T,
    {
        let (data, shapes, device_id, layout) = {
            let input = ws.input(0)?;
            (
                input.to_host_vec::<T>()?,
                input.shapes().to_vec(),
                input.device_id(),
                input.layout().to_string(),
            )
        };
        let data: Vec<T> = data.into_iter().map(add).collect();
        let staging = TensorList::from_host_data(shapes, &data, false, ws.resources())?;
        let mut out = TensorList::new(StorageDevice::Gpu);
        out.set_device_id(device_id);
        // Synchronous upload: the host staging buffer must outlive the copy.
        out.copy_from(&staging, AccessOrder::host(), false, ws.resources())?;
        out.set_layout(&layout);
        out.set_order(ws.order());
        ws.set_output(0, out)
    }
}

impl Operator for AddScalar {
    fn run(&mut self, ws: &mut Workspace) -> Result<()> {
        crate::profile_scope!("AddScalar::Run");
        let dtype = ws.input(0)?.dtype();
        match dtype {
            Some(DType::Float32) => {
                let value = self.value as f32;
                self.apply::<f32, _>(ws, move |x| x + value)
            }
            Some(DType::Float64) => {
                let value = self.value;
                self.apply::<f64, _>(ws, move |x| x + value)
            }
            Some(DType::Int32) => {
                let value = self.value as i32;
                self.apply::<i32, _>(ws, move |x| x + value)
            }
            other => Err(TdpError::InvalidArgument(format!(
                "AddScalar supports float32, float64 and int32 inputs, got {:?}",
                other
            ))),
        }
    }
}
