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

//! Operator capability set and the name → constructor registry.

pub mod builtin;
pub mod input;

pub use input::{CopyMode, InputOperator, InputSettingMode};

use std::sync::Arc;

use crate::error::{Result, TdpError};
use crate::graph::OpSpec;
use crate::services::SharedServices;
use crate::types::TensorShape;
use crate::workspace::Workspace;

/// A pipeline operator.
///
/// Operators are re-entrant across iterations but are never called
/// concurrently within one iteration. `setup` may run more than once when
/// shape inference is deferred; `run` consumes scratch memory only through
/// the workspace-provided scratchpad.
pub trait Operator: Send {
    fn setup(&mut self, ws: &mut Workspace) -> Result<Option<Vec<TensorShape>>> {
        let _ = ws;
        Ok(None)
    }

    fn run(&mut self, ws: &mut Workspace) -> Result<()>;
}

/// An instantiated operator: either a regular node, or the input operator
/// with its extended ingestion capabilities.
pub(crate) enum OpImpl {
    Regular(Box<dyn Operator>),
    Input(Arc<InputOperator>),
}

/// Resolves an OpSpec's schema name to a concrete operator.
pub(crate) fn instantiate(spec: &OpSpec, services: &Arc<SharedServices>) -> Result<OpImpl> {
    match spec.schema() {
        "ExternalSource" => Ok(OpImpl::Input(Arc::new(InputOperator::from_spec(
            spec, services,
        )?))),
        "Passthrough" => Ok(OpImpl::Regular(Box::new(builtin::Passthrough))),
        "CopyToDevice" => Ok(OpImpl::Regular(Box::new(builtin::CopyToDevice::from_spec(
            spec, services,
        )?))),
        "AddScalar" => Ok(OpImpl::Regular(Box::new(builtin::AddScalar::from_spec(
            spec,
        )?))),
        other => Err(TdpError::InvalidArgument(format!(
            "Unknown operator '{}'. Available: ExternalSource, Passthrough, CopyToDevice, AddScalar",
            other
        ))),
    }
}
