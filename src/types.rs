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

//! Core type system: element types, shapes, storage/backends and OpSpec
//! argument values.

use crate::error::{Result, TdpError};

/// Element type of a tensor list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    UInt8,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::UInt8 => 1,
            DType::Int32 | DType::Float32 => 4,
            DType::Int64 | DType::Float64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::UInt8 => "uint8",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "uint8" => Ok(DType::UInt8),
            "int32" => Ok(DType::Int32),
            "int64" => Ok(DType::Int64),
            "float32" => Ok(DType::Float32),
            "float64" => Ok(DType::Float64),
            other => Err(TdpError::InvalidArgument(format!(
                "Unknown dtype '{}'. Available: uint8, int32, int64, float32, float64",
                other
            ))),
        }
    }
}

/// Maps Rust element types onto [`DType`]. Implemented for the plain-old-data
/// types a tensor list can hold.
pub trait ElementType: Copy + Send + Sync + 'static {
    const DTYPE: DType;
}

impl ElementType for u8 {
    const DTYPE: DType = DType::UInt8;
}
impl ElementType for i32 {
    const DTYPE: DType = DType::Int32;
}
impl ElementType for i64 {
    const DTYPE: DType = DType::Int64;
}
impl ElementType for f32 {
    const DTYPE: DType = DType::Float32;
}
impl ElementType for f64 {
    const DTYPE: DType = DType::Float64;
}

/// Shape of a single sample.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct TensorShape {
    dims: Vec<i64>,
}

impl TensorShape {
    pub fn new(dims: impl Into<Vec<i64>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// Number of elements; empty shape is a scalar with volume 1.
    pub fn volume(&self) -> usize {
        self.dims.iter().map(|&d| d.max(0) as usize).product()
    }
}

impl From<&[i64]> for TensorShape {
    fn from(dims: &[i64]) -> Self {
        Self::new(dims.to_vec())
    }
}

/// Where a buffer (an edge of the graph) lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageDevice {
    Cpu,
    Gpu,
}

impl StorageDevice {
    pub fn name(self) -> &'static str {
        match self {
            StorageDevice::Cpu => "cpu",
            StorageDevice::Gpu => "gpu",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(StorageDevice::Cpu),
            "gpu" => Ok(StorageDevice::Gpu),
            other => Err(TdpError::InvalidArgument(format!(
                "Unknown storage device '{}'. Available: cpu, gpu",
                other
            ))),
        }
    }
}

/// Execution backend of an operator; also its stage in the executor.
/// Stages are totally ordered: Cpu before Mixed before Gpu.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpBackend {
    Cpu,
    Mixed,
    Gpu,
}

impl OpBackend {
    pub fn name(self) -> &'static str {
        match self {
            OpBackend::Cpu => "cpu",
            OpBackend::Mixed => "mixed",
            OpBackend::Gpu => "gpu",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(OpBackend::Cpu),
            "mixed" => Ok(OpBackend::Mixed),
            "gpu" => Ok(OpBackend::Gpu),
            other => Err(TdpError::InvalidArgument(format!(
                "Unknown operator backend '{}'. Available: cpu, mixed, gpu",
                other
            ))),
        }
    }
}

/// Opaque CUDA stream handle. Never dereferenced by safe code; only passed
/// back to the runtime API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub(crate) *mut std::ffi::c_void);

// Stream handles are plain driver tokens; the streams they name are
// internally synchronized by the CUDA runtime.
unsafe impl Send for StreamHandle {}
unsafe impl Sync for StreamHandle {}

impl StreamHandle {
    pub(crate) fn raw(self) -> *mut std::ffi::c_void {
        self.0
    }
}

/// Synchronization domain in which an operation is sequenced: the host
/// (synchronous), or a specific device stream.
///
/// Two tensor lists may be composed only after their access orders are
/// reconciled by recording an event in the producer's order and waiting
/// on it in the consumer's order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessOrder {
    Host,
    Device { device_id: i32, stream: StreamHandle },
}

impl AccessOrder {
    pub fn host() -> Self {
        AccessOrder::Host
    }

    pub fn is_device(&self) -> bool {
        matches!(self, AccessOrder::Device { .. })
    }

    pub fn device_id(&self) -> Option<i32> {
        match self {
            AccessOrder::Host => None,
            AccessOrder::Device { device_id, .. } => Some(*device_id),
        }
    }

    pub(crate) fn stream(&self) -> Option<StreamHandle> {
        match self {
            AccessOrder::Host => None,
            AccessOrder::Device { stream, .. } => Some(*stream),
        }
    }
}

impl Default for AccessOrder {
    fn default() -> Self {
        AccessOrder::Host
    }
}

/// A value in an OpSpec argument dictionary.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}
impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}
impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}
impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}
impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_volume() {
        assert_eq!(TensorShape::new(vec![2, 2]).volume(), 4);
        assert_eq!(TensorShape::new(vec![8, 8]).volume(), 64);
        assert_eq!(TensorShape::new(Vec::new()).volume(), 1);
    }

    #[test]
    fn backend_ordering_matches_stages() {
        assert!(OpBackend::Cpu < OpBackend::Mixed);
        assert!(OpBackend::Mixed < OpBackend::Gpu);
    }

    #[test]
    fn device_parse() {
        assert_eq!(StorageDevice::parse("cpu").unwrap(), StorageDevice::Cpu);
        assert!(StorageDevice::parse("tpu").is_err());
    }
}
