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

pub(crate) mod cuda_ffi;
pub mod event_pool;
pub mod memory;
pub mod scratchpad;
pub mod stream_pool;

pub use event_pool::{CudaEventPool, EventLease};
pub use memory::{AsyncMemoryResource, MemoryKind, MemoryResource};
pub use scratchpad::Scratchpad;
pub use stream_pool::{CudaStreamPool, StreamLease};

use crate::error::{Result, TdpError, cuda_error_to_string};

/// Maps a CUDA runtime return code onto a [`TdpError::Device`].
pub(crate) fn cuda_result(code: i32, what: &str) -> Result<()> {
    if code == cuda_ffi::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(TdpError::Device(format!(
            "{} failed: {} ({})",
            what,
            code,
            cuda_error_to_string(code)
        )))
    }
}

/// Records `event` in a device order's stream.
pub(crate) fn record_event(
    event: event_pool::EventHandle,
    order: crate::types::AccessOrder,
) -> Result<()> {
    let Some(stream) = order.stream() else {
        return Err(TdpError::InvalidArgument(
            "completion events can only be recorded in a device order".to_string(),
        ));
    };
    cuda_result(
        unsafe { cuda_ffi::cudaEventRecord(event.raw(), stream.raw()) },
        "cudaEventRecord",
    )
}

/// Makes `order` observe `event`: a stream wait for device orders, a host
/// synchronize for the host order.
pub(crate) fn observe_event(
    order: crate::types::AccessOrder,
    event: event_pool::EventHandle,
) -> Result<()> {
    match order.stream() {
        Some(stream) => cuda_result(
            unsafe { cuda_ffi::cudaStreamWaitEvent(stream.raw(), event.raw(), 0) },
            "cudaStreamWaitEvent",
        ),
        None => cuda_result(
            unsafe { cuda_ffi::cudaEventSynchronize(event.raw()) },
            "cudaEventSynchronize",
        ),
    }
}

/// Number of visible CUDA devices; 0 when the runtime is absent.
pub fn device_count() -> i32 {
    let mut count: i32 = 0;
    let ret = unsafe { cuda_ffi::cudaGetDeviceCount(&mut count) };
    if ret != cuda_ffi::CUDA_SUCCESS { 0 } else { count }
}

/// Scoped current-device switch. Restores the previous device on drop.
pub struct DeviceGuard {
    previous: i32,
    active: bool,
}

impl DeviceGuard {
    pub fn new(device_id: i32) -> Result<Self> {
        let mut previous: i32 = -1;
        cuda_result(
            unsafe { cuda_ffi::cudaGetDevice(&mut previous) },
            "cudaGetDevice",
        )?;
        if previous != device_id {
            cuda_result(unsafe { cuda_ffi::cudaSetDevice(device_id) }, "cudaSetDevice")?;
        }
        Ok(Self {
            previous,
            active: previous != device_id,
        })
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if self.active {
            let _ = unsafe { cuda_ffi::cudaSetDevice(self.previous) };
        }
    }
}
