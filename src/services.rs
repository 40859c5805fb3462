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

//! Shared services a pipeline runs against: memory resources, the event
//! and stream pools and the host thread pool. Constructed per pipeline —
//! no process-wide singletons — so tests can inject fresh instances.

use std::sync::Arc;

use crate::error::{Result, TdpError};
use crate::gpu::event_pool::CudaEventPool;
use crate::gpu::memory::MemoryResources;
use crate::gpu::stream_pool::CudaStreamPool;

pub struct SharedServices {
    pub memory: MemoryResources,
    pub event_pool: Arc<CudaEventPool>,
    pub stream_pool: Arc<CudaStreamPool>,
    pub thread_pool: Arc<rayon::ThreadPool>,
    device_id: i32,
    #[cfg(feature = "cuda")]
    cuda_device: Option<Arc<cudarc::driver::CudaDevice>>,
}

impl SharedServices {
    /// Builds the service bundle for `device_id` (−1 for host-only).
    ///
    /// Device initialization failure is not fatal: host paths keep
    /// working and every device-kind operation reports a clear error.
    pub fn new(device_id: i32, num_threads: usize) -> Result<Arc<Self>> {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("tdp-worker-{}", i))
            .build()
            .map_err(|e| {
                TdpError::InvalidArgument(format!("failed to build thread pool: {}", e))
            })?;

        #[cfg(feature = "cuda")]
        let cuda_device = if device_id >= 0 {
            match cudarc::driver::CudaDevice::new(device_id as usize) {
                Ok(device) => Some(device),
                Err(e) => {
                    log::warn!(
                        "CUDA device {} unavailable ({:?}); device-kind operations will fail",
                        device_id,
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        #[cfg(feature = "cuda")]
        let device_usable = cuda_device.is_some();
        #[cfg(not(feature = "cuda"))]
        let device_usable = false;

        Ok(Arc::new(Self {
            memory: if device_usable {
                MemoryResources::for_device(device_id)
            } else {
                MemoryResources::host_only()
            },
            event_pool: Arc::new(CudaEventPool::new()),
            stream_pool: Arc::new(CudaStreamPool::new()),
            thread_pool: Arc::new(thread_pool),
            device_id,
            #[cfg(feature = "cuda")]
            cuda_device,
        }))
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Whether a CUDA device was successfully initialized.
    pub fn device_available(&self) -> bool {
        #[cfg(feature = "cuda")]
        {
            self.cuda_device.is_some()
        }
        #[cfg(not(feature = "cuda"))]
        {
            false
        }
    }

    #[cfg(feature = "cuda")]
    pub fn cuda_device(&self) -> Option<&Arc<cudarc::driver::CudaDevice>> {
        self.cuda_device.as_ref()
    }

    pub(crate) fn require_device(&self) -> Result<()> {
        if self.device_available() {
            Ok(())
        } else {
            Err(TdpError::Device(format!(
                "CUDA device {} is not available{}",
                self.device_id,
                if cfg!(feature = "cuda") {
                    ""
                } else {
                    " (built without the `cuda` feature)"
                }
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_only_services() {
        let services = SharedServices::new(-1, 2).unwrap();
        assert!(!services.device_available());
        assert!(services.require_device().is_err());
        assert!(services.memory.resource(crate::gpu::MemoryKind::Host).is_ok());
    }
}
