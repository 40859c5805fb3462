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

//! Recyclable per-device CUDA streams, handed out as RAII leases.
//! Same shape as the event pool; streams are created non-blocking so
//! they never serialize against the legacy default stream.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::Result;
use crate::gpu::cuda_ffi::{
    CUDA_STREAM_NON_BLOCKING, cudaStreamCreateWithFlags, cudaStreamDestroy, cudaStreamSynchronize,
};
use crate::gpu::{DeviceGuard, cuda_result};
use crate::types::{AccessOrder, StreamHandle};

type FreeList = Arc<Mutex<Vec<StreamHandle>>>;

/// Pool of recyclable CUDA streams, one free list per device.
#[derive(Default)]
pub struct CudaStreamPool {
    lists: RwLock<HashMap<i32, FreeList>>,
}

impl CudaStreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn list_for(&self, device_id: i32) -> FreeList {
        if let Some(list) = self.lists.read().unwrap().get(&device_id) {
            return Arc::clone(list);
        }
        let mut lists = self.lists.write().unwrap();
        Arc::clone(lists.entry(device_id).or_default())
    }

    fn get(&self, device_id: i32) -> Result<StreamHandle> {
        let list = self.list_for(device_id);
        if let Some(stream) = list.lock().unwrap().pop() {
            return Ok(stream);
        }
        let _g = DeviceGuard::new(device_id)?;
        let mut stream: *mut c_void = std::ptr::null_mut();
        cuda_result(
            unsafe { cudaStreamCreateWithFlags(&mut stream, CUDA_STREAM_NON_BLOCKING) },
            "cudaStreamCreateWithFlags",
        )?;
        Ok(StreamHandle(stream))
    }

    fn put(&self, stream: StreamHandle, device_id: i32) {
        let list = self.list_for(device_id);
        list.lock().unwrap().push(stream);
    }

    /// Leases a stream bound to `device_id`; it returns to the pool when
    /// the lease drops.
    pub fn lease(self: &Arc<Self>, device_id: i32) -> Result<StreamLease> {
        let stream = self.get(device_id)?;
        Ok(StreamLease {
            pool: Arc::clone(self),
            stream,
            device_id,
        })
    }
}

impl Drop for CudaStreamPool {
    fn drop(&mut self) {
        let lists = self.lists.get_mut().unwrap();
        for (device_id, list) in lists.iter() {
            let guard = DeviceGuard::new(*device_id);
            for stream in list.lock().unwrap().drain(..) {
                // Streams returned to the pool may still carry enqueued work.
                let _ = unsafe { cudaStreamSynchronize(stream.raw()) };
                let _ = unsafe { cudaStreamDestroy(stream.raw()) };
            }
            drop(guard);
        }
    }
}

/// RAII lease of one pooled stream.
pub struct StreamLease {
    pool: Arc<CudaStreamPool>,
    stream: StreamHandle,
    device_id: i32,
}

impl StreamLease {
    pub(crate) fn handle(&self) -> StreamHandle {
        self.stream
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// The access order naming this stream.
    pub fn order(&self) -> AccessOrder {
        AccessOrder::Device {
            device_id: self.device_id,
            stream: self.stream,
        }
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.pool.put(self.stream, self.device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn lease_fails_without_cuda() {
        let pool = Arc::new(CudaStreamPool::new());
        assert!(pool.lease(0).is_err());
    }

    #[cfg(feature = "cuda")]
    #[test]
    fn lease_round_trip() {
        if crate::gpu::device_count() == 0 {
            return; // no GPU, skip
        }
        let pool = Arc::new(CudaStreamPool::new());
        let raw = {
            let lease = pool.lease(0).unwrap();
            assert!(lease.order().is_device());
            lease.handle().raw()
        };
        // Returned on drop; the next lease reuses it.
        let lease = pool.lease(0).unwrap();
        assert_eq!(lease.handle().raw(), raw);
    }
}
