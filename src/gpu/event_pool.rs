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

//! Recyclable per-device CUDA events.
//!
//! Events are created lazily, handed out in LIFO order and returned to a
//! per-device free list, so steady-state iterations never call
//! `cudaEventCreate`.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::Result;
use crate::gpu::cuda_ffi::{
    CUDA_EVENT_DISABLE_TIMING, cudaEventCreateWithFlags, cudaEventDestroy,
};
use crate::gpu::{DeviceGuard, cuda_result};

/// Opaque CUDA event token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct EventHandle(pub(crate) *mut c_void);

unsafe impl Send for EventHandle {}
unsafe impl Sync for EventHandle {}

impl EventHandle {
    pub(crate) fn raw(self) -> *mut c_void {
        self.0
    }
}

type FreeList = Arc<Mutex<Vec<EventHandle>>>;

/// Pool of recyclable CUDA events, one free list per device.
///
/// Events handed out are recordable: any prior use was synchronized
/// before the event was returned with [`put`](Self::put), and
/// `cudaEventRecord` supersedes earlier records.
#[derive(Default)]
pub struct CudaEventPool {
    lists: RwLock<HashMap<i32, FreeList>>,
}

impl CudaEventPool {
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

    /// Returns an event bound to `device_id`, creating one if the free
    /// list is empty.
    pub(crate) fn get(&self, device_id: i32) -> Result<EventHandle> {
        let list = self.list_for(device_id);
        if let Some(event) = list.lock().unwrap().pop() {
            return Ok(event);
        }
        let _g = DeviceGuard::new(device_id)?;
        let mut event: *mut c_void = std::ptr::null_mut();
        cuda_result(
            unsafe { cudaEventCreateWithFlags(&mut event, CUDA_EVENT_DISABLE_TIMING) },
            "cudaEventCreateWithFlags",
        )?;
        Ok(EventHandle(event))
    }

    /// Returns `event` to the free list of `device_id`.
    pub(crate) fn put(&self, event: EventHandle, device_id: i32) {
        let list = self.list_for(device_id);
        list.lock().unwrap().push(event);
    }
}

impl Drop for CudaEventPool {
    fn drop(&mut self) {
        let lists = self.lists.get_mut().unwrap();
        for (device_id, list) in lists.iter() {
            let guard = DeviceGuard::new(*device_id);
            for event in list.lock().unwrap().drain(..) {
                let _ = unsafe { cudaEventDestroy(event.raw()) };
            }
            drop(guard);
        }
    }
}

/// Holds at most one pooled event and its device id. Rebinds when asked
/// for a different device and releases the event back to the pool on drop.
#[derive(Default)]
pub struct EventLease {
    pool: Option<Arc<CudaEventPool>>,
    event: Option<EventHandle>,
    device_id: i32,
}

impl EventLease {
    /// Leases an event for `device_id`, reusing the held one when the
    /// device matches.
    pub(crate) fn get(&mut self, pool: &Arc<CudaEventPool>, device_id: i32) -> Result<EventHandle> {
        if self.event.is_some() && self.device_id != device_id {
            self.put();
        }
        if self.event.is_none() {
            self.event = Some(pool.get(device_id)?);
            self.pool = Some(Arc::clone(pool));
            self.device_id = device_id;
        }
        Ok(self.event.unwrap())
    }

    /// Releases the held event, if any, back to its pool.
    pub(crate) fn put(&mut self) {
        if let (Some(pool), Some(event)) = (self.pool.take(), self.event.take()) {
            pool.put(event, self.device_id);
        }
        self.device_id = -1;
    }

    pub(crate) fn handle(&self) -> Option<EventHandle> {
        self.event
    }

    /// Device the held event is bound to; −1 when empty.
    pub fn device_id(&self) -> i32 {
        self.device_id
    }
}

impl Drop for EventLease {
    fn drop(&mut self) {
        self.put();
    }
}
