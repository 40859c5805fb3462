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

//! Memory kinds and per-kind memory resources.
//!
//! A [`MemoryResource`] hands out raw allocations of one kind; the async
//! variant additionally sequences allocation/deallocation in an
//! [`AccessOrder`], so a stream-ordered upstream pool may defer actual
//! reclamation until the stream catches up.

use std::alloc::Layout;
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use crate::error::{Result, TdpError};
use crate::gpu::cuda_ffi::{
    CUDA_HOST_ALLOC_DEFAULT, CUDA_MEM_ATTACH_GLOBAL, CUDA_SUCCESS, cudaFree, cudaFreeAsync,
    cudaFreeHost, cudaHostAlloc, cudaMalloc, cudaMallocAsync, cudaMallocManaged, cudaMemGetInfo,
};
use crate::gpu::{DeviceGuard, cuda_result};
use crate::types::AccessOrder;

/// Alignment guaranteed by the CUDA allocators.
const CUDA_ALLOC_ALIGNMENT: usize = 256;

/// The four memory kinds the engine allocates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    Host,
    Pinned,
    Device,
    Managed,
}

impl MemoryKind {
    pub fn name(self) -> &'static str {
        match self {
            MemoryKind::Host => "host",
            MemoryKind::Pinned => "pinned",
            MemoryKind::Device => "device",
            MemoryKind::Managed => "managed",
        }
    }

    /// Whether the kind is backed by a CUDA allocator.
    pub fn is_cuda(self) -> bool {
        !matches!(self, MemoryKind::Host)
    }
}

/// Synchronous allocator interface for one memory kind.
pub trait MemoryResource: Send + Sync {
    fn kind(&self) -> MemoryKind;

    fn allocate(&self, bytes: usize, alignment: usize) -> Result<*mut u8>;

    /// # Safety
    /// `ptr` must come from `allocate` on the same resource with the same
    /// `bytes`/`alignment`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize);
}

/// Allocator interface whose operations are sequenced in an access order.
/// Host-kind resources ignore the order.
pub trait AsyncMemoryResource: MemoryResource {
    fn allocate_async(&self, bytes: usize, alignment: usize, order: AccessOrder)
    -> Result<*mut u8>;

    /// # Safety
    /// Same contract as [`MemoryResource::deallocate`]; additionally the
    /// memory must not be written in any order later than `order`.
    unsafe fn deallocate_async(
        &self,
        ptr: *mut u8,
        bytes: usize,
        alignment: usize,
        order: AccessOrder,
    );
}

fn bytes_to_mib(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

fn query_cuda_mem_info() -> Result<(usize, usize)> {
    let mut free_bytes: usize = 0;
    let mut total_bytes: usize = 0;
    cuda_result(
        unsafe { cudaMemGetInfo(&mut free_bytes, &mut total_bytes) },
        "cudaMemGetInfo",
    )?;
    Ok((free_bytes, total_bytes))
}

fn build_oom_message(context: &str, requested_bytes: usize, free: usize, total: usize) -> String {
    format!(
        "out of device memory during {context}: requested {:.2} MiB, free {:.2} MiB / total {:.2} MiB. Reduce the batch size or prefetch depth and retry.",
        bytes_to_mib(requested_bytes),
        bytes_to_mib(free),
        bytes_to_mib(total),
    )
}

/// Checks available device memory before attempting a large allocation.
pub(crate) fn ensure_device_memory_available(requested_bytes: usize, context: &str) -> Result<()> {
    let (free, total) = query_cuda_mem_info()?;
    if requested_bytes > free {
        return Err(TdpError::ResourceExhausted(build_oom_message(
            context,
            requested_bytes,
            free,
            total,
        )));
    }
    Ok(())
}

/// Wraps a failed CUDA allocation with an OOM-aware error.
pub(crate) fn map_allocation_error(requested_bytes: usize, context: &str, code: i32) -> TdpError {
    match query_cuda_mem_info() {
        Ok((free, total)) if requested_bytes > free => {
            TdpError::ResourceExhausted(build_oom_message(context, requested_bytes, free, total))
        }
        _ => TdpError::ResourceExhausted(format!(
            "allocation failed during {context}: requested {:.2} MiB, CUDA error {} ({})",
            bytes_to_mib(requested_bytes),
            code,
            crate::error::cuda_error_to_string(code),
        )),
    }
}

fn check_cuda_alignment(kind: MemoryKind, alignment: usize) -> Result<()> {
    if alignment > CUDA_ALLOC_ALIGNMENT {
        return Err(TdpError::InvalidArgument(format!(
            "{} allocation alignment {} exceeds the {} bytes guaranteed by the CUDA allocator",
            kind.name(),
            alignment,
            CUDA_ALLOC_ALIGNMENT
        )));
    }
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(TdpError::InvalidArgument(format!(
            "allocation alignment must be a nonzero power of two, got {}",
            alignment
        )));
    }
    Ok(())
}

/// Plain host memory via the global allocator.
pub struct HostResource;

impl MemoryResource for HostResource {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Host
    }

    fn allocate(&self, bytes: usize, alignment: usize) -> Result<*mut u8> {
        let layout = Layout::from_size_align(bytes.max(1), alignment.max(1))
            .map_err(|e| TdpError::InvalidArgument(format!("bad host layout: {}", e)))?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(TdpError::ResourceExhausted(format!(
                "host allocation of {:.2} MiB failed",
                bytes_to_mib(bytes)
            )));
        }
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) {
        if ptr.is_null() {
            return;
        }
        let layout = Layout::from_size_align(bytes.max(1), alignment.max(1))
            .expect("layout validated at allocation");
        unsafe { std::alloc::dealloc(ptr, layout) };
    }
}

impl AsyncMemoryResource for HostResource {
    fn allocate_async(
        &self,
        bytes: usize,
        alignment: usize,
        _order: AccessOrder,
    ) -> Result<*mut u8> {
        self.allocate(bytes, alignment)
    }

    unsafe fn deallocate_async(
        &self,
        ptr: *mut u8,
        bytes: usize,
        alignment: usize,
        _order: AccessOrder,
    ) {
        unsafe { self.deallocate(ptr, bytes, alignment) };
    }
}

/// Page-locked host memory (`cudaHostAlloc`). Allocation and deallocation
/// are host-synchronous; the kind exists so H2D copies can run truly async.
pub struct PinnedResource {
    device_id: i32,
}

impl PinnedResource {
    pub fn new(device_id: i32) -> Self {
        Self { device_id }
    }
}

impl MemoryResource for PinnedResource {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Pinned
    }

    fn allocate(&self, bytes: usize, alignment: usize) -> Result<*mut u8> {
        check_cuda_alignment(self.kind(), alignment)?;
        let _g = DeviceGuard::new(self.device_id)?;
        let mut ptr: *mut c_void = ptr::null_mut();
        let ret = unsafe { cudaHostAlloc(&mut ptr, bytes.max(1), CUDA_HOST_ALLOC_DEFAULT) };
        if ret != CUDA_SUCCESS {
            return Err(map_allocation_error(bytes, "pinned allocation", ret));
        }
        Ok(ptr as *mut u8)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, _bytes: usize, _alignment: usize) {
        if ptr.is_null() {
            return;
        }
        let _ = unsafe { cudaFreeHost(ptr as *mut c_void) };
    }
}

impl AsyncMemoryResource for PinnedResource {
    fn allocate_async(
        &self,
        bytes: usize,
        alignment: usize,
        _order: AccessOrder,
    ) -> Result<*mut u8> {
        self.allocate(bytes, alignment)
    }

    unsafe fn deallocate_async(
        &self,
        ptr: *mut u8,
        bytes: usize,
        alignment: usize,
        order: AccessOrder,
    ) {
        // Pinned memory may still be the source of an in-flight copy in a
        // device order; wait for that order before unpinning.
        if let AccessOrder::Device { stream, .. } = order {
            let _ = unsafe { crate::gpu::cuda_ffi::cudaStreamSynchronize(stream.raw()) };
        }
        unsafe { self.deallocate(ptr, bytes, alignment) };
    }
}

/// Device memory. Synchronous calls use `cudaMalloc`/`cudaFree`; the async
/// variant uses the stream-ordered pool allocator so frees issued in a
/// device order are reclaimed only once the stream catches up.
pub struct DeviceResource {
    device_id: i32,
}

impl DeviceResource {
    pub fn new(device_id: i32) -> Self {
        Self { device_id }
    }
}

impl MemoryResource for DeviceResource {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Device
    }

    fn allocate(&self, bytes: usize, alignment: usize) -> Result<*mut u8> {
        check_cuda_alignment(self.kind(), alignment)?;
        let _g = DeviceGuard::new(self.device_id)?;
        ensure_device_memory_available(bytes, "device allocation")?;
        let mut ptr: *mut c_void = ptr::null_mut();
        let ret = unsafe { cudaMalloc(&mut ptr, bytes.max(1)) };
        if ret != CUDA_SUCCESS {
            return Err(map_allocation_error(bytes, "device allocation", ret));
        }
        Ok(ptr as *mut u8)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, _bytes: usize, _alignment: usize) {
        if ptr.is_null() {
            return;
        }
        let _ = unsafe { cudaFree(ptr as *mut c_void) };
    }
}

impl AsyncMemoryResource for DeviceResource {
    fn allocate_async(
        &self,
        bytes: usize,
        alignment: usize,
        order: AccessOrder,
    ) -> Result<*mut u8> {
        check_cuda_alignment(self.kind(), alignment)?;
        let AccessOrder::Device { device_id, stream } = order else {
            return self.allocate(bytes, alignment);
        };
        let _g = DeviceGuard::new(device_id)?;
        let mut ptr: *mut c_void = ptr::null_mut();
        let ret = unsafe { cudaMallocAsync(&mut ptr, bytes.max(1), stream.raw()) };
        if ret != CUDA_SUCCESS {
            return Err(map_allocation_error(bytes, "stream-ordered device allocation", ret));
        }
        Ok(ptr as *mut u8)
    }

    unsafe fn deallocate_async(
        &self,
        ptr: *mut u8,
        bytes: usize,
        alignment: usize,
        order: AccessOrder,
    ) {
        if ptr.is_null() {
            return;
        }
        match order {
            AccessOrder::Device { stream, .. } => {
                let ret = unsafe { cudaFreeAsync(ptr as *mut c_void, stream.raw()) };
                if ret != CUDA_SUCCESS {
                    log::warn!(
                        "cudaFreeAsync failed ({}), falling back to synchronous free",
                        ret
                    );
                    unsafe { self.deallocate(ptr, bytes, alignment) };
                }
            }
            AccessOrder::Host => unsafe { self.deallocate(ptr, bytes, alignment) },
        }
    }
}

/// Managed (unified) memory. Same ordering policy as pinned.
pub struct ManagedResource {
    device_id: i32,
}

impl ManagedResource {
    pub fn new(device_id: i32) -> Self {
        Self { device_id }
    }
}

impl MemoryResource for ManagedResource {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Managed
    }

    fn allocate(&self, bytes: usize, alignment: usize) -> Result<*mut u8> {
        check_cuda_alignment(self.kind(), alignment)?;
        let _g = DeviceGuard::new(self.device_id)?;
        let mut ptr: *mut c_void = ptr::null_mut();
        let ret = unsafe { cudaMallocManaged(&mut ptr, bytes.max(1), CUDA_MEM_ATTACH_GLOBAL) };
        if ret != CUDA_SUCCESS {
            return Err(map_allocation_error(bytes, "managed allocation", ret));
        }
        Ok(ptr as *mut u8)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, _bytes: usize, _alignment: usize) {
        if ptr.is_null() {
            return;
        }
        let _ = unsafe { cudaFree(ptr as *mut c_void) };
    }
}

impl AsyncMemoryResource for ManagedResource {
    fn allocate_async(
        &self,
        bytes: usize,
        alignment: usize,
        _order: AccessOrder,
    ) -> Result<*mut u8> {
        self.allocate(bytes, alignment)
    }

    unsafe fn deallocate_async(
        &self,
        ptr: *mut u8,
        bytes: usize,
        alignment: usize,
        order: AccessOrder,
    ) {
        if let AccessOrder::Device { stream, .. } = order {
            let _ = unsafe { crate::gpu::cuda_ffi::cudaStreamSynchronize(stream.raw()) };
        }
        unsafe { self.deallocate(ptr, bytes, alignment) };
    }
}

/// The per-kind resources a pipeline allocates from. Constructed per
/// pipeline and injectable in tests; CUDA kinds stay `None` in host-only
/// builds so device requests fail with a clear error instead of at link
/// time.
#[derive(Clone)]
pub struct MemoryResources {
    pub host: Arc<dyn AsyncMemoryResource>,
    pub pinned: Option<Arc<dyn AsyncMemoryResource>>,
    pub device: Option<Arc<dyn AsyncMemoryResource>>,
    pub managed: Option<Arc<dyn AsyncMemoryResource>>,
}

impl MemoryResources {
    /// Host-only bundle; every CUDA kind is unavailable.
    pub fn host_only() -> Self {
        Self {
            host: Arc::new(HostResource),
            pinned: None,
            device: None,
            managed: None,
        }
    }

    /// Bundle for `device_id`. Resources are cheap handles; no CUDA call
    /// happens until the first allocation.
    pub fn for_device(device_id: i32) -> Self {
        if cfg!(feature = "cuda") && device_id >= 0 {
            Self {
                host: Arc::new(HostResource),
                pinned: Some(Arc::new(PinnedResource::new(device_id))),
                device: Some(Arc::new(DeviceResource::new(device_id))),
                managed: Some(Arc::new(ManagedResource::new(device_id))),
            }
        } else {
            Self::host_only()
        }
    }

    pub fn resource(&self, kind: MemoryKind) -> Result<&Arc<dyn AsyncMemoryResource>> {
        let slot = match kind {
            MemoryKind::Host => return Ok(&self.host),
            MemoryKind::Pinned => &self.pinned,
            MemoryKind::Device => &self.device,
            MemoryKind::Managed => &self.managed,
        };
        slot.as_ref().ok_or_else(|| {
            TdpError::Device(format!(
                "{} memory is unavailable: no device configured{}",
                kind.name(),
                if cfg!(feature = "cuda") {
                    ""
                } else {
                    " (built without the `cuda` feature)"
                }
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_allocation_round_trip() {
        let r = HostResource;
        let ptr = r.allocate(1024, 64).unwrap();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % 64, 0);
        unsafe { r.deallocate(ptr, 1024, 64) };
    }

    #[test]
    fn host_ignores_order() {
        let r = HostResource;
        let ptr = r.allocate_async(64, 8, AccessOrder::host()).unwrap();
        unsafe { r.deallocate_async(ptr, 64, 8, AccessOrder::host()) };
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        assert!(check_cuda_alignment(MemoryKind::Device, 48).is_err());
        assert!(check_cuda_alignment(MemoryKind::Device, 512).is_err());
        assert!(check_cuda_alignment(MemoryKind::Device, 64).is_ok());
    }
}
