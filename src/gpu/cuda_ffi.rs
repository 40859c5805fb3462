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

//! Centralized CUDA Runtime API FFI declarations.
//!
//! Without the `cuda` feature every entry point is a safe stub returning
//! `cudaErrorNotSupported`, so callers compile unchanged and device paths
//! fail at runtime with a clear error.

#![allow(dead_code)]

use std::ffi::c_void;

pub(crate) const CUDA_MEMCPY_HOST_TO_HOST: u32 = 0;
pub(crate) const CUDA_MEMCPY_HOST_TO_DEVICE: u32 = 1;
pub(crate) const CUDA_MEMCPY_DEVICE_TO_HOST: u32 = 2;
pub(crate) const CUDA_MEMCPY_DEVICE_TO_DEVICE: u32 = 3;

pub(crate) const CUDA_EVENT_DISABLE_TIMING: u32 = 0x02;
pub(crate) const CUDA_STREAM_NON_BLOCKING: u32 = 0x01;
pub(crate) const CUDA_HOST_ALLOC_DEFAULT: u32 = 0;
pub(crate) const CUDA_MEM_ATTACH_GLOBAL: u32 = 0x01;

// CUDA error codes
pub(crate) const CUDA_SUCCESS: i32 = 0;
// Ref: https://docs.nvidia.com/cuda/cuda-runtime-api/group__CUDART__TYPES.html
pub(crate) const CUDA_ERROR_NOT_READY: i32 = 34;
pub(crate) const CUDA_ERROR_NOT_SUPPORTED: i32 = 801;

#[cfg(feature = "cuda")]
unsafe extern "C" {
    pub(crate) fn cudaSetDevice(device: i32) -> i32;
    pub(crate) fn cudaGetDevice(device: *mut i32) -> i32;
    pub(crate) fn cudaGetDeviceCount(count: *mut i32) -> i32;

    pub(crate) fn cudaMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub(crate) fn cudaFree(ptr: *mut c_void) -> i32;

    /// Stream-ordered allocation from the device's default memory pool.
    /// Ref: https://docs.nvidia.com/cuda/cuda-runtime-api/group__CUDART__MEMORY__POOLS.html
    pub(crate) fn cudaMallocAsync(ptr: *mut *mut c_void, size: usize, stream: *mut c_void) -> i32;

    /// Stream-ordered free; reclamation is deferred until `stream` catches up.
    pub(crate) fn cudaFreeAsync(ptr: *mut c_void, stream: *mut c_void) -> i32;

    pub(crate) fn cudaHostAlloc(pHost: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub(crate) fn cudaFreeHost(ptr: *mut c_void) -> i32;

    pub(crate) fn cudaMallocManaged(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;

    pub(crate) fn cudaMemGetInfo(free: *mut usize, total: *mut usize) -> i32;

    pub(crate) fn cudaMemcpy(dst: *mut c_void, src: *const c_void, count: usize, kind: u32) -> i32;

    pub(crate) fn cudaMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: usize,
        kind: u32,
        stream: *mut c_void,
    ) -> i32;

    pub(crate) fn cudaEventCreateWithFlags(event: *mut *mut c_void, flags: u32) -> i32;
    pub(crate) fn cudaEventRecord(event: *mut c_void, stream: *mut c_void) -> i32;
    pub(crate) fn cudaEventDestroy(event: *mut c_void) -> i32;

    /// Non-blocking event query.
    /// Ref: https://docs.nvidia.com/cuda/cuda-runtime-api/group__CUDART__EVENT.html
    pub(crate) fn cudaEventQuery(event: *mut c_void) -> i32;

    /// Blocking event synchronization.
    pub(crate) fn cudaEventSynchronize(event: *mut c_void) -> i32;

    pub(crate) fn cudaStreamCreateWithFlags(stream: *mut *mut c_void, flags: u32) -> i32;
    pub(crate) fn cudaStreamDestroy(stream: *mut c_void) -> i32;
    pub(crate) fn cudaStreamSynchronize(stream: *mut c_void) -> i32;
    pub(crate) fn cudaStreamWaitEvent(stream: *mut c_void, event: *mut c_void, flags: u32) -> i32;

    /// Non-blocking stream query; `CUDA_ERROR_NOT_READY` while work is pending.
    /// Ref: CUDA §2.3.2.4 Stream Synchronization.
    pub(crate) fn cudaStreamQuery(stream: *mut c_void) -> i32;
}

// Stubs so host-only builds compile and link without the CUDA toolkit.
#[cfg(not(feature = "cuda"))]
#[allow(non_snake_case)]
mod stubs {
    use super::CUDA_ERROR_NOT_SUPPORTED;
    use std::ffi::c_void;

    pub(crate) fn cudaSetDevice(_device: i32) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaGetDevice(_device: *mut i32) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaGetDeviceCount(count: *mut i32) -> i32 {
        unsafe { *count = 0 };
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaMalloc(_ptr: *mut *mut c_void, _size: usize) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaFree(_ptr: *mut c_void) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaMallocAsync(
        _ptr: *mut *mut c_void,
        _size: usize,
        _stream: *mut c_void,
    ) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaFreeAsync(_ptr: *mut c_void, _stream: *mut c_void) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaHostAlloc(_ptr: *mut *mut c_void, _size: usize, _flags: u32) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaFreeHost(_ptr: *mut c_void) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaMallocManaged(_ptr: *mut *mut c_void, _size: usize, _flags: u32) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaMemGetInfo(_free: *mut usize, _total: *mut usize) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaMemcpy(
        _dst: *mut c_void,
        _src: *const c_void,
        _count: usize,
        _kind: u32,
    ) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaMemcpyAsync(
        _dst: *mut c_void,
        _src: *const c_void,
        _count: usize,
        _kind: u32,
        _stream: *mut c_void,
    ) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaEventCreateWithFlags(_event: *mut *mut c_void, _flags: u32) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaEventRecord(_event: *mut c_void, _stream: *mut c_void) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaEventDestroy(_event: *mut c_void) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaEventQuery(_event: *mut c_void) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaEventSynchronize(_event: *mut c_void) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaStreamCreateWithFlags(_stream: *mut *mut c_void, _flags: u32) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaStreamDestroy(_stream: *mut c_void) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaStreamSynchronize(_stream: *mut c_void) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaStreamWaitEvent(_stream: *mut c_void, _event: *mut c_void, _flags: u32) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
    pub(crate) fn cudaStreamQuery(_stream: *mut c_void) -> i32 {
        CUDA_ERROR_NOT_SUPPORTED
    }
}

#[cfg(not(feature = "cuda"))]
pub(crate) use stubs::*;
