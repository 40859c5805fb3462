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

//! Batched tensor storage.
//!
//! A [`TensorList`] is an ordered batch of samples sharing one backend,
//! dtype and layout. Storage is either a single contiguous backing buffer
//! or one buffer per sample; buffers are `Arc`-shared so zero-copy handoff
//! is an `Arc` clone and pointer equality is observable by callers.

use std::ffi::c_void;
use std::sync::Arc;

use rayon::prelude::*;

use crate::error::{Result, TdpError};
use crate::gpu::cuda_ffi::{
    CUDA_MEMCPY_DEVICE_TO_DEVICE, CUDA_MEMCPY_DEVICE_TO_HOST, CUDA_MEMCPY_HOST_TO_DEVICE,
    CUDA_MEMCPY_HOST_TO_HOST, cudaMemcpy, cudaMemcpyAsync, cudaStreamSynchronize,
};
use crate::gpu::cuda_result;
use crate::gpu::memory::{AsyncMemoryResource, MemoryKind, MemoryResources};
use crate::types::{AccessOrder, DType, ElementType, StorageDevice, TensorShape};

/// Buffers are allocated at the upstream's maximum guaranteed alignment.
const BUFFER_ALIGNMENT: usize = 256;

/// Host-to-host copies above this size are split across the rayon pool.
const PARALLEL_COPY_THRESHOLD: usize = 1 << 20;

/// One raw allocation owned by a memory resource. Freed host-synchronously
/// on drop of the last reference.
pub struct Buffer {
    ptr: *mut u8,
    bytes: usize,
    kind: MemoryKind,
    resource: Arc<dyn AsyncMemoryResource>,
}

// A buffer is a single allocation; writes are ordered by the streams and
// events of the tensor lists referencing it.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    fn allocate(resources: &MemoryResources, kind: MemoryKind, bytes: usize) -> Result<Arc<Self>> {
        let resource = Arc::clone(resources.resource(kind)?);
        let ptr = resource.allocate(bytes, BUFFER_ALIGNMENT)?;
        Ok(Arc::new(Self {
            ptr,
            bytes,
            kind,
            resource,
        }))
    }

    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.resource
                .deallocate(self.ptr, self.bytes, BUFFER_ALIGNMENT)
        };
    }
}

#[derive(Clone, Default)]
enum Storage {
    #[default]
    Empty,
    /// One allocation backs all samples end-to-end, in sample-index order.
    Contiguous {
        buffer: Arc<Buffer>,
        offsets: Vec<usize>,
    },
    /// One allocation per sample.
    Samples(Vec<Arc<Buffer>>),
}

/// An ordered batch of N tensors sharing a backend.
///
/// If the backend is device, all samples reside on `device_id`; if the
/// list is contiguous, a single allocation backs all samples end-to-end.
#[derive(Default)]
pub struct TensorList {
    backend: Option<StorageDevice>,
    device_id: i32,
    dtype: Option<DType>,
    layout: String,
    pinned: bool,
    order: AccessOrder,
    shapes: Vec<TensorShape>,
    storage: Storage,
}

impl TensorList {
    pub fn new(backend: StorageDevice) -> Self {
        Self {
            backend: Some(backend),
            device_id: -1,
            ..Default::default()
        }
    }

    pub fn backend(&self) -> Option<StorageDevice> {
        self.backend
    }

    pub fn num_samples(&self) -> usize {
        self.shapes.len()
    }

    pub fn shape(&self, sample: usize) -> &TensorShape {
        &self.shapes[sample]
    }

    pub fn shapes(&self) -> &[TensorShape] {
        &self.shapes
    }

    pub fn dtype(&self) -> Option<DType> {
        self.dtype
    }

    pub fn layout(&self) -> &str {
        &self.layout
    }

    pub fn set_layout(&mut self, layout: &str) {
        self.layout = layout.to_string();
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Marks the list as pinned. Only meaningful while empty; existing
    /// storage keeps its kind.
    pub fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn set_device_id(&mut self, device_id: i32) {
        self.device_id = device_id;
    }

    pub fn order(&self) -> AccessOrder {
        self.order
    }

    pub fn set_order(&mut self, order: AccessOrder) {
        self.order = order;
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn is_contiguous(&self) -> bool {
        matches!(self.storage, Storage::Contiguous { .. })
    }

    /// Base pointer of the contiguous backing allocation, if any.
    pub fn contiguous_raw_ptr(&self) -> Option<*const u8> {
        match &self.storage {
            Storage::Contiguous { buffer, .. } => Some(buffer.ptr() as *const u8),
            _ => None,
        }
    }

    /// Whether both lists view the same backing storage.
    pub fn shares_data_with(&self, other: &TensorList) -> bool {
        match (&self.storage, &other.storage) {
            (
                Storage::Contiguous { buffer: a, .. },
                Storage::Contiguous { buffer: b, .. },
            ) => Arc::ptr_eq(a, b),
            (Storage::Samples(a), Storage::Samples(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| Arc::ptr_eq(x, y))
            }
            _ => false,
        }
    }

    /// Whether this list's storage is referenced by any other list.
    pub fn shares_data(&self) -> bool {
        match &self.storage {
            Storage::Empty => false,
            Storage::Contiguous { buffer, .. } => Arc::strong_count(buffer) > 1,
            Storage::Samples(buffers) => buffers.iter().any(|b| Arc::strong_count(b) > 1),
        }
    }

    pub fn sample_bytes(&self, sample: usize) -> usize {
        let dtype = self.dtype.expect("dtype set for non-empty list");
        self.shapes[sample].volume() * dtype.size()
    }

    pub fn total_bytes(&self) -> usize {
        (0..self.num_samples()).map(|i| self.sample_bytes(i)).sum()
    }

    pub(crate) fn sample_ptr(&self, sample: usize) -> *mut u8 {
        match &self.storage {
            Storage::Empty => std::ptr::null_mut(),
            Storage::Contiguous { buffer, offsets } => unsafe {
                buffer.ptr().add(offsets[sample])
            },
            Storage::Samples(buffers) => buffers[sample].ptr(),
        }
    }

    fn buffer_kind(&self) -> MemoryKind {
        match self.backend {
            Some(StorageDevice::Gpu) => MemoryKind::Device,
            _ if self.pinned => MemoryKind::Pinned,
            _ => MemoryKind::Host,
        }
    }

    /// Drops storage and sample metadata; backend and flags survive.
    pub fn reset(&mut self) {
        self.storage = Storage::Empty;
        self.shapes.clear();
        self.dtype = None;
    }

    /// Allocates (or reuses) a contiguous backing buffer for the given
    /// shapes. An exclusively-owned buffer of sufficient capacity and the
    /// right kind is recycled instead of reallocated.
    pub fn resize(
        &mut self,
        shapes: Vec<TensorShape>,
        dtype: DType,
        resources: &MemoryResources,
    ) -> Result<()> {
        let elem = dtype.size();
        let mut offsets = Vec::with_capacity(shapes.len());
        let mut total = 0usize;
        for shape in &shapes {
            offsets.push(total);
            total += shape.volume() * elem;
        }

        let kind = self.buffer_kind();
        let reusable = match &self.storage {
            Storage::Contiguous { buffer, .. } => {
                Arc::strong_count(buffer) == 1 && buffer.bytes() >= total && buffer.kind() == kind
            }
            _ => false,
        };
        if reusable {
            let Storage::Contiguous { buffer, .. } = std::mem::take(&mut self.storage) else {
                unreachable!()
            };
            self.storage = Storage::Contiguous { buffer, offsets };
        } else {
            let buffer = Buffer::allocate(resources, kind, total.max(1))?;
            self.storage = Storage::Contiguous { buffer, offsets };
        }
        self.shapes = shapes;
        self.dtype = Some(dtype);
        Ok(())
    }

    /// Views the same storage as `src`, replacing this list's contents.
    /// No bytes move; the backing `Arc`s are cloned.
    pub fn share_data(&mut self, src: &TensorList) {
        self.backend = src.backend;
        self.device_id = src.device_id;
        self.dtype = src.dtype;
        self.layout = src.layout.clone();
        self.pinned = src.pinned;
        self.order = src.order;
        self.shapes = src.shapes.clone();
        self.storage = src.storage.clone();
    }

    /// Builds a contiguous host list from flat data.
    pub fn from_host_data<T: ElementType>(
        shapes: Vec<TensorShape>,
        data: &[T],
        pinned: bool,
        resources: &MemoryResources,
    ) -> Result<Self> {
        let volume: usize = shapes.iter().map(TensorShape::volume).sum();
        if volume != data.len() {
            return Err(TdpError::InvalidArgument(format!(
                "flat data has {} elements but shapes describe {}",
                data.len(),
                volume
            )));
        }
        let mut list = TensorList::new(StorageDevice::Cpu);
        list.set_pinned(pinned);
        list.resize(shapes, T::DTYPE, resources)?;
        if volume > 0 {
            let Storage::Contiguous { buffer, .. } = &list.storage else {
                unreachable!()
            };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr() as *const u8,
                    buffer.ptr(),
                    volume * T::DTYPE.size(),
                )
            };
        }
        Ok(list)
    }

    /// Builds a host list with one allocation per sample (non-contiguous).
    pub fn from_host_samples<T: ElementType>(
        shape: TensorShape,
        samples: &[&[T]],
        resources: &MemoryResources,
    ) -> Result<Self> {
        let mut list = TensorList::new(StorageDevice::Cpu);
        let mut buffers = Vec::with_capacity(samples.len());
        for sample in samples {
            if sample.len() != shape.volume() {
                return Err(TdpError::InvalidArgument(format!(
                    "sample has {} elements but shape describes {}",
                    sample.len(),
                    shape.volume()
                )));
            }
            let bytes = sample.len() * T::DTYPE.size();
            let buffer = Buffer::allocate(resources, MemoryKind::Host, bytes.max(1))?;
            unsafe {
                std::ptr::copy_nonoverlapping(sample.as_ptr() as *const u8, buffer.ptr(), bytes)
            };
            buffers.push(buffer);
        }
        list.shapes = vec![shape; samples.len()];
        list.dtype = Some(T::DTYPE);
        list.storage = Storage::Samples(buffers);
        Ok(list)
    }

    /// Typed read-only view of a host sample.
    pub fn sample_as_slice<T: ElementType>(&self, sample: usize) -> Result<&[T]> {
        if self.backend == Some(StorageDevice::Gpu) {
            return Err(TdpError::InvalidArgument(
                "cannot view device samples as host slices".to_string(),
            ));
        }
        if self.dtype != Some(T::DTYPE) {
            return Err(TdpError::InvalidArgument(format!(
                "dtype mismatch: list holds {:?}, requested {:?}",
                self.dtype,
                T::DTYPE
            )));
        }
        let len = self.shapes[sample].volume();
        Ok(unsafe { std::slice::from_raw_parts(self.sample_ptr(sample) as *const T, len) })
    }

    /// Typed mutable view of a host sample, for producers filling
    /// buffers in place.
    pub fn sample_as_mut_slice<T: ElementType>(&mut self, sample: usize) -> Result<&mut [T]> {
        if self.backend == Some(StorageDevice::Gpu) {
            return Err(TdpError::InvalidArgument(
                "cannot view device samples as host slices".to_string(),
            ));
        }
        if self.dtype != Some(T::DTYPE) {
            return Err(TdpError::InvalidArgument(format!(
                "dtype mismatch: list holds {:?}, requested {:?}",
                self.dtype,
                T::DTYPE
            )));
        }
        let len = self.shapes[sample].volume();
        Ok(unsafe { std::slice::from_raw_parts_mut(self.sample_ptr(sample) as *mut T, len) })
    }

    /// Flattens the whole batch into a host vector, synchronizing on the
    /// list's order first when it is a device order.
    pub fn to_host_vec<T: ElementType>(&self) -> Result<Vec<T>> {
        if self.dtype != Some(T::DTYPE) {
            return Err(TdpError::InvalidArgument(format!(
                "dtype mismatch: list holds {:?}, requested {:?}",
                self.dtype,
                T::DTYPE
            )));
        }
        if let Some(stream) = self.order.stream() {
            cuda_result(
                unsafe { cudaStreamSynchronize(stream.raw()) },
                "cudaStreamSynchronize",
            )?;
        }
        let total: usize = self.shapes.iter().map(TensorShape::volume).sum();
        let mut out = Vec::with_capacity(total);
        for i in 0..self.num_samples() {
            let bytes = self.sample_bytes(i);
            let n = self.shapes[i].volume();
            let start = out.len();
            out.resize(start + n, unsafe { std::mem::zeroed() });
            let dst = out[start..].as_mut_ptr() as *mut c_void;
            let src = self.sample_ptr(i) as *const c_void;
            if self.backend == Some(StorageDevice::Gpu) {
                cuda_result(
                    unsafe { cudaMemcpy(dst, src, bytes, CUDA_MEMCPY_DEVICE_TO_HOST) },
                    "cudaMemcpy(D2H)",
                )?;
            } else {
                unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes) };
            }
        }
        Ok(out)
    }

    /// Copies `src` into freshly-sized (or recycled) contiguous storage.
    ///
    /// Host-to-host copies always run in host order; any copy touching a
    /// device runs on `order`'s stream when one is given, synchronously
    /// otherwise. The caller owns completion-event bookkeeping.
    /// `use_copy_kernel` is reserved for a batched gather kernel and
    /// currently selects the same `cudaMemcpyAsync` path.
    pub fn copy_from(
        &mut self,
        src: &TensorList,
        order: AccessOrder,
        use_copy_kernel: bool,
        resources: &MemoryResources,
    ) -> Result<()> {
        let _ = use_copy_kernel;
        let Some(dtype) = src.dtype else {
            self.reset();
            return Ok(());
        };
        self.resize(src.shapes.to_vec(), dtype, resources)?;
        self.layout = src.layout.clone();

        let src_dev = src.backend == Some(StorageDevice::Gpu);
        let dst_dev = self.backend == Some(StorageDevice::Gpu);

        if !src_dev && !dst_dev {
            self.copy_host_to_host(src);
            return Ok(());
        }

        let memcpy_kind = match (src_dev, dst_dev) {
            (false, true) => CUDA_MEMCPY_HOST_TO_DEVICE,
            (true, false) => CUDA_MEMCPY_DEVICE_TO_HOST,
            (true, true) => CUDA_MEMCPY_DEVICE_TO_DEVICE,
            (false, false) => CUDA_MEMCPY_HOST_TO_HOST,
        };
        for i in 0..src.num_samples() {
            let bytes = src.sample_bytes(i);
            if bytes == 0 {
                continue;
            }
            let dst = self.sample_ptr(i) as *mut c_void;
            let from = src.sample_ptr(i) as *const c_void;
            match order.stream() {
                Some(stream) => cuda_result(
                    unsafe { cudaMemcpyAsync(dst, from, bytes, memcpy_kind, stream.raw()) },
                    "cudaMemcpyAsync",
                )?,
                None => cuda_result(
                    unsafe { cudaMemcpy(dst, from, bytes, memcpy_kind) },
                    "cudaMemcpy",
                )?,
            }
        }
        Ok(())
    }

    fn copy_host_to_host(&mut self, src: &TensorList) {
        let n = src.num_samples();
        if src.total_bytes() >= PARALLEL_COPY_THRESHOLD && n > 1 {
            let jobs: Vec<(SendPtr, SendConstPtr, usize)> = (0..n)
                .map(|i| {
                    (
                        SendPtr(self.sample_ptr(i)),
                        SendConstPtr(src.sample_ptr(i) as *const u8),
                        src.sample_bytes(i),
                    )
                })
                .collect();
            jobs.par_iter().for_each(|(dst, from, bytes)| unsafe {
                std::ptr::copy_nonoverlapping(from.0, dst.0, *bytes);
            });
        } else {
            for i in 0..n {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.sample_ptr(i),
                        self.sample_ptr(i),
                        src.sample_bytes(i),
                    )
                };
            }
        }
    }
}

/// Wrappers for raw pointers used in parallel non-overlapping writes.
/// Safety: each job writes a disjoint destination range.
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}
struct SendConstPtr(*const u8);
unsafe impl Send for SendConstPtr {}
unsafe impl Sync for SendConstPtr {}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources() -> MemoryResources {
        MemoryResources::host_only()
    }

    fn shapes_2x2(n: usize) -> Vec<TensorShape> {
        vec![TensorShape::new(vec![2, 2]); n]
    }

    #[test]
    fn from_host_data_is_contiguous() {
        let data: Vec<i32> = (0..16).collect();
        let tl = TensorList::from_host_data(shapes_2x2(4), &data, false, &resources()).unwrap();
        assert_eq!(tl.num_samples(), 4);
        assert!(tl.is_contiguous());
        assert_eq!(tl.sample_as_slice::<i32>(1).unwrap(), &[4, 5, 6, 7]);
        assert_eq!(tl.to_host_vec::<i32>().unwrap(), data);
    }

    #[test]
    fn share_data_is_zero_copy() {
        let data: Vec<i32> = (0..16).collect();
        let src = TensorList::from_host_data(shapes_2x2(4), &data, false, &resources()).unwrap();
        let mut dst = TensorList::new(StorageDevice::Cpu);
        dst.share_data(&src);
        assert!(dst.shares_data_with(&src));
        assert_eq!(dst.contiguous_raw_ptr(), src.contiguous_raw_ptr());
    }

    #[test]
    fn copy_from_duplicates_storage() {
        let data: Vec<i32> = (0..16).collect();
        let src = TensorList::from_host_data(shapes_2x2(4), &data, false, &resources()).unwrap();
        let mut dst = TensorList::new(StorageDevice::Cpu);
        dst.copy_from(&src, AccessOrder::host(), false, &resources())
            .unwrap();
        assert!(!dst.shares_data_with(&src));
        assert_ne!(dst.contiguous_raw_ptr(), src.contiguous_raw_ptr());
        assert_eq!(dst.to_host_vec::<i32>().unwrap(), data);
    }

    #[test]
    fn resize_recycles_exclusive_buffer() {
        let mut tl = TensorList::new(StorageDevice::Cpu);
        tl.resize(shapes_2x2(4), DType::Int32, &resources()).unwrap();
        let first = tl.contiguous_raw_ptr().unwrap();
        tl.resize(shapes_2x2(2), DType::Int32, &resources()).unwrap();
        assert_eq!(tl.contiguous_raw_ptr().unwrap(), first);
    }

    #[test]
    fn resize_does_not_recycle_shared_buffer() {
        let mut tl = TensorList::new(StorageDevice::Cpu);
        tl.resize(shapes_2x2(4), DType::Int32, &resources()).unwrap();
        let mut alias = TensorList::new(StorageDevice::Cpu);
        alias.share_data(&tl);
        let first = tl.contiguous_raw_ptr().unwrap();
        tl.resize(shapes_2x2(4), DType::Int32, &resources()).unwrap();
        assert_ne!(tl.contiguous_raw_ptr().unwrap(), first);
        assert_eq!(alias.contiguous_raw_ptr().unwrap(), first);
    }

    #[test]
    fn non_contiguous_samples() {
        let a = [1i32, 2, 3, 4];
        let b = [5i32, 6, 7, 8];
        let tl = TensorList::from_host_samples(
            TensorShape::new(vec![2, 2]),
            &[&a[..], &b[..]],
            &resources(),
        )
        .unwrap();
        assert!(!tl.is_contiguous());
        assert_eq!(tl.to_host_vec::<i32>().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn dtype_mismatch_is_rejected() {
        let data: Vec<i32> = (0..4).collect();
        let tl =
            TensorList::from_host_data(shapes_2x2(1), &data, false, &resources()).unwrap();
        assert!(tl.sample_as_slice::<f32>(0).is_err());
    }

    #[test]
    fn large_copy_goes_parallel() {
        // 2 MiB across 8 samples exercises the rayon path.
        let shape = TensorShape::new(vec![256, 256]);
        let data: Vec<f32> = (0..8 * 256 * 256).map(|i| i as f32).collect();
        let src =
            TensorList::from_host_data(vec![shape; 8], &data, false, &resources()).unwrap();
        let mut dst = TensorList::new(StorageDevice::Cpu);
        dst.copy_from(&src, AccessOrder::host(), false, &resources())
            .unwrap();
        assert_eq!(dst.to_host_vec::<f32>().unwrap(), data);
    }
}
