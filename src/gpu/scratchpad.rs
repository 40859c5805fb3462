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

//! Per-invocation dynamic scratchpad.
//!
//! One monotonic bump arena per memory kind, layered on a fixed-order
//! adapter around the pipeline's memory resources. Individual frees are
//! no-ops; every block of a kind is returned to its upstream on drop, in
//! the configured deallocation order, so a stream-ordered upstream may
//! defer reclamation until the stream catches up.
//!
//! A scratchpad MUST be a local/temporary scoped to a single operator
//! invocation: its lifetime pins every allocation made through it.

use std::sync::{Arc, OnceLock};

use crate::error::Result;
use crate::gpu::memory::{AsyncMemoryResource, MemoryKind, MemoryResources};
use crate::types::AccessOrder;

/// Default initial block size per kind: 64 KiB.
const DEFAULT_INITIAL_BLOCK: usize = 0x10000;

/// Blocks are requested with the upstream's maximum guaranteed alignment
/// so any smaller alignment can be carved out of them.
const BLOCK_ALIGNMENT: usize = 256;

/// `TDP_SCRATCHPAD_INITIAL_KB` override; parse failure leaves the default.
fn initial_block_bytes_from_env() -> Option<usize> {
    std::env::var("TDP_SCRATCHPAD_INITIAL_KB")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .map(|kb| kb.clamp(1, 64 * 1024) * 1024)
}

fn default_initial_block_bytes() -> usize {
    static CACHE: OnceLock<usize> = OnceLock::new();
    *CACHE.get_or_init(|| initial_block_bytes_from_env().unwrap_or(DEFAULT_INITIAL_BLOCK))
}

/// Forwards to an upstream resource with fixed allocation and
/// deallocation orders, so the arena below never needs to know about
/// stream ordering.
struct FixedOrderResource {
    upstream: Arc<dyn AsyncMemoryResource>,
    alloc_order: AccessOrder,
    dealloc_order: AccessOrder,
}

impl FixedOrderResource {
    fn allocate(&self, bytes: usize, alignment: usize) -> Result<*mut u8> {
        self.upstream.allocate_async(bytes, alignment, self.alloc_order)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) {
        unsafe {
            self.upstream
                .deallocate_async(ptr, bytes, alignment, self.dealloc_order)
        };
    }
}

struct Block {
    ptr: *mut u8,
    bytes: usize,
    alignment: usize,
}

/// Bump allocator over a fixed-order upstream. Individual deallocation is
/// a no-op; blocks are released together on drop.
struct MonotonicArena {
    upstream: FixedOrderResource,
    blocks: Vec<Block>,
    offset: usize,
    next_block_bytes: usize,
    upstream_bytes: usize,
}

// The raw block pointers are owned solely by this arena.
unsafe impl Send for MonotonicArena {}

impl MonotonicArena {
    fn new(upstream: FixedOrderResource, initial_block_bytes: usize) -> Self {
        Self {
            upstream,
            blocks: Vec::new(),
            offset: 0,
            next_block_bytes: initial_block_bytes.max(1),
            upstream_bytes: 0,
        }
    }

    fn grow(&mut self, min_bytes: usize) -> Result<()> {
        let bytes = self.next_block_bytes.max(min_bytes);
        let ptr = self.upstream.allocate(bytes, BLOCK_ALIGNMENT)?;
        self.blocks.push(Block {
            ptr,
            bytes,
            alignment: BLOCK_ALIGNMENT,
        });
        self.offset = 0;
        self.upstream_bytes += bytes;
        self.next_block_bytes = bytes.saturating_mul(2);
        Ok(())
    }

    fn allocate(&mut self, bytes: usize, alignment: usize) -> Result<*mut u8> {
        debug_assert!(bytes > 0);
        if alignment > BLOCK_ALIGNMENT {
            // Oversized alignment gets a dedicated block; still released
            // with the others on drop.
            let ptr = self.upstream.allocate(bytes, alignment)?;
            self.blocks.push(Block {
                ptr,
                bytes,
                alignment,
            });
            self.upstream_bytes += bytes;
            // Keep bumping from the previous block; put the dedicated one
            // just below the top.
            let top = self.blocks.len() - 1;
            if top > 0 {
                self.blocks.swap(top - 1, top);
            } else {
                self.offset = bytes;
            }
            return Ok(ptr);
        }

        let fits = |blocks: &[Block], offset: usize| -> Option<usize> {
            let block = blocks.last()?;
            let aligned = offset.checked_add(alignment - 1)? & !(alignment - 1);
            (aligned + bytes <= block.bytes).then_some(aligned)
        };

        if let Some(aligned) = fits(&self.blocks, self.offset) {
            let ptr = unsafe { self.blocks.last().unwrap().ptr.add(aligned) };
            self.offset = aligned + bytes;
            return Ok(ptr);
        }

        self.grow(bytes)?;
        let block = self.blocks.last().unwrap();
        self.offset = bytes;
        Ok(block.ptr)
    }

    fn upstream_bytes(&self) -> usize {
        self.upstream_bytes
    }
}

impl Drop for MonotonicArena {
    fn drop(&mut self) {
        for block in self.blocks.drain(..).rev() {
            unsafe {
                self.upstream
                    .deallocate(block.ptr, block.bytes, block.alignment)
            };
        }
    }
}

const KIND_COUNT: usize = 4;

fn kind_index(kind: MemoryKind) -> usize {
    match kind {
        MemoryKind::Host => 0,
        MemoryKind::Pinned => 1,
        MemoryKind::Device => 2,
        MemoryKind::Managed => 3,
    }
}

/// Per-invocation scratch memory across the four kinds.
///
/// Device memory is allocated and deallocated in `device_order`. Pinned
/// and managed memory are allocated host-ordered and deallocated in their
/// configured orders (default: `device_order`). A kind's upstream is not
/// touched until the first non-empty request for that kind.
pub struct Scratchpad {
    resources: MemoryResources,
    device_order: AccessOrder,
    pinned_dealloc_order: AccessOrder,
    managed_dealloc_order: AccessOrder,
    initial_block_bytes: usize,
    arenas: [Option<MonotonicArena>; KIND_COUNT],
}

impl Scratchpad {
    /// Scratchpad whose pinned/managed deallocation orders default to
    /// `device_order`.
    pub fn new(resources: MemoryResources, device_order: AccessOrder) -> Self {
        Self::with_orders(resources, device_order, device_order, device_order)
    }

    pub fn with_orders(
        resources: MemoryResources,
        device_order: AccessOrder,
        pinned_dealloc_order: AccessOrder,
        managed_dealloc_order: AccessOrder,
    ) -> Self {
        Self {
            resources,
            device_order,
            pinned_dealloc_order,
            managed_dealloc_order,
            initial_block_bytes: default_initial_block_bytes(),
            arenas: [None, None, None, None],
        }
    }

    fn materialize(&mut self, kind: MemoryKind) -> Result<&mut MonotonicArena> {
        let idx = kind_index(kind);
        if self.arenas[idx].is_none() {
            let upstream = Arc::clone(self.resources.resource(kind)?);
            let (alloc_order, dealloc_order) = match kind {
                MemoryKind::Host => (AccessOrder::host(), AccessOrder::host()),
                MemoryKind::Pinned => (AccessOrder::host(), self.pinned_dealloc_order),
                MemoryKind::Device => (self.device_order, self.device_order),
                MemoryKind::Managed => (AccessOrder::host(), self.managed_dealloc_order),
            };
            self.arenas[idx] = Some(MonotonicArena::new(
                FixedOrderResource {
                    upstream,
                    alloc_order,
                    dealloc_order,
                },
                self.initial_block_bytes,
            ));
        }
        Ok(self.arenas[idx].as_mut().unwrap())
    }

    /// Allocates `bytes` of `kind` memory. The returned pointer lives
    /// until the scratchpad is destroyed; callers must not free it.
    /// A zero-byte request returns null without materializing the kind.
    pub fn alloc(&mut self, kind: MemoryKind, bytes: usize, alignment: usize) -> Result<*mut u8> {
        if bytes == 0 {
            return Ok(std::ptr::null_mut());
        }
        self.materialize(kind)?.allocate(bytes, alignment)
    }

    /// Typed helper: uninitialized scratch for `count` elements of `T`.
    pub fn alloc_slice<T: Copy>(&mut self, kind: MemoryKind, count: usize) -> Result<*mut T> {
        let ptr = self.alloc(kind, count * std::mem::size_of::<T>(), align_of::<T>())?;
        Ok(ptr as *mut T)
    }

    /// Whether the kind's upstream has been materialized.
    pub fn is_materialized(&self, kind: MemoryKind) -> bool {
        self.arenas[kind_index(kind)].is_some()
    }

    /// Total bytes requested from the kind's upstream so far.
    pub fn upstream_bytes(&self, kind: MemoryKind) -> usize {
        self.arenas[kind_index(kind)]
            .as_ref()
            .map(MonotonicArena::upstream_bytes)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::memory::{HostResource, MemoryResource};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Host-backed resource that counts allocations and deallocations.
    struct CountingResource {
        inner: HostResource,
        allocs: AtomicUsize,
        deallocs: AtomicUsize,
        bytes: AtomicUsize,
    }

    impl CountingResource {
        fn new() -> Self {
            Self {
                inner: HostResource,
                allocs: AtomicUsize::new(0),
                deallocs: AtomicUsize::new(0),
                bytes: AtomicUsize::new(0),
            }
        }
    }

    impl MemoryResource for CountingResource {
        fn kind(&self) -> MemoryKind {
            MemoryKind::Host
        }
        fn allocate(&self, bytes: usize, alignment: usize) -> crate::error::Result<*mut u8> {
            self.allocs.fetch_add(1, Ordering::SeqCst);
            self.bytes.fetch_add(bytes, Ordering::SeqCst);
            self.inner.allocate(bytes, alignment)
        }
        unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) {
            self.deallocs.fetch_add(1, Ordering::SeqCst);
            unsafe { self.inner.deallocate(ptr, bytes, alignment) };
        }
    }

    impl AsyncMemoryResource for CountingResource {
        fn allocate_async(
            &self,
            bytes: usize,
            alignment: usize,
            _order: AccessOrder,
        ) -> crate::error::Result<*mut u8> {
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

    fn counting_resources() -> (MemoryResources, Arc<CountingResource>) {
        let counting = Arc::new(CountingResource::new());
        let mut resources = MemoryResources::host_only();
        resources.host = counting.clone();
        (resources, counting)
    }

    #[test]
    fn zero_byte_request_does_not_materialize() {
        let mut pad = Scratchpad::new(MemoryResources::host_only(), AccessOrder::host());
        let ptr = pad.alloc(MemoryKind::Host, 0, 8).unwrap();
        assert!(ptr.is_null());
        assert!(!pad.is_materialized(MemoryKind::Host));
    }

    #[test]
    fn blocks_released_only_on_drop() {
        let (resources, counting) = counting_resources();
        {
            let mut pad = Scratchpad::new(resources, AccessOrder::host());
            // Force several block allocations past the initial 64 KiB.
            for _ in 0..8 {
                pad.alloc(MemoryKind::Host, 48 * 1024, 64).unwrap();
            }
            assert!(counting.allocs.load(Ordering::SeqCst) >= 2);
            assert_eq!(counting.deallocs.load(Ordering::SeqCst), 0);
        }
        assert_eq!(
            counting.allocs.load(Ordering::SeqCst),
            counting.deallocs.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn upstream_bytes_grow_monotonically() {
        let (resources, _counting) = counting_resources();
        let mut pad = Scratchpad::new(resources, AccessOrder::host());
        let mut last = 0;
        for _ in 0..16 {
            pad.alloc(MemoryKind::Host, 20 * 1024, 8).unwrap();
            let now = pad.upstream_bytes(MemoryKind::Host);
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn alignment_is_honored() {
        let mut pad = Scratchpad::new(MemoryResources::host_only(), AccessOrder::host());
        pad.alloc(MemoryKind::Host, 3, 1).unwrap();
        let ptr = pad.alloc(MemoryKind::Host, 64, 128).unwrap();
        assert_eq!(ptr as usize % 128, 0);
    }

    #[test]
    fn device_kind_unavailable_without_device() {
        let mut pad = Scratchpad::new(MemoryResources::host_only(), AccessOrder::host());
        assert!(pad.alloc(MemoryKind::Device, 64, 64).is_err());
    }

    /// Captures the orders the fixed-order adapter forwards upstream.
    struct OrderRecordingResource {
        inner: HostResource,
        alloc_orders: Mutex<Vec<AccessOrder>>,
        dealloc_orders: Mutex<Vec<AccessOrder>>,
    }

    impl OrderRecordingResource {
        fn new() -> Self {
            Self {
                inner: HostResource,
                alloc_orders: Mutex::new(Vec::new()),
                dealloc_orders: Mutex::new(Vec::new()),
            }
        }
    }

    impl MemoryResource for OrderRecordingResource {
        fn kind(&self) -> MemoryKind {
            MemoryKind::Host
        }
        fn allocate(&self, bytes: usize, alignment: usize) -> crate::error::Result<*mut u8> {
            self.inner.allocate(bytes, alignment)
        }
        unsafe fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) {
            unsafe { self.inner.deallocate(ptr, bytes, alignment) };
        }
    }

    impl AsyncMemoryResource for OrderRecordingResource {
        fn allocate_async(
            &self,
            bytes: usize,
            alignment: usize,
            order: AccessOrder,
        ) -> crate::error::Result<*mut u8> {
            self.alloc_orders.lock().unwrap().push(order);
            self.inner.allocate(bytes, alignment)
        }
        unsafe fn deallocate_async(
            &self,
            ptr: *mut u8,
            bytes: usize,
            alignment: usize,
            order: AccessOrder,
        ) {
            self.dealloc_orders.lock().unwrap().push(order);
            unsafe { self.inner.deallocate(ptr, bytes, alignment) };
        }
    }

    #[test]
    fn device_orders_are_forwarded_upstream() {
        // The host-backed mock stands in for the device upstream so the
        // ordering contract is observable without a GPU.
        let recording = Arc::new(OrderRecordingResource::new());
        let mut resources = MemoryResources::host_only();
        resources.device = Some(recording.clone());

        let stream = crate::types::StreamHandle(0xd0d0 as *mut std::ffi::c_void);
        let device_order = AccessOrder::Device {
            device_id: 0,
            stream,
        };
        {
            let mut pad = Scratchpad::new(resources, device_order);
            pad.alloc(MemoryKind::Device, 1 << 20, 256).unwrap();
        }
        let allocs = recording.alloc_orders.lock().unwrap();
        let deallocs = recording.dealloc_orders.lock().unwrap();
        assert!(!allocs.is_empty());
        assert!(allocs.iter().all(|o| *o == device_order));
        assert_eq!(allocs.len(), deallocs.len());
        assert!(deallocs.iter().all(|o| *o == device_order));
    }

    #[test]
    fn pinned_allocates_host_ordered_and_frees_in_device_order() {
        let recording = Arc::new(OrderRecordingResource::new());
        let mut resources = MemoryResources::host_only();
        resources.pinned = Some(recording.clone());

        let stream = crate::types::StreamHandle(0xbeef as *mut std::ffi::c_void);
        let device_order = AccessOrder::Device {
            device_id: 0,
            stream,
        };
        {
            let mut pad = Scratchpad::new(resources, device_order);
            pad.alloc(MemoryKind::Pinned, 4096, 64).unwrap();
        }
        let allocs = recording.alloc_orders.lock().unwrap();
        let deallocs = recording.dealloc_orders.lock().unwrap();
        assert!(allocs.iter().all(|o| *o == AccessOrder::Host));
        assert!(deallocs.iter().all(|o| *o == device_order));
    }

    #[test]
    fn env_override_parses() {
        static ENV_TEST_LOCK: Mutex<()> = Mutex::new(());
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        unsafe { std::env::set_var("TDP_SCRATCHPAD_INITIAL_KB", "128") };
        assert_eq!(initial_block_bytes_from_env(), Some(128 * 1024));
        unsafe { std::env::set_var("TDP_SCRATCHPAD_INITIAL_KB", "not-a-number") };
        assert_eq!(initial_block_bytes_from_env(), None);
        unsafe { std::env::remove_var("TDP_SCRATCHPAD_INITIAL_KB") };
    }
}
