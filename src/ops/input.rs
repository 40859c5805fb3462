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

//! In-memory input to a pipeline.
//!
//! The input operator has no pipeline-internal inputs; external producers
//! enqueue batches with [`set_data_source`](InputOperator::set_data_source)
//! and the executor consumes them one iteration at a time. The queue is a
//! [`CachingList`] of items carrying the batch, an opaque data id and a
//! leased completion event; consumers never observe a sample before its
//! completion event has been made visible in their order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::caching_list::CachingList;
use crate::error::{Result, TdpError};
use crate::gpu::event_pool::{EventHandle, EventLease};
use crate::gpu::stream_pool::StreamLease;
use crate::gpu::{observe_event, record_event};
use crate::graph::{IoDesc, OpSpec};
use crate::services::SharedServices;
use crate::tensor::TensorList;
use crate::types::{AccessOrder, DType, OpBackend, StorageDevice};
use crate::worker_thread::WorkerThread;
use crate::workspace::Workspace;

/// Overrides the operator's `no_copy` default for one feed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CopyMode {
    /// Use the operator's `no_copy` parameter.
    #[default]
    Default,
    /// Always copy into an internal buffer.
    ForceCopy,
    /// Always share the producer's storage.
    ForceNoCopy,
}

/// Options for one feed.
#[derive(Clone, Copy, Debug, Default)]
pub struct InputSettingMode {
    /// Host-block until the copy into the internal buffer completed.
    pub sync: bool,
    /// Prefer a batched gather kernel over `cudaMemcpyAsync` for
    /// non-contiguous sources (hint; see the copy path).
    pub use_copy_kernel: bool,
    pub copy_mode: CopyMode,
}

/// One queue slot: a batch, its id, and completion bookkeeping.
#[derive(Default)]
pub(crate) struct InputQueueItem {
    data: TensorList,
    data_id: Option<String>,
    copy_complete: EventLease,
    /// Host-side completion for copies landing in host memory in a device
    /// order; flips once the recorded event has been synchronized.
    ready: Option<Arc<AtomicBool>>,
    copy_performed: bool,
    copy_requested: bool,
}

impl InputQueueItem {
    fn is_ready(&self) -> bool {
        self.ready.as_ref().is_none_or(|r| r.load(Ordering::Acquire))
    }
}

struct InputState {
    queue: CachingList<InputQueueItem>,
    running: bool,
    /// Warn-once flag for mixing contiguous and non-contiguous zero-copy
    /// GPU feeds (scoped to this operator instance).
    warned_noncontiguous: bool,
}

struct QueueSync {
    state: Mutex<InputState>,
    cv: Condvar,
}

/// The `ExternalSource` operator.
pub struct InputOperator {
    name: String,
    backend: StorageDevice,
    device_id: i32,
    blocking: bool,
    no_copy: bool,
    layout: String,
    ndim: Option<usize>,
    dtype: Option<DType>,
    services: Arc<SharedServices>,
    sync: Arc<QueueSync>,
    /// Stream used for copies when the producer gives no device order.
    internal_copy_stream: Option<StreamLease>,
    sync_worker: WorkerThread,
}

impl InputOperator {
    pub(crate) fn from_spec(spec: &OpSpec, services: &Arc<SharedServices>) -> Result<Self> {
        let backend = match spec.backend() {
            OpBackend::Cpu => StorageDevice::Cpu,
            OpBackend::Gpu => StorageDevice::Gpu,
            OpBackend::Mixed => {
                return Err(TdpError::InvalidArgument(
                    "ExternalSource cannot run on the mixed backend".to_string(),
                ));
            }
        };
        let internal_copy_stream = if backend == StorageDevice::Gpu {
            services.require_device()?;
            Some(services.stream_pool.lease(services.device_id())?)
        } else {
            None
        };
        let ndim = match spec.arg_int("ndim", -1)? {
            n if n < 0 => None,
            n => Some(n as usize),
        };
        let dtype = match spec.arg_str("dtype", "")? {
            s if s.is_empty() => None,
            s => Some(DType::parse(&s)?),
        };
        Ok(Self {
            name: spec.arg_str("name", spec.name())?,
            backend,
            device_id: services.device_id(),
            blocking: spec.arg_bool("blocking", false)?,
            no_copy: spec.arg_bool("no_copy", false)?,
            layout: spec.arg_str("layout", "")?,
            ndim,
            dtype,
            services: Arc::clone(services),
            sync: Arc::new(QueueSync {
                state: Mutex::new(InputState {
                    queue: CachingList::new(),
                    running: true,
                    warned_noncontiguous: false,
                }),
                cv: Condvar::new(),
            }),
            internal_copy_stream,
            sync_worker: WorkerThread::new("tdp-input-sync"),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_layout(&self) -> &str {
        &self.layout
    }

    pub fn in_ndim(&self) -> Option<usize> {
        self.ndim
    }

    pub fn in_dtype(&self) -> Option<DType> {
        self.dtype
    }

    pub(crate) fn desc(&self) -> IoDesc {
        IoDesc {
            name: self.name.clone(),
            device: self.backend,
            ndim: self.ndim,
            dtype: self.dtype,
            layout: self.layout.clone(),
        }
    }

    /// Whether a feed with `mode` would copy into an internal buffer.
    pub fn would_copy(&self, mode: CopyMode) -> bool {
        match mode {
            CopyMode::ForceCopy => true,
            CopyMode::ForceNoCopy => false,
            CopyMode::Default => !self.no_copy,
        }
    }

    /// Number of queued batches.
    pub fn feed_count(&self) -> usize {
        self.sync.state.lock().unwrap().queue.len()
    }

    /// A non-consuming view of the batch next in line.
    pub fn peek_current_data(&self) -> Option<TensorList> {
        let state = self.sync.state.lock().unwrap();
        state.queue.peek_front().map(|item| {
            let mut view = TensorList::default();
            view.share_data(&item.data);
            view
        })
    }

    /// Cancels any blocked consumer; subsequent consumer waits return
    /// [`TdpError::Cancelled`].
    pub fn break_waiting(&self) {
        {
            let mut state = self.sync.state.lock().unwrap();
            state.running = false;
        }
        self.sync.cv.notify_all();
    }

    fn validate_feed(&self, batch: &TensorList) -> Result<()> {
        if batch.num_samples() == 0 {
            return Err(TdpError::InvalidArgument(format!(
                "input '{}': provided batch cannot be empty",
                self.name
            )));
        }
        if let (Some(expected), Some(got)) = (self.dtype, batch.dtype())
            && expected != got
        {
            return Err(TdpError::InvalidArgument(format!(
                "input '{}': expected dtype {}, got {}",
                self.name,
                expected.name(),
                got.name()
            )));
        }
        if let Some(ndim) = self.ndim
            && batch.shape(0).ndim() != ndim
        {
            return Err(TdpError::InvalidArgument(format!(
                "input '{}': expected {}-dimensional samples, got {}",
                self.name,
                ndim,
                batch.shape(0).ndim()
            )));
        }
        Ok(())
    }

    /// Enqueues a batch for a future iteration.
    ///
    /// `order` is the producer's access order; `data_id` is opaque
    /// metadata surfaced with the iteration that consumes this batch.
    pub fn set_data_source(
        &self,
        batch: &TensorList,
        order: AccessOrder,
        mode: InputSettingMode,
        data_id: Option<String>,
    ) -> Result<()> {
        crate::profile_scope!("InputOperator::SetDataSource");
        self.validate_feed(batch)?;
        if self.would_copy(mode.copy_mode) {
            self.copy_user_data(batch, order, mode, data_id)?;
        } else {
            self.share_user_data(batch, order, mode, data_id)?;
        }
        self.sync.cv.notify_all();
        Ok(())
    }

    /// Takes a recycled (or fresh) item and binds it to this operator's
    /// backend, device and internal order. Caller holds the state lock.
    fn get_empty_item(
        &self,
        state: &mut MutexGuard<'_, InputState>,
        data_id: Option<String>,
    ) -> InputQueueItem {
        let mut item = state.queue.get_empty();
        if item.data.backend() != Some(self.backend) {
            item.data = TensorList::new(self.backend);
        }
        let device_id = if self.backend == StorageDevice::Gpu || item.data.is_pinned() {
            self.device_id
        } else {
            -1
        };
        item.data.set_device_id(device_id);
        item.data.set_order(self.internal_copy_order());
        item.data_id = data_id;
        item.ready = None;
        item.copy_performed = false;
        item.copy_requested = false;
        item
    }

    fn internal_copy_order(&self) -> AccessOrder {
        self.internal_copy_stream
            .as_ref()
            .map(StreamLease::order)
            .unwrap_or(AccessOrder::Host)
    }

    fn share_user_data(
        &self,
        batch: &TensorList,
        order: AccessOrder,
        mode: InputSettingMode,
        data_id: Option<String>,
    ) -> Result<()> {
        if batch.backend() != Some(self.backend) {
            return Err(TdpError::InvalidArgument(format!(
                "input '{}': no_copy is supported only for the same data source device type as \
                 the operator; received {} input for a {} operator",
                self.name,
                batch.backend().map(StorageDevice::name).unwrap_or("empty"),
                self.backend.name()
            )));
        }
        match self.backend {
            StorageDevice::Cpu => {
                let mut state = self.sync.state.lock().unwrap();
                let mut item = self.get_empty_item(&mut state, data_id);
                // Reconcile pinned status before adopting foreign storage.
                if batch.is_pinned() != item.data.is_pinned() {
                    item.data.reset();
                    item.data.set_pinned(batch.is_pinned());
                }
                item.data.share_data(batch);
                item.copy_requested = false;
                item.copy_performed = true;
                state.queue.push_back(item);
            }
            StorageDevice::Gpu => self.share_gpu_data(batch, order, mode, data_id)?,
        }
        Ok(())
    }

    /// Shares a contiguous, co-located GPU batch directly; anything else
    /// falls back to a copy with a completion event in the caller's order.
    fn share_gpu_data(
        &self,
        batch: &TensorList,
        order: AccessOrder,
        mode: InputSettingMode,
        data_id: Option<String>,
    ) -> Result<()> {
        let mut state = self.sync.state.lock().unwrap();
        let mut item = self.get_empty_item(&mut state, data_id);

        let order = if order.is_device() {
            order
        } else if batch.order().is_device() {
            batch.order()
        } else {
            item.data.order()
        };

        if batch.is_contiguous() && batch.device_id() == self.device_id {
            item.data.share_data(batch);
            item.copy_performed = false;
        } else {
            if !state.warned_noncontiguous {
                log::warn!(
                    "input '{}': zero-copy requested for a non-contiguous or remote GPU batch; \
                     copying instead. Mixing contiguous and non-contiguous inputs trashes the \
                     internal gather buffer.",
                    self.name
                );
                state.warned_noncontiguous = true;
            }
            if item.data.shares_data() {
                item.data.reset();
            }
            item.data
                .copy_from(batch, order, mode.use_copy_kernel, &self.services.memory)?;
            if order.is_device() {
                let event = item
                    .copy_complete
                    .get(&self.services.event_pool, order.device_id().unwrap())?;
                record_event(event, order)?;
            }
            item.copy_performed = true;
        }
        item.copy_requested = false;
        state.queue.push_back(item);
        Ok(())
    }

    fn copy_user_data(
        &self,
        batch: &TensorList,
        order: AccessOrder,
        mode: InputSettingMode,
        data_id: Option<String>,
    ) -> Result<()> {
        // Hold the lock only around queue manipulation; the copy itself
        // can be large.
        let mut item = {
            let mut state = self.sync.state.lock().unwrap();
            self.get_empty_item(&mut state, data_id)
        };

        match self.backend {
            StorageDevice::Cpu => {
                item.data.set_order(AccessOrder::host());
                if batch.is_pinned() != item.data.is_pinned() {
                    item.data.reset();
                    item.data.set_pinned(batch.is_pinned());
                }
                // Host-to-host copies never take a device order.
                let copy_order = if batch.backend() == Some(StorageDevice::Gpu) {
                    order
                } else {
                    AccessOrder::host()
                };
                item.data
                    .copy_from(batch, copy_order, mode.use_copy_kernel, &self.services.memory)?;
                if copy_order.is_device() {
                    let device = copy_order.device_id().unwrap();
                    let event = item.copy_complete.get(&self.services.event_pool, device)?;
                    record_event(event, copy_order)?;
                    if mode.sync {
                        observe_event(AccessOrder::host(), event)?;
                    } else {
                        self.defer_host_sync(&mut item, event)?;
                    }
                }
            }
            StorageDevice::Gpu => {
                let copy_order = if order.is_device() {
                    order
                } else {
                    item.data.order()
                };
                item.data
                    .copy_from(batch, copy_order, mode.use_copy_kernel, &self.services.memory)?;
                let device = copy_order.device_id().unwrap_or(self.device_id);
                let event = item.copy_complete.get(&self.services.event_pool, device)?;
                record_event(event, copy_order)?;
                if mode.sync {
                    observe_event(AccessOrder::host(), event)?;
                }
            }
        }

        item.copy_requested = true;
        item.copy_performed = true;
        let mut state = self.sync.state.lock().unwrap();
        state.queue.push_back(item);
        Ok(())
    }

    /// Host-destination copies issued in a device order become visible to
    /// CPU consumers only after the event fires; the sync worker flips the
    /// ready flag off the feeding thread.
    fn defer_host_sync(&self, item: &mut InputQueueItem, event: EventHandle) -> Result<()> {
        let ready = Arc::new(AtomicBool::new(false));
        item.ready = Some(Arc::clone(&ready));
        let sync = Arc::clone(&self.sync);
        self.sync_worker.submit(move || {
            if let Err(e) = observe_event(AccessOrder::host(), event) {
                log::warn!("input sync worker: event synchronize failed: {}", e);
            }
            ready.store(true, Ordering::Release);
            sync.cv.notify_all();
        })
    }

    fn no_data_error(&self) -> TdpError {
        TdpError::NoData(format!(
            "no data was provided to input '{}'; feed it before running the pipeline or enable \
             the `blocking` parameter",
            self.name
        ))
    }

    /// Blocks (or fails) until the batch next in line is consumable.
    pub(crate) fn handle_data_availability(&self) -> Result<()> {
        let mut state = self.sync.state.lock().unwrap();
        if self.blocking {
            loop {
                if !state.running {
                    return Err(TdpError::Cancelled);
                }
                if state.queue.peek_front().is_some_and(InputQueueItem::is_ready) {
                    return Ok(());
                }
                state = self.sync.cv.wait(state).unwrap();
            }
        } else {
            if state.queue.is_empty() {
                return Err(self.no_data_error());
            }
            // Data was fed but its host sync may still be in flight.
            while !state.queue.peek_front().unwrap().is_ready() {
                if !state.running {
                    return Err(TdpError::Cancelled);
                }
                state = self.sync.cv.wait(state).unwrap();
            }
            Ok(())
        }
    }

    /// Batch size of the next scheduled iteration, read through the
    /// prophet without consuming data.
    pub(crate) fn next_batch_size(&self) -> Result<usize> {
        let mut state = self.sync.state.lock().unwrap();
        if self.blocking {
            loop {
                if !state.running {
                    return Err(TdpError::Cancelled);
                }
                if state.queue.can_prophet_advance() {
                    break;
                }
                state = self.sync.cv.wait(state).unwrap();
            }
        } else if !state.queue.can_prophet_advance() {
            return Err(self.no_data_error());
        }
        Ok(state.queue.peek_prophet().unwrap().data.num_samples())
    }

    /// Commits the prophet to the batch [`next_batch_size`] inspected.
    /// A cancelled wait returns [`TdpError::Cancelled`] without advancing.
    pub(crate) fn advance(&self) -> Result<()> {
        let mut state = self.sync.state.lock().unwrap();
        if self.blocking {
            loop {
                if !state.running {
                    return Err(TdpError::Cancelled);
                }
                if state.queue.can_prophet_advance() {
                    break;
                }
                state = self.sync.cv.wait(state).unwrap();
            }
        } else if !state.queue.can_prophet_advance() {
            return Err(self.no_data_error());
        }
        state.queue.advance_prophet();
        Ok(())
    }

    /// Moves the head batch into `target` and recycles the queue slot.
    ///
    /// Device consumers wait on the item's completion event in
    /// `consumer_order` before the data may be touched; host consumers
    /// synchronize on it.
    pub(crate) fn forward_current_data(
        &self,
        target: &mut TensorList,
        target_data_id: &mut Option<String>,
        consumer_order: AccessOrder,
    ) -> Result<()> {
        crate::profile_scope!("InputOperator::ForwardCurrentData");
        let mut item = {
            let mut state = self.sync.state.lock().unwrap();
            state.queue.pop_front().ok_or_else(|| self.no_data_error())?
        };
        debug_assert!(
            !item.copy_requested || item.copy_performed,
            "requested copies are performed before the item is queued"
        );
        debug_assert!(
            !item.copy_requested
                || item.copy_complete.handle().is_some()
                || !item.data.order().is_device(),
            "a device-ordered copy must have recorded its completion event"
        );
        if let Some(event) = item.copy_complete.handle() {
            observe_event(consumer_order, event)?;
        }
        target.share_data(&item.data);
        if consumer_order.is_device() {
            target.set_order(consumer_order);
        }
        *target_data_id = item.data_id.take();
        item.copy_complete.put();
        let mut state = self.sync.state.lock().unwrap();
        state.queue.recycle(item);
        Ok(())
    }

    /// Executor entry point: forwards one batch into output slot 0 and
    /// publishes the "depleted" and "data_id" traces.
    pub(crate) fn run_consume(&self, ws: &mut Workspace) -> Result<()> {
        self.handle_data_availability()?;
        let mut out = TensorList::new(self.backend);
        let mut data_id = None;
        self.forward_current_data(&mut out, &mut data_id, ws.order())?;
        if !self.layout.is_empty() && out.layout().is_empty() {
            out.set_layout(&self.layout);
        }
        if let Some(id) = data_id {
            ws.set_trace("data_id", &id);
        }
        let depleted = self.sync.state.lock().unwrap().queue.is_empty();
        ws.set_trace("depleted", if depleted { "true" } else { "false" });
        ws.set_output(0, out)
    }
}

impl Drop for InputOperator {
    fn drop(&mut self) {
        self.break_waiting();
        self.sync_worker.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OpSpec;
    use crate::types::TensorShape;

    fn services() -> Arc<SharedServices> {
        SharedServices::new(-1, 2).unwrap()
    }

    fn cpu_source(services: &Arc<SharedServices>, blocking: bool, no_copy: bool) -> InputOperator {
        let spec = OpSpec::new("ExternalSource")
            .with_name("x")
            .arg("blocking", blocking)
            .arg("no_copy", no_copy)
            .output("x", StorageDevice::Cpu);
        InputOperator::from_spec(&spec, services).unwrap()
    }

    fn batch(services: &Arc<SharedServices>, values: &[i32]) -> TensorList {
        TensorList::from_host_data(
            vec![TensorShape::new(vec![values.len() as i64])],
            values,
            false,
            &services.memory,
        )
        .unwrap()
    }

    #[test]
    fn empty_batch_is_rejected() {
        let services = services();
        let op = cpu_source(&services, false, false);
        let empty = TensorList::new(StorageDevice::Cpu);
        let err = op.set_data_source(&empty, AccessOrder::host(), Default::default(), None);
        assert!(matches!(err, Err(TdpError::InvalidArgument(_))));
    }

    #[test]
    fn non_blocking_empty_queue_is_no_data() {
        let services = services();
        let op = cpu_source(&services, false, false);
        assert!(matches!(
            op.handle_data_availability(),
            Err(TdpError::NoData(_))
        ));
        assert!(matches!(op.next_batch_size(), Err(TdpError::NoData(_))));
    }

    #[test]
    fn force_no_copy_shares_pointer() {
        let services = services();
        let op = cpu_source(&services, false, false);
        let src = batch(&services, &[1, 2, 3, 4]);
        let mode = InputSettingMode {
            copy_mode: CopyMode::ForceNoCopy,
            ..Default::default()
        };
        op.set_data_source(&src, AccessOrder::host(), mode, None).unwrap();
        op.next_batch_size().unwrap();
        op.advance().unwrap();
        let mut out = TensorList::default();
        let mut id = None;
        op.forward_current_data(&mut out, &mut id, AccessOrder::host())
            .unwrap();
        assert_eq!(out.contiguous_raw_ptr(), src.contiguous_raw_ptr());
    }

    #[test]
    fn force_copy_detaches_from_source() {
        let services = services();
        // Operator defaults to no_copy; the feed overrides it.
        let op = cpu_source(&services, false, true);
        let src = batch(&services, &[1, 2, 3, 4]);
        let mode = InputSettingMode {
            copy_mode: CopyMode::ForceCopy,
            ..Default::default()
        };
        op.set_data_source(&src, AccessOrder::host(), mode, None).unwrap();
        op.next_batch_size().unwrap();
        op.advance().unwrap();
        let mut out = TensorList::default();
        let mut id = None;
        op.forward_current_data(&mut out, &mut id, AccessOrder::host())
            .unwrap();
        assert_ne!(out.contiguous_raw_ptr(), src.contiguous_raw_ptr());
        assert_eq!(out.to_host_vec::<i32>().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn data_id_round_trips() {
        let services = services();
        let op = cpu_source(&services, false, false);
        let src = batch(&services, &[7]);
        op.set_data_source(
            &src,
            AccessOrder::host(),
            Default::default(),
            Some("epoch-0/batch-3".to_string()),
        )
        .unwrap();
        op.next_batch_size().unwrap();
        op.advance().unwrap();
        let mut out = TensorList::default();
        let mut id = None;
        op.forward_current_data(&mut out, &mut id, AccessOrder::host())
            .unwrap();
        assert_eq!(id.as_deref(), Some("epoch-0/batch-3"));
    }

    #[test]
    fn prophet_sees_queued_batch_sizes() {
        let services = services();
        let op = cpu_source(&services, false, false);
        op.set_data_source(&batch(&services, &[1, 2]), AccessOrder::host(), Default::default(), None)
            .unwrap();
        op.set_data_source(&batch(&services, &[1, 2, 3]), AccessOrder::host(), Default::default(), None)
            .unwrap();
        assert_eq!(op.feed_count(), 2);
        assert_eq!(op.next_batch_size().unwrap(), 2);
        op.advance().unwrap();
        assert_eq!(op.next_batch_size().unwrap(), 3);
        op.advance().unwrap();
        assert!(matches!(op.next_batch_size(), Err(TdpError::NoData(_))));
    }

    #[test]
    fn break_waiting_cancels_blocked_consumer() {
        let services = services();
        let op = Arc::new(cpu_source(&services, true, false));
        let waiter = {
            let op = Arc::clone(&op);
            std::thread::spawn(move || op.next_batch_size())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        op.break_waiting();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(TdpError::Cancelled)));
        // The prophet did not move.
        assert_eq!(op.feed_count(), 0);
    }

    #[test]
    fn blocking_consumer_wakes_on_feed() {
        let services = services();
        let op = Arc::new(cpu_source(&services, true, false));
        let waiter = {
            let op = Arc::clone(&op);
            std::thread::spawn(move || op.next_batch_size())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        op.set_data_source(&batch(&services, &[1, 2, 3]), AccessOrder::host(), Default::default(), None)
            .unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), 3);
    }

    #[test]
    fn recycled_slot_is_reused() {
        let services = services();
        let op = cpu_source(&services, false, false);
        for round in 0..3 {
            let src = batch(&services, &[round]);
            op.set_data_source(&src, AccessOrder::host(), Default::default(), None)
                .unwrap();
            op.next_batch_size().unwrap();
            op.advance().unwrap();
            let mut out = TensorList::default();
            let mut id = None;
            op.forward_current_data(&mut out, &mut id, AccessOrder::host())
                .unwrap();
            assert_eq!(out.to_host_vec::<i32>().unwrap(), vec![round]);
        }
        assert_eq!(op.feed_count(), 0);
    }

    #[test]
    fn dtype_mismatch_is_rejected() {
        let services = services();
        let spec = OpSpec::new("ExternalSource")
            .with_name("x")
            .arg("dtype", "float32")
            .output("x", StorageDevice::Cpu);
        let op = InputOperator::from_spec(&spec, &services).unwrap();
        let err = op.set_data_source(
            &batch(&services, &[1]),
            AccessOrder::host(),
            Default::default(),
            None,
        );
        assert!(matches!(err, Err(TdpError::InvalidArgument(_))));
    }
}
