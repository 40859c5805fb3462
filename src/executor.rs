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

//! The pipelined multi-stage scheduler.
//!
//! Operators are partitioned by backend into three totally-ordered stages
//! (CPU → Mixed → GPU). Every stage hand-off is a bounded channel of depth
//! `P` (the prefetch depth), so at most `P` iterations are in flight per
//! stage and a full queue backpressures `run()`. Stage hand-offs involving
//! the device are synchronized by recording an event on the producing
//! stream and waiting on it on the consuming stream; `outputs()` observes
//! the final events host-side before surfacing handles.
//!
//! In async mode three stage worker threads drain the queues; otherwise
//! `run()` drives all stages inline and overlap comes from the device
//! streams alone. Iterations complete in FIFO order; a failed iteration
//! short-circuits its remaining stages and surfaces its error from
//! `outputs()` in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::config::PipelineParams;
use crate::error::{Result, TdpError};
use crate::gpu::event_pool::EventLease;
use crate::gpu::scratchpad::Scratchpad;
use crate::gpu::stream_pool::StreamLease;
use crate::gpu::observe_event;
use crate::graph::BuiltGraph;
use crate::ops::input::InputOperator;
use crate::ops::{OpImpl, instantiate};
use crate::services::SharedServices;
use crate::tensor::TensorList;
use crate::types::{AccessOrder, OpBackend};
use crate::workspace::Workspace;

/// One operator with resolved edge ids.
struct ExecNode {
    name: String,
    op: OpImpl,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

type StageNodes = Arc<Mutex<Vec<ExecNode>>>;

/// Lifecycle of one iteration. Transitions are driven by stage
/// completion; `Failed` short-circuits all remaining stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IterationState {
    Scheduled,
    CpuDone,
    MixedDone,
    GpuDone,
    Failed,
}

/// Per-iteration bookkeeping travelling through the stage queues.
struct IterationContext {
    iteration: u64,
    batch_size: usize,
    state: IterationState,
    result: Result<()>,
    /// Intermediate tensor lists, indexed by edge id.
    tensors: Vec<Option<TensorList>>,
    /// Operator traces keyed by operator name.
    traces: HashMap<String, HashMap<String, String>>,
    mixed_event: EventLease,
    gpu_event: EventLease,
}

impl IterationContext {
    fn new(iteration: u64, num_edges: usize, batch_size: usize) -> Self {
        Self {
            iteration,
            batch_size,
            state: IterationState::Scheduled,
            result: Ok(()),
            tensors: (0..num_edges).map(|_| None).collect(),
            traces: HashMap::new(),
            mixed_event: EventLease::default(),
            gpu_event: EventLease::default(),
        }
    }

    fn advance_state(&mut self, next: IterationState) {
        self.state = if self.result.is_ok() {
            next
        } else {
            IterationState::Failed
        };
        log::trace!("iteration {} -> {:?}", self.iteration, self.state);
    }
}

/// Keeps execution errors distinguishable: cancellation and missing data
/// pass through, everything else is tagged with operator and iteration.
fn tag_error(err: TdpError, op: &str, iteration: u64) -> TdpError {
    match err {
        TdpError::Cancelled | TdpError::NoData(_) => err,
        other => other.into_operator_failure(op, iteration),
    }
}

/// State shared by the stage drivers (inline or threaded).
struct StageShared {
    services: Arc<SharedServices>,
    max_batch_size: usize,
    input_ops: Vec<Arc<InputOperator>>,
}

fn run_node(
    shared: &StageShared,
    node: &mut ExecNode,
    ctx: &mut IterationContext,
    order: AccessOrder,
) -> Result<()> {
    let mut ws = Workspace::new(
        ctx.iteration,
        ctx.batch_size,
        order,
        Some(Arc::clone(&shared.services.thread_pool)),
        shared.services.memory.clone(),
    );
    for &edge in &node.inputs {
        let produced = ctx.tensors[edge].as_ref().ok_or_else(|| {
            TdpError::GraphInvalid(format!(
                "operator '{}' scheduled before its input was produced",
                node.name
            ))
        })?;
        let mut view = TensorList::default();
        view.share_data(produced);
        ws.add_input(view);
    }
    ws.set_output_count(node.outputs.len());
    // Scratch memory lives exactly as long as this invocation; device
    // frees are issued in the stage order on workspace drop.
    ws.set_scratchpad(Scratchpad::new(shared.services.memory.clone(), order));

    match &mut node.op {
        OpImpl::Input(op) => op.run_consume(&mut ws)?,
        OpImpl::Regular(op) => {
            op.setup(&mut ws)?;
            op.run(&mut ws)?;
        }
    }

    for (slot, &edge) in node.outputs.iter().enumerate() {
        ctx.tensors[edge] = Some(ws.take_output(slot)?);
    }
    let traces = ws.take_traces();
    if !traces.is_empty() {
        ctx.traces.insert(node.name.clone(), traces);
    }
    Ok(())
}

fn run_stage_nodes(
    shared: &StageShared,
    nodes: &StageNodes,
    ctx: &mut IterationContext,
    order: AccessOrder,
) {
    if ctx.result.is_err() {
        return;
    }
    let mut nodes = nodes.lock().unwrap();
    for node in nodes.iter_mut() {
        if let Err(e) = run_node(shared, node, ctx, order) {
            ctx.result = Err(tag_error(e, &node.name, ctx.iteration));
            break;
        }
    }
}

/// Resolves this iteration's batch size through the input operators'
/// prophet cursors, then commits them.
fn resolve_batch_size(shared: &StageShared, ctx: &mut IterationContext) {
    if ctx.result.is_err() || shared.input_ops.is_empty() {
        return;
    }
    let resolve = || -> Result<usize> {
        let mut batch_size = None;
        for op in &shared.input_ops {
            let n = op.next_batch_size()?;
            match batch_size {
                None => batch_size = Some(n),
                Some(prev) if prev != n => {
                    return Err(TdpError::InvalidArgument(format!(
                        "input operators disagree on the batch size ({} vs {})",
                        prev, n
                    )));
                }
                Some(_) => {}
            }
        }
        let batch_size = batch_size.unwrap();
        if batch_size > shared.max_batch_size {
            return Err(TdpError::InvalidArgument(format!(
                "fed batch of {} samples exceeds max_batch_size {}",
                batch_size, shared.max_batch_size
            )));
        }
        for op in &shared.input_ops {
            op.advance()?;
        }
        Ok(batch_size)
    };
    match resolve() {
        Ok(n) => ctx.batch_size = n,
        Err(e) => ctx.result = Err(tag_error(e, "ExternalSource", ctx.iteration)),
    }
}

fn process_cpu_stage(shared: &StageShared, nodes: &StageNodes, mut ctx: IterationContext) -> IterationContext {
    crate::profile_scope!("Executor::RunCpu");
    resolve_batch_size(shared, &mut ctx);
    run_stage_nodes(shared, nodes, &mut ctx, AccessOrder::host());
    ctx.advance_state(IterationState::CpuDone);
    ctx
}

fn process_mixed_stage(
    shared: &StageShared,
    nodes: &StageNodes,
    order: Option<AccessOrder>,
    mut ctx: IterationContext,
) -> IterationContext {
    crate::profile_scope!("Executor::RunMixed");
    if nodes.lock().unwrap().is_empty() {
        ctx.advance_state(IterationState::MixedDone);
        return ctx;
    }
    let order = order.unwrap_or(AccessOrder::Host);
    run_stage_nodes(shared, nodes, &mut ctx, order);
    // Publish this stage's work to the GPU stage via an event on the
    // mixed stream.
    if ctx.result.is_ok()
        && let AccessOrder::Device { device_id, .. } = order
    {
        let recorded = ctx
            .mixed_event
            .get(&shared.services.event_pool, device_id)
            .and_then(|event| crate::gpu::record_event(event, order));
        if let Err(e) = recorded {
            ctx.result = Err(tag_error(e, "mixed-stage hand-off", ctx.iteration));
        }
    }
    ctx.advance_state(IterationState::MixedDone);
    ctx
}

fn process_gpu_stage(
    shared: &StageShared,
    nodes: &StageNodes,
    order: Option<AccessOrder>,
    mut ctx: IterationContext,
) -> IterationContext {
    crate::profile_scope!("Executor::RunGpu");
    let has_nodes = !nodes.lock().unwrap().is_empty();
    if !has_nodes {
        ctx.advance_state(IterationState::GpuDone);
        return ctx;
    }
    let order = order.unwrap_or(AccessOrder::Host);
    // Inputs produced by the mixed stage become visible through a stream
    // wait; no host sync on the hot path.
    if ctx.result.is_ok()
        && let Some(event) = ctx.mixed_event.handle()
        && let Err(e) = observe_event(order, event)
    {
        ctx.result = Err(tag_error(e, "gpu-stage hand-off", ctx.iteration));
    }
    run_stage_nodes(shared, nodes, &mut ctx, order);
    if ctx.result.is_ok()
        && let AccessOrder::Device { device_id, .. } = order
    {
        let recorded = ctx
            .gpu_event
            .get(&shared.services.event_pool, device_id)
            .and_then(|event| crate::gpu::record_event(event, order));
        if let Err(e) = recorded {
            ctx.result = Err(tag_error(e, "gpu-stage completion", ctx.iteration));
        }
    }
    ctx.advance_state(IterationState::GpuDone);
    ctx
}

pub(crate) struct Executor {
    services: Arc<SharedServices>,
    shared: Arc<StageShared>,
    params: PipelineParams,
    num_edges: usize,
    pipeline_outputs: Vec<usize>,
    cpu_nodes: StageNodes,
    mixed_nodes: StageNodes,
    gpu_nodes: StageNodes,
    mixed_order: Option<AccessOrder>,
    gpu_order: Option<AccessOrder>,
    // Leases keep the stage streams alive for the executor's lifetime.
    _mixed_stream: Option<StreamLease>,
    _gpu_stream: Option<StreamLease>,
    /// Schedule side of the stage chain (async mode only).
    cpu_tx: Option<Sender<IterationContext>>,
    /// Completion side used by inline execution (sync mode only).
    out_tx: Option<Sender<IterationContext>>,
    out_rx: Receiver<IterationContext>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    next_iteration: AtomicU64,
    in_flight: Arc<AtomicUsize>,
}

impl Executor {
    pub(crate) fn new(
        graph: BuiltGraph,
        services: Arc<SharedServices>,
        params: PipelineParams,
    ) -> Result<(Self, HashMap<String, Arc<InputOperator>>)> {
        let mut cpu = Vec::new();
        let mut mixed = Vec::new();
        let mut gpu = Vec::new();
        let mut input_ops = Vec::new();
        let mut inputs_by_name = HashMap::new();

        for node in &graph.nodes {
            let op = instantiate(&node.spec, &services)?;
            if let OpImpl::Input(input) = &op {
                input_ops.push(Arc::clone(input));
                inputs_by_name.insert(input.name().to_string(), Arc::clone(input));
            }
            let exec_node = ExecNode {
                name: node.spec.name().to_string(),
                op,
                inputs: node.inputs.clone(),
                outputs: node.outputs.clone(),
            };
            match node.spec.backend() {
                OpBackend::Cpu => cpu.push(exec_node),
                OpBackend::Mixed => mixed.push(exec_node),
                OpBackend::Gpu => gpu.push(exec_node),
            }
        }

        let needs_device = !mixed.is_empty() || !gpu.is_empty();
        let (mixed_stream, gpu_stream) = if needs_device {
            services.require_device()?;
            let device_id = services.device_id();
            (
                Some(services.stream_pool.lease(device_id)?),
                Some(services.stream_pool.lease(device_id)?),
            )
        } else {
            (None, None)
        };
        let mixed_order = mixed_stream.as_ref().map(StreamLease::order);
        let gpu_order = gpu_stream.as_ref().map(StreamLease::order);

        let shared = Arc::new(StageShared {
            services: Arc::clone(&services),
            max_batch_size: params.max_batch_size,
            input_ops,
        });

        let cpu_nodes: StageNodes = Arc::new(Mutex::new(cpu));
        let mixed_nodes: StageNodes = Arc::new(Mutex::new(mixed));
        let gpu_nodes: StageNodes = Arc::new(Mutex::new(gpu));

        let depth = params.queue_depth();
        let (out_tx, out_rx) = bounded::<IterationContext>(depth);
        let running = Arc::new(AtomicBool::new(true));
        let mut threads = Vec::new();

        let cpu_tx = if params.async_execution {
            let (cpu_tx, cpu_rx) = bounded::<IterationContext>(depth);
            let (mixed_tx, mixed_rx) = bounded::<IterationContext>(depth);
            let (gpu_tx, gpu_rx) = bounded::<IterationContext>(depth);

            {
                let shared = Arc::clone(&shared);
                let nodes = Arc::clone(&cpu_nodes);
                threads.push(spawn_stage("tdp-executor-cpu", move || {
                    while let Ok(ctx) = cpu_rx.recv() {
                        let ctx = process_cpu_stage(&shared, &nodes, ctx);
                        if mixed_tx.send(ctx).is_err() {
                            break;
                        }
                    }
                }));
            }
            {
                let shared = Arc::clone(&shared);
                let nodes = Arc::clone(&mixed_nodes);
                threads.push(spawn_stage("tdp-executor-mixed", move || {
                    while let Ok(ctx) = mixed_rx.recv() {
                        let ctx = process_mixed_stage(&shared, &nodes, mixed_order, ctx);
                        if gpu_tx.send(ctx).is_err() {
                            break;
                        }
                    }
                }));
            }
            {
                let shared = Arc::clone(&shared);
                let nodes = Arc::clone(&gpu_nodes);
                let out_tx = out_tx.clone();
                threads.push(spawn_stage("tdp-executor-gpu", move || {
                    while let Ok(ctx) = gpu_rx.recv() {
                        let ctx = process_gpu_stage(&shared, &nodes, gpu_order, ctx);
                        if out_tx.send(ctx).is_err() {
                            break;
                        }
                    }
                }));
            }
            Some(cpu_tx)
        } else {
            None
        };

        // In async mode the gpu thread owns the completion side; keeping a
        // second sender would hold the channel open past shutdown.
        let out_tx = if params.async_execution {
            None
        } else {
            Some(out_tx)
        };

        let executor = Self {
            services,
            shared,
            params,
            num_edges: graph.edges.len(),
            pipeline_outputs: graph.pipeline_outputs,
            cpu_nodes,
            mixed_nodes,
            gpu_nodes,
            mixed_order,
            gpu_order,
            _mixed_stream: mixed_stream,
            _gpu_stream: gpu_stream,
            cpu_tx,
            out_tx,
            out_rx,
            threads: Mutex::new(threads),
            running,
            next_iteration: AtomicU64::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        };
        Ok((executor, inputs_by_name))
    }

    /// Schedules one iteration. Blocks only when `prefetch_depth`
    /// iterations are already in flight in the first stage.
    pub(crate) fn run(&self) -> Result<()> {
        crate::profile_scope!("Executor::Run");
        if !self.running.load(Ordering::Acquire) {
            return Err(TdpError::Cancelled);
        }
        let iteration = self.next_iteration.fetch_add(1, Ordering::SeqCst);
        let ctx = IterationContext::new(iteration, self.num_edges, self.params.max_batch_size);
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        match &self.cpu_tx {
            Some(tx) => tx.send(ctx).map_err(|_| TdpError::Cancelled),
            None => {
                let ctx = process_cpu_stage(&self.shared, &self.cpu_nodes, ctx);
                let ctx = process_mixed_stage(&self.shared, &self.mixed_nodes, self.mixed_order, ctx);
                let ctx = process_gpu_stage(&self.shared, &self.gpu_nodes, self.gpu_order, ctx);
                self.out_tx
                    .as_ref()
                    .expect("inline executor keeps the completion sender")
                    .send(ctx)
                    .map_err(|_| TdpError::Cancelled)
            }
        }
    }

    /// Retrieves the next completed iteration in FIFO order, blocking
    /// until it reaches `GpuDone` (or failed). Completion events are
    /// observed host-side before any handle is surfaced.
    pub(crate) fn outputs(&self) -> Result<Workspace> {
        crate::profile_scope!("Executor::Outputs");
        let mut ctx = loop {
            match self.out_rx.recv_timeout(std::time::Duration::from_millis(50)) {
                Ok(ctx) => break ctx,
                Err(RecvTimeoutError::Timeout) => {
                    if !self.running.load(Ordering::Acquire) {
                        return Err(TdpError::Cancelled);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(TdpError::Cancelled),
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(
            matches!(ctx.state, IterationState::GpuDone | IterationState::Failed),
            "iteration surfaced before its last stage completed"
        );

        let sync_events = |ctx: &mut IterationContext| -> Result<()> {
            if let Some(event) = ctx.gpu_event.handle() {
                observe_event(AccessOrder::host(), event)?;
            }
            if let Some(event) = ctx.mixed_event.handle() {
                observe_event(AccessOrder::host(), event)?;
            }
            ctx.gpu_event.put();
            ctx.mixed_event.put();
            Ok(())
        };

        if let Err(err) = std::mem::replace(&mut ctx.result, Ok(())) {
            let _ = sync_events(&mut ctx);
            return Err(err);
        }
        sync_events(&mut ctx)?;

        let mut ws = Workspace::new(
            ctx.iteration,
            ctx.batch_size,
            AccessOrder::host(),
            None,
            self.services.memory.clone(),
        );
        ws.set_output_count(self.pipeline_outputs.len());
        for (slot, &edge) in self.pipeline_outputs.iter().enumerate() {
            let tensors = ctx.tensors[edge].take().ok_or_else(|| {
                TdpError::GraphInvalid(format!(
                    "iteration {} completed without producing output {}",
                    ctx.iteration, slot
                ))
            })?;
            ws.set_output(slot, tensors)?;
        }
        for (op, traces) in ctx.traces.drain() {
            for (key, value) in traces {
                ws.set_trace(&format!("{}.{}", op, key), &value);
            }
        }
        log::trace!("iteration {} released", ctx.iteration);
        Ok(ws)
    }

    /// Iterations scheduled but not yet surfaced.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn iterations_scheduled(&self) -> u64 {
        self.next_iteration.load(Ordering::SeqCst)
    }

    pub(crate) fn restore_iteration_counter(&self, value: u64) {
        self.next_iteration.store(value, Ordering::SeqCst);
    }

    /// Cancels blocked producers and consumers without tearing the
    /// executor down: scheduling stops, pending waits return
    /// [`TdpError::Cancelled`].
    pub(crate) fn break_waiting(&self) {
        self.running.store(false, Ordering::Release);
        for op in &self.shared.input_ops {
            op.break_waiting();
        }
    }

    /// Stops scheduling, cancels blocked waiters and joins the stage
    /// threads. Streamed device work is not cancelled; it drains.
    pub(crate) fn shutdown(&mut self) {
        self.break_waiting();
        self.cpu_tx.take();
        self.out_tx.take();
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            // Keep draining completed iterations so no stage blocks on a
            // full hand-off queue while we wait for it.
            while !handle.is_finished() {
                let _ = self.out_rx.try_recv();
                thread::sleep(std::time::Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        log::debug!("executor shut down");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_stage(name: &str, body: impl FnOnce() + Send + 'static) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("spawn executor stage thread")
}
