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

//! End-to-end pipeline scenarios.

use std::sync::Arc;
use std::time::Duration;

use tdp_core::{
    AccessOrder, CopyMode, InputSettingMode, OpSpec, Pipeline, PipelineParams, StorageDevice,
    TdpError, TensorList, TensorShape,
};

fn identity_pipeline(params: PipelineParams, blocking: bool, no_copy: bool) -> Pipeline {
    let mut pipe = Pipeline::new(params).unwrap();
    pipe.add_operator(
        OpSpec::new("ExternalSource")
            .with_name("x")
            .arg("name", "x")
            .arg("blocking", blocking)
            .arg("no_copy", no_copy)
            .output("x", StorageDevice::Cpu),
    )
    .unwrap();
    pipe.add_operator(
        OpSpec::new("Passthrough")
            .with_name("id")
            .input("x", StorageDevice::Cpu)
            .output("out", StorageDevice::Cpu),
    )
    .unwrap();
    pipe.build(&[("out", StorageDevice::Cpu)]).unwrap();
    pipe
}

fn int_batch(pipe: &Pipeline, values: &[i32]) -> TensorList {
    let samples = values.len() / 4;
    TensorList::from_host_data(
        vec![TensorShape::new(vec![2, 2]); samples],
        values,
        false,
        &pipe.services().memory,
    )
    .unwrap()
}

/// Identity CPU pipeline: three fed batches come back in order,
/// byte-identical.
#[test]
fn identity_cpu_pipeline() {
    let params = PipelineParams {
        max_batch_size: 4,
        num_threads: 2,
        pipelined: false,
        async_execution: false,
        ..Default::default()
    };
    let pipe = identity_pipeline(params, false, false);

    let batches: Vec<Vec<i32>> = (0..3)
        .map(|b| (b * 16..(b + 1) * 16).collect())
        .collect();
    for values in &batches {
        let batch = int_batch(&pipe, values);
        pipe.feed_input("x", &batch, None, InputSettingMode::default(), AccessOrder::host())
            .unwrap();
    }
    assert_eq!(pipe.input_feed_count("x").unwrap(), 3);

    for values in &batches {
        pipe.run().unwrap();
        let ws = pipe.outputs().unwrap();
        assert_eq!(ws.batch_size(), 4);
        let out = ws.output(0).unwrap();
        assert_eq!(out.num_samples(), 4);
        assert_eq!(&out.to_host_vec::<i32>().unwrap(), values);
    }
}

/// Output iteration indices observed by the caller increase strictly by 1,
/// also when the executor runs pipelined and asynchronous.
#[test]
fn outputs_arrive_in_fifo_order() {
    let params = PipelineParams {
        max_batch_size: 4,
        num_threads: 2,
        pipelined: true,
        prefetch_depth: 2,
        async_execution: true,
        ..Default::default()
    };
    let pipe = identity_pipeline(params, false, false);

    for b in 0..6 {
        let values: Vec<i32> = (b * 16..(b + 1) * 16).collect();
        let batch = int_batch(&pipe, &values);
        pipe.feed_input("x", &batch, None, InputSettingMode::default(), AccessOrder::host())
            .unwrap();
    }

    pipe.prefetch().unwrap();
    let mut next_expected = 0u64;
    for b in 0..6 {
        if b >= 2 {
            pipe.run().unwrap();
        }
        assert!(pipe.in_flight() <= 2, "more than P iterations in flight");
        let ws = pipe.outputs().unwrap();
        assert_eq!(ws.iteration(), next_expected);
        next_expected += 1;
        let values: Vec<i32> = (b * 16..(b + 1) * 16).collect();
        assert_eq!(ws.output(0).unwrap().to_host_vec::<i32>().unwrap(), values);
    }
}

/// Zero-copy passthrough: with `no_copy` and a contiguous source the
/// surfaced storage pointer equals the fed pointer.
#[test]
fn zero_copy_passthrough() {
    let params = PipelineParams {
        max_batch_size: 4,
        num_threads: 2,
        pipelined: false,
        async_execution: false,
        ..Default::default()
    };
    let pipe = identity_pipeline(params, false, true);
    let flags = InputSettingMode {
        copy_mode: CopyMode::ForceNoCopy,
        ..Default::default()
    };

    for b in 0..3 {
        let values: Vec<i32> = (b * 16..(b + 1) * 16).collect();
        let batch = int_batch(&pipe, &values);
        let src_ptr = batch.contiguous_raw_ptr().unwrap();
        pipe.feed_input("x", &batch, None, flags, AccessOrder::host())
            .unwrap();
        pipe.run().unwrap();
        let ws = pipe.outputs().unwrap();
        let out = ws.output(0).unwrap();
        assert_eq!(out.contiguous_raw_ptr().unwrap(), src_ptr);
    }
}

/// Copy semantics: with FORCE_COPY (+sync) the pipeline owns its copy;
/// mutating the source after the feed returns must not leak through.
#[test]
fn force_copy_isolates_source_mutation() {
    let params = PipelineParams {
        max_batch_size: 4,
        num_threads: 2,
        pipelined: false,
        async_execution: false,
        ..Default::default()
    };
    let pipe = identity_pipeline(params, false, false);
    let flags = InputSettingMode {
        sync: true,
        copy_mode: CopyMode::ForceCopy,
        ..Default::default()
    };

    let original: Vec<i32> = (0..16).collect();
    let mut batch = int_batch(&pipe, &original);
    pipe.feed_input("x", &batch, None, flags, AccessOrder::host())
        .unwrap();

    // Trash the producer's buffer after the feed returned.
    for sample in 0..batch.num_samples() {
        batch
            .sample_as_mut_slice::<i32>(sample)
            .unwrap()
            .fill(-1);
    }

    pipe.run().unwrap();
    let ws = pipe.outputs().unwrap();
    let out = ws.output(0).unwrap();
    assert_ne!(out.contiguous_raw_ptr(), batch.contiguous_raw_ptr());
    assert_eq!(out.to_host_vec::<i32>().unwrap(), original);
}

/// Backpressure and cancel: a blocking input released by break_waiting
/// yields Cancelled after the already-completed iterations drained.
#[test]
fn blocking_input_cancelled_by_break_waiting() {
    let params = PipelineParams {
        max_batch_size: 4,
        num_threads: 2,
        pipelined: true,
        prefetch_depth: 2,
        async_execution: true,
        ..Default::default()
    };
    let pipe = Arc::new(identity_pipeline(params, true, false));

    for b in 0..2 {
        let values: Vec<i32> = (b * 16..(b + 1) * 16).collect();
        let batch = int_batch(&pipe, &values);
        pipe.feed_input("x", &batch, None, InputSettingMode::default(), AccessOrder::host())
            .unwrap();
    }
    // Two iterations have data; the third blocks inside the CPU stage.
    pipe.prefetch().unwrap();
    pipe.run().unwrap();

    let consumer = {
        let pipe = Arc::clone(&pipe);
        std::thread::spawn(move || {
            let mut results = Vec::new();
            loop {
                match pipe.outputs() {
                    Ok(ws) => results.push(ws.output(0).unwrap().to_host_vec::<i32>().unwrap()),
                    Err(e) => return (results, e),
                }
            }
        })
    };

    std::thread::sleep(Duration::from_millis(100));
    pipe.break_waiting();

    let (results, err) = consumer.join().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], (0..16).collect::<Vec<i32>>());
    assert_eq!(results[1], (16..32).collect::<Vec<i32>>());
    assert!(err.is_cancelled(), "expected Cancelled, got {err}");
}

/// A non-blocking pipeline run without data surfaces NoData from
/// outputs(), and the pipeline stays usable afterwards.
#[test]
fn no_data_error_then_recovery() {
    let params = PipelineParams {
        max_batch_size: 4,
        num_threads: 2,
        pipelined: false,
        async_execution: false,
        ..Default::default()
    };
    let pipe = identity_pipeline(params, false, false);

    pipe.run().unwrap();
    let err = pipe.outputs().unwrap_err();
    assert!(matches!(err, TdpError::NoData(_)), "got {err}");

    let values: Vec<i32> = (0..16).collect();
    let batch = int_batch(&pipe, &values);
    pipe.feed_input("x", &batch, None, InputSettingMode::default(), AccessOrder::host())
        .unwrap();
    pipe.run().unwrap();
    let ws = pipe.outputs().unwrap();
    assert_eq!(ws.output(0).unwrap().to_host_vec::<i32>().unwrap(), values);
}

/// Traces published by the input operator ride along with the iteration.
#[test]
fn depleted_and_data_id_traces() {
    let params = PipelineParams {
        max_batch_size: 4,
        num_threads: 2,
        pipelined: false,
        async_execution: false,
        ..Default::default()
    };
    let pipe = identity_pipeline(params, false, false);

    for b in 0..2 {
        let values: Vec<i32> = (b * 16..(b + 1) * 16).collect();
        let batch = int_batch(&pipe, &values);
        pipe.feed_input(
            "x",
            &batch,
            Some(&format!("batch-{b}")),
            InputSettingMode::default(),
            AccessOrder::host(),
        )
        .unwrap();
    }

    pipe.run().unwrap();
    let ws = pipe.outputs().unwrap();
    assert_eq!(ws.trace("x.data_id"), Some("batch-0"));
    assert_eq!(ws.trace("x.depleted"), Some("false"));

    pipe.run().unwrap();
    let ws = pipe.outputs().unwrap();
    assert_eq!(ws.trace("x.data_id"), Some("batch-1"));
    assert_eq!(ws.trace("x.depleted"), Some("true"));
}

/// Pipelined GPU chain: cpu source → host-to-device copy → add-one on
/// device. Requires a CUDA device; skips when none is present.
#[cfg(feature = "cuda")]
#[test]
fn pipelined_gpu_chain() {
    if tdp_core::gpu::device_count() == 0 {
        return; // no GPU, skip
    }
    let params = PipelineParams {
        max_batch_size: 8,
        num_threads: 2,
        device_id: 0,
        pipelined: true,
        prefetch_depth: 2,
        async_execution: true,
        ..Default::default()
    };
    let mut pipe = Pipeline::new(params).unwrap();
    pipe.add_operator(
        OpSpec::new("ExternalSource")
            .with_name("x")
            .arg("name", "x")
            .output("x", StorageDevice::Cpu),
    )
    .unwrap();
    pipe.add_operator(
        OpSpec::new("CopyToDevice")
            .with_name("h2d")
            .device(tdp_core::OpBackend::Mixed)
            .input("x", StorageDevice::Cpu)
            .output("xg", StorageDevice::Gpu),
    )
    .unwrap();
    pipe.add_operator(
        OpSpec::new("AddScalar")
            .with_name("add1")
            .device(tdp_core::OpBackend::Gpu)
            .arg("value", 1.0f64)
            .input("xg", StorageDevice::Gpu)
            .output("out", StorageDevice::Gpu),
    )
    .unwrap();
    pipe.build(&[("out", StorageDevice::Gpu)]).unwrap();

    for i in 0..5 {
        let values = vec![i as f32; 64];
        let batch = TensorList::from_host_data(
            vec![TensorShape::new(vec![8, 8])],
            &values,
            false,
            &pipe.services().memory,
        )
        .unwrap();
        pipe.feed_input("x", &batch, None, InputSettingMode::default(), AccessOrder::host())
            .unwrap();
    }

    pipe.prefetch().unwrap();
    assert!(pipe.in_flight() <= 2);
    for i in 0..5 {
        if i >= 2 {
            pipe.run().unwrap();
        }
        assert!(pipe.in_flight() <= 2, "more than P iterations in flight");
        let ws = pipe.outputs().unwrap();
        let out = ws.output(0).unwrap();
        assert_eq!(out.to_host_vec::<f32>().unwrap(), vec![i as f32 + 1.0; 64]);
    }
}

/// Device scratch memory written on one stream stays valid until the
/// scratchpad's stream-ordered frees retire. Requires a CUDA device.
#[cfg(feature = "cuda")]
#[test]
fn scratchpad_device_round_trip() {
    use tdp_core::{MemoryKind, Scratchpad};

    if tdp_core::gpu::device_count() == 0 {
        return; // no GPU, skip
    }
    let services = tdp_core::services::SharedServices::new(0, 1).unwrap();
    let stream = services.stream_pool.lease(0).unwrap();
    let order = stream.order();

    let mut pad = Scratchpad::new(services.memory.clone(), order);
    let bytes = 1 << 20;
    let ptr = pad.alloc(MemoryKind::Device, bytes, 256).unwrap();
    assert!(!ptr.is_null());

    // Write a pattern through the device buffer and read it back.
    let pattern: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
    let staging = TensorList::from_host_data(
        vec![TensorShape::new(vec![bytes as i64])],
        &pattern,
        false,
        &services.memory,
    )
    .unwrap();
    let mut device = TensorList::new(StorageDevice::Gpu);
    device.set_device_id(0);
    device
        .copy_from(&staging, order, false, &services.memory)
        .unwrap();
    device.set_order(order);
    assert_eq!(device.to_host_vec::<u8>().unwrap(), pattern);

    // Dropping the pad issues stream-ordered frees; a fresh allocation
    // from the same upstream must be usable immediately after.
    drop(pad);
    let mut second = TensorList::new(StorageDevice::Gpu);
    second.set_device_id(0);
    second
        .copy_from(&staging, order, false, &services.memory)
        .unwrap();
    second.set_order(order);
    assert_eq!(second.to_host_vec::<u8>().unwrap(), pattern);
}
