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

//! Named worker thread fed through a channel; drains and joins on drop.

use std::thread;

use crate::error::{Result, TdpError};

type Task = Box<dyn FnOnce() + Send>;

pub(crate) struct WorkerThread {
    tx: Option<crossbeam_channel::Sender<Task>>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerThread {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })
            .expect("spawn worker thread");
        Self {
            tx: Some(tx),
            join: Some(join),
        }
    }

    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| TdpError::Cancelled)?;
        tx.send(Box::new(task))
            .map_err(|_| TdpError::Cancelled)
    }

    /// Closes the queue and joins after all pending tasks ran.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tasks_run_in_submission_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut worker = WorkerThread::new("tdp-test-worker");
        for i in 0..8 {
            let counter = Arc::clone(&counter);
            worker
                .submit(move || {
                    // Each task observes all earlier tasks done.
                    assert_eq!(counter.swap(i + 1, Ordering::SeqCst), i);
                })
                .unwrap();
        }
        worker.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn submit_after_shutdown_is_cancelled() {
        let mut worker = WorkerThread::new("tdp-test-worker");
        worker.shutdown();
        assert!(worker.submit(|| {}).is_err());
    }
}
