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

//! Lightweight scope profiling. Scopes report at `trace` level so the
//! instrumentation is free unless explicitly enabled.

/// Guard that logs the elapsed wall-clock time of a scope on drop.
pub struct ScopeTimer {
    label: &'static str,
    start: std::time::Instant,
}

impl ScopeTimer {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for ScopeTimer {
    fn drop(&mut self) {
        log::trace!("{}: {:.3?}", self.label, self.start.elapsed());
    }
}

/// Times the enclosing scope under the given label.
///
/// ```ignore
/// crate::profile_scope!("Executor::RunCpu");
/// ```
#[macro_export]
macro_rules! profile_scope {
    ($label:expr) => {
        let _scope_timer = if log::log_enabled!(log::Level::Trace) {
            Some($crate::profiling::ScopeTimer::new($label))
        } else {
            None
        };
    };
}
