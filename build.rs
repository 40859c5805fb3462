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

use std::path::Path;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // The raw runtime-API declarations in src/gpu/cuda_ffi.rs need libcudart.
    if std::env::var_os("CARGO_FEATURE_CUDA").is_some() {
        let candidates = [
            "/usr/local/cuda/lib64",
            "/usr/local/cuda/lib",
            "/opt/cuda/lib64",
            "/usr/lib/x86_64-linux-gnu",
        ];
        for dir in candidates {
            if Path::new(dir).exists() {
                println!("cargo:rustc-link-search=native={}", dir);
            }
        }
        println!("cargo:rustc-link-lib=dylib=cudart");
    }
}
