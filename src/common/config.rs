// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use crate::pronghorn_config::config as pronghorn_app_config;

pub(crate) fn exec_rpc_threads() -> usize {
    pronghorn_app_config()
        .ok()
        .map(|c| c.runtime.actual_exec_rpc_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn fs_op_threads() -> usize {
    pronghorn_app_config()
        .ok()
        .map(|c| c.runtime.actual_fs_op_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn rpc_connect_timeout_ms() -> u64 {
    pronghorn_app_config()
        .ok()
        .map(|c| c.runtime.rpc_connect_timeout_ms)
        .unwrap_or(10_000)
}

pub(crate) fn rpc_timeout_ms() -> u64 {
    pronghorn_app_config()
        .ok()
        .map(|c| c.runtime.rpc_timeout_ms)
        .unwrap_or(600_000)
}

pub(crate) fn progress_log_period_percent() -> i64 {
    pronghorn_app_config()
        .ok()
        .map(|c| c.runtime.progress_log_period_percent)
        .unwrap_or(10)
}
