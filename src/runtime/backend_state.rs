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
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::common::status::Status;
use crate::common::types::{NetworkAddress, UniqueId};
use crate::common::util::MonotonicStopwatch;
use crate::runtime::profile::{CounterRef, RuntimeProfile};
use crate::service::pb;

/// Counter names published by scan nodes in instance profiles.
pub const TOTAL_THROUGHPUT_COUNTER: &str = "TotalReadThroughput";
pub const SCAN_RANGES_COMPLETE_COUNTER: &str = "ScanRangesComplete";

/// Scan-node counters of one instance profile, memoized by plan node id so
/// query-wide aggregates need not rescan the profile tree per read.
#[derive(Debug, Default)]
pub struct FragmentInstanceCounters {
    pub throughput_counters: HashMap<i32, CounterRef>,
    pub scan_ranges_complete_counters: HashMap<i32, CounterRef>,
}

/// Execution state of one remote fragment instance.
///
/// Lock ordering: the coordinator's global lock may only be obtained *prior*
/// to this state's lock, never the other way around.
#[derive(Debug)]
pub struct BackendExecState {
    pub fragment_instance_id: UniqueId,
    pub backend_address: NetworkAddress,
    pub backend_num: usize,
    pub fragment_idx: usize,
    /// Assembled once at construction, reused verbatim for the retry path.
    pub rpc_params: pb::PExecPlanFragmentParams,
    /// Sum of scan-range byte lengths assigned to this instance.
    pub total_split_size: i64,
    /// Wall clock for this instance, started when the exec RPC is accepted.
    pub stopwatch: MonotonicStopwatch,
    /// Cumulative profile; internally synchronized, but mutated only while
    /// the state lock is held.
    pub profile: RuntimeProfile,
    lock: Mutex<BackendExecStateInner>,
}

#[derive(Debug)]
pub struct BackendExecStateInner {
    /// Non-OK when execution was aborted by the remote backend or
    /// cancellation was initiated; never reset to OK afterwards.
    pub status: Status,
    /// True once the ExecPlanFragment RPC returned OK.
    pub initiated: bool,
    /// True once execution terminated; such instances are never cancelled.
    pub done: bool,
    /// True after the first profile update was applied.
    pub profile_created: bool,
    pub error_log: Vec<String>,
    pub total_ranges_complete: i64,
    pub aggregate_counters: FragmentInstanceCounters,
}

impl BackendExecStateInner {
    /// Total scan ranges completed across all scan nodes, returned as the
    /// delta since the previous call. Never negative: the underlying
    /// counters are cumulative.
    pub fn update_num_scan_ranges_completed(&mut self) -> i64 {
        let total: i64 = self
            .aggregate_counters
            .scan_ranges_complete_counters
            .values()
            .map(|c| c.value())
            .fold(0i64, |acc, v| acc.saturating_add(v));
        let delta = total - self.total_ranges_complete;
        debug_assert!(delta >= 0);
        self.total_ranges_complete = total;
        delta
    }
}

impl BackendExecState {
    pub fn new(
        backend_num: usize,
        fragment_idx: usize,
        fragment_instance_id: UniqueId,
        backend_address: NetworkAddress,
        rpc_params: pb::PExecPlanFragmentParams,
    ) -> Self {
        let total_split_size = compute_total_split_size(&rpc_params);
        let profile = RuntimeProfile::new(format!(
            "Instance {fragment_instance_id} (host={backend_address})"
        ));
        Self {
            fragment_instance_id,
            backend_address,
            backend_num,
            fragment_idx,
            rpc_params,
            total_split_size,
            stopwatch: MonotonicStopwatch::new(),
            profile,
            lock: Mutex::new(BackendExecStateInner {
                status: Status::ok(),
                initiated: false,
                done: false,
                profile_created: false,
                error_log: Vec::new(),
                total_ranges_complete: 0,
                aggregate_counters: FragmentInstanceCounters::default(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, BackendExecStateInner> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Throughput counter value for a plan node, 0 when that node does not
    /// exist in this instance. The counter handle is snapshotted under the
    /// state lock but read outside it.
    pub fn node_throughput(&self, plan_node_id: i32) -> i64 {
        let counter = {
            let inner = self.lock();
            inner
                .aggregate_counters
                .throughput_counters
                .get(&plan_node_id)
                .cloned()
        };
        counter.map(|c| c.value()).unwrap_or(0)
    }

    /// Completed scan ranges for a plan node, 0 when that node does not
    /// exist in this instance.
    pub fn num_scan_ranges_completed(&self, plan_node_id: i32) -> i64 {
        let counter = {
            let inner = self.lock();
            inner
                .aggregate_counters
                .scan_ranges_complete_counters
                .get(&plan_node_id)
                .cloned()
        };
        counter.map(|c| c.value()).unwrap_or(0)
    }
}

fn compute_total_split_size(rpc_params: &pb::PExecPlanFragmentParams) -> i64 {
    let Some(params) = rpc_params.params.as_ref() else {
        return 0;
    };
    let mut total = 0i64;
    for ranges in params.per_node_scan_ranges.values() {
        for range_params in &ranges.scan_ranges {
            if let Some(range) = range_params.scan_range.as_ref() {
                total = total.saturating_add(range.length);
            }
        }
    }
    total
}

/// Memoize scan-node counters from an instance or coordinator profile.
/// Scan-node profiles carry their plan node id in the profile metadata.
pub fn collect_scan_node_counters(
    profile: &RuntimeProfile,
    counters: &mut FragmentInstanceCounters,
) {
    for child in profile.all_children() {
        let node_id = child.metadata();
        if node_id < 0 {
            continue;
        }
        let node_id = node_id as i32;
        if let Some(c) = child.get_counter(TOTAL_THROUGHPUT_COUNTER) {
            counters.throughput_counters.insert(node_id, c);
        }
        if let Some(c) = child.get_counter(SCAN_RANGES_COMPLETE_COUNTER) {
            counters.scan_ranges_complete_counters.insert(node_id, c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::profile::CounterUnit;

    fn scan_range(length: i64) -> pb::PScanRangeParams {
        pb::PScanRangeParams {
            scan_range: Some(pb::PScanRange {
                path: "/data/part-0".to_string(),
                offset: 0,
                length,
            }),
            volume_id: 0,
        }
    }

    fn exec_params_with_ranges(lengths: &[i64]) -> pb::PExecPlanFragmentParams {
        let mut per_node_scan_ranges = std::collections::HashMap::new();
        per_node_scan_ranges.insert(
            0,
            pb::PScanRanges {
                scan_ranges: lengths.iter().map(|l| scan_range(*l)).collect(),
            },
        );
        pb::PExecPlanFragmentParams {
            params: Some(pb::PPlanFragmentExecParams {
                per_node_scan_ranges,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn state(lengths: &[i64]) -> BackendExecState {
        BackendExecState::new(
            0,
            0,
            UniqueId::new(1, 1),
            NetworkAddress::new("host-a", 9070),
            exec_params_with_ranges(lengths),
        )
    }

    #[test]
    fn total_split_size_sums_scan_range_lengths() {
        let state = state(&[100, 200, 50]);
        assert_eq!(state.total_split_size, 350);
    }

    #[test]
    fn scan_range_progress_delta_is_monotonic() {
        let state = state(&[]);
        let ranges = state
            .profile
            .child("SCAN (id=3)")
            .add_counter(SCAN_RANGES_COMPLETE_COUNTER, CounterUnit::Unit);
        state.profile.get_child("SCAN (id=3)").unwrap().set_metadata(3);

        let mut inner = state.lock();
        collect_scan_node_counters(&state.profile, &mut inner.aggregate_counters);

        ranges.set(4);
        assert_eq!(inner.update_num_scan_ranges_completed(), 4);
        ranges.set(9);
        assert_eq!(inner.update_num_scan_ranges_completed(), 5);
        assert_eq!(inner.update_num_scan_ranges_completed(), 0);
    }

    #[test]
    fn node_counter_reads_miss_to_zero() {
        let state = state(&[]);
        assert_eq!(state.node_throughput(42), 0);
        assert_eq!(state.num_scan_ranges_completed(42), 0);
    }
}
