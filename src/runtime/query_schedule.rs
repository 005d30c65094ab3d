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
//! Scheduler output contract: a fully scheduled plan, ready for dispatch.
//! The plan fragments themselves are opaque blobs; only the placement and
//! scan-range structure the coordinator needs is materialized.

use std::collections::HashMap;

use crate::common::types::{NetworkAddress, UniqueId};
use crate::service::pb;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StmtType {
    Query,
    Dml,
    Ddl,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PartitionType {
    Unpartitioned,
    HashPartitioned,
    RandomPartitioned,
    RangePartitioned,
}

/// One compiled sub-plan. `fragment` is the opaque wire form forwarded to
/// workers unmodified.
#[derive(Clone, Debug)]
pub struct PlanFragment {
    pub fragment: Vec<u8>,
    pub partition: PartitionType,
    pub output_exprs: Vec<Vec<u8>>,
    /// Plan node ids of this fragment's scan nodes, used for query-wide
    /// derived counters.
    pub scan_node_ids: Vec<i32>,
}

/// Host placement and per-host scan assignment for one fragment.
#[derive(Clone, Debug, Default)]
pub struct FragmentExecParams {
    pub hosts: Vec<NetworkAddress>,
    pub instance_ids: Vec<UniqueId>,
    pub scan_range_assignment: HashMap<NetworkAddress, HashMap<i32, pb::PScanRanges>>,
    pub per_exch_num_senders: HashMap<i32, i32>,
    pub destinations: Vec<pb::PPlanFragmentDestination>,
}

/// Resources reserved for the query by an external resource manager.
#[derive(Clone, Debug, Default)]
pub struct ResourceReservation {
    /// Opaque per-resource-host allocation blobs.
    pub allocated_resources: HashMap<NetworkAddress, Vec<u8>>,
    /// Execution host -> resource-manager host the allocation lives on.
    pub resource_hostports: HashMap<NetworkAddress, NetworkAddress>,
}

/// Filesystem commit parameters for INSERT targets.
#[derive(Clone, Debug)]
pub struct FinalizeParams {
    pub base_dir: String,
    pub staging_dir: String,
    pub is_overwrite: bool,
}

#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    pub debug_action: Option<String>,
    pub request_pool: Option<String>,
    pub mem_limit: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct QuerySchedule {
    pub query_id: UniqueId,
    pub stmt_type: StmtType,
    /// Fragments in left-to-right plan order; index 0 is the root.
    pub fragments: Vec<PlanFragment>,
    /// Parallel to `fragments`.
    pub exec_params: Vec<FragmentExecParams>,
    pub query_options: QueryOptions,
    /// Opaque query context blob forwarded to every instance.
    pub query_ctx: Vec<u8>,
    /// Opaque descriptor-table blob forwarded to every instance.
    pub desc_tbl: Vec<u8>,
    pub finalize_params: Option<FinalizeParams>,
    pub reservation: Option<ResourceReservation>,
    pub num_scan_ranges: i64,
}

impl QuerySchedule {
    /// The root fragment runs inside the coordinator iff it is unpartitioned.
    pub fn has_coordinator_fragment(&self) -> bool {
        self.fragments
            .first()
            .map(|f| f.partition == PartitionType::Unpartitioned)
            .unwrap_or(false)
    }

    /// Number of remote fragment instances. The coordinator fragment is not
    /// counted and does not get a backend number.
    pub fn num_backends(&self) -> usize {
        let skip = if self.has_coordinator_fragment() { 1 } else { 0 };
        self.exec_params
            .iter()
            .skip(skip)
            .map(|p| p.hosts.len())
            .sum()
    }

    pub fn needs_finalization(&self) -> bool {
        self.finalize_params.is_some()
    }

    pub fn resource_hostport(&self, exec_host: &NetworkAddress) -> Option<&NetworkAddress> {
        self.reservation
            .as_ref()
            .and_then(|r| r.resource_hostports.get(exec_host))
    }

    pub fn reserved_resource(&self, resource_host: &NetworkAddress) -> Option<&Vec<u8>> {
        self.reservation
            .as_ref()
            .and_then(|r| r.allocated_resources.get(resource_host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(partition: PartitionType) -> PlanFragment {
        PlanFragment {
            fragment: vec![1, 2, 3],
            partition,
            output_exprs: Vec::new(),
            scan_node_ids: Vec::new(),
        }
    }

    fn params(num_hosts: usize) -> FragmentExecParams {
        let mut p = FragmentExecParams::default();
        for i in 0..num_hosts {
            p.hosts.push(NetworkAddress::new("host", 9000 + i as u16));
            p.instance_ids.push(UniqueId::new(1, i as i64));
        }
        p
    }

    #[test]
    fn coordinator_fragment_not_counted_as_backend() {
        let schedule = QuerySchedule {
            query_id: UniqueId::new(1, 2),
            stmt_type: StmtType::Query,
            fragments: vec![
                fragment(PartitionType::Unpartitioned),
                fragment(PartitionType::HashPartitioned),
            ],
            exec_params: vec![params(1), params(3)],
            query_options: QueryOptions::default(),
            query_ctx: Vec::new(),
            desc_tbl: Vec::new(),
            finalize_params: None,
            reservation: None,
            num_scan_ranges: 0,
        };
        assert!(schedule.has_coordinator_fragment());
        assert_eq!(schedule.num_backends(), 3);
    }

    #[test]
    fn partitioned_root_counts_all_instances() {
        let schedule = QuerySchedule {
            query_id: UniqueId::new(1, 2),
            stmt_type: StmtType::Dml,
            fragments: vec![
                fragment(PartitionType::RandomPartitioned),
                fragment(PartitionType::HashPartitioned),
            ],
            exec_params: vec![params(2), params(3)],
            query_options: QueryOptions::default(),
            query_ctx: Vec::new(),
            desc_tbl: Vec::new(),
            finalize_params: None,
            reservation: None,
            num_scan_ranges: 0,
        };
        assert!(!schedule.has_coordinator_fragment());
        assert_eq!(schedule.num_backends(), 5);
    }
}
