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
//! Common utilities for coordinator integration tests: scripted backends,
//! a scripted coordinator-fragment executor, and schedule builders.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use pronghorn::common::status::Status;
use pronghorn::common::types::{NetworkAddress, UniqueId};
use pronghorn::fs::bulk::FsExecutor;
use pronghorn::pb;
use pronghorn::runtime::exec_env::ExecEnv;
use pronghorn::runtime::fragment_executor::{
    DmlExecState, FragmentExecutor, OutputExpr, RowBatch,
};
use pronghorn::runtime::profile::{CounterUnit, RuntimeProfile};
use pronghorn::runtime::query_schedule::{
    FinalizeParams, FragmentExecParams, PartitionType, PlanFragment, QueryOptions, QuerySchedule,
    StmtType,
};
use pronghorn::service::backend_client::{BackendClient, BackendClientCache, RpcError};

pub const QUERY_ID: UniqueId = UniqueId { hi: 0x10, lo: 0x20 };

pub fn addr(host: &str) -> NetworkAddress {
    NetworkAddress::new(host, 9070)
}

#[derive(Clone, Debug)]
pub struct ExecCall {
    pub backend: NetworkAddress,
    pub instance_id: UniqueId,
    pub backend_num: i32,
    pub debug_node_id: i32,
    pub debug_phase: i32,
    pub debug_action: i32,
}

/// Shared scripting and recording state behind the mock client cache.
#[derive(Default)]
pub struct MockRpcState {
    pub exec_calls: Mutex<Vec<ExecCall>>,
    pub cancel_calls: Mutex<Vec<(NetworkAddress, UniqueId)>>,
    pub reopen_counts: Mutex<HashMap<NetworkAddress, usize>>,
    /// Worker-returned status per backend address (default OK).
    pub exec_status_overrides: Mutex<HashMap<NetworkAddress, Status>>,
    /// Remaining transport failures per backend address for exec rpcs.
    pub exec_transport_failures: Mutex<HashMap<NetworkAddress, usize>>,
    /// Remaining transport failures per backend address for cancel rpcs.
    pub cancel_transport_failures: Mutex<HashMap<NetworkAddress, usize>>,
    /// Flipped by the mock executor once prepare() finished.
    pub prepare_done: Arc<AtomicBool>,
    /// Set when an exec rpc was observed before prepare() finished.
    pub exec_seen_before_prepare: AtomicBool,
}

impl MockRpcState {
    pub fn num_exec_calls(&self) -> usize {
        self.exec_calls.lock().unwrap().len()
    }

    pub fn cancelled_instances(&self) -> Vec<UniqueId> {
        self.cancel_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn num_cancel_calls(&self) -> usize {
        self.cancel_calls.lock().unwrap().len()
    }

    pub fn fail_exec_status(&self, backend: &NetworkAddress, status: Status) {
        self.exec_status_overrides
            .lock()
            .unwrap()
            .insert(backend.clone(), status);
    }

    pub fn fail_exec_transport(&self, backend: &NetworkAddress, times: usize) {
        self.exec_transport_failures
            .lock()
            .unwrap()
            .insert(backend.clone(), times);
    }

    pub fn fail_cancel_transport(&self, backend: &NetworkAddress, times: usize) {
        self.cancel_transport_failures
            .lock()
            .unwrap()
            .insert(backend.clone(), times);
    }

    pub fn reopen_count(&self, backend: &NetworkAddress) -> usize {
        self.reopen_counts
            .lock()
            .unwrap()
            .get(backend)
            .copied()
            .unwrap_or(0)
    }
}

pub struct MockClientCache {
    state: Arc<MockRpcState>,
}

impl MockClientCache {
    pub fn new(state: Arc<MockRpcState>) -> Self {
        Self { state }
    }
}

impl BackendClientCache for MockClientCache {
    fn get_client(&self, addr: &NetworkAddress) -> Result<Arc<dyn BackendClient>, Status> {
        Ok(Arc::new(MockClient {
            state: Arc::clone(&self.state),
            addr: addr.clone(),
        }))
    }

    fn reopen(&self, addr: &NetworkAddress) -> Result<Arc<dyn BackendClient>, Status> {
        *self
            .state
            .reopen_counts
            .lock()
            .unwrap()
            .entry(addr.clone())
            .or_insert(0) += 1;
        self.get_client(addr)
    }
}

struct MockClient {
    state: Arc<MockRpcState>,
    addr: NetworkAddress,
}

fn take_failure(failures: &Mutex<HashMap<NetworkAddress, usize>>, addr: &NetworkAddress) -> bool {
    let mut guard = failures.lock().unwrap();
    match guard.get_mut(addr) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

impl BackendClient for MockClient {
    fn exec_plan_fragment(
        &self,
        params: &pb::PExecPlanFragmentParams,
    ) -> Result<pb::PExecPlanFragmentResult, RpcError> {
        if !self.state.prepare_done.load(Ordering::Acquire) {
            self.state
                .exec_seen_before_prepare
                .store(true, Ordering::Release);
        }
        let instance_id = params
            .params
            .as_ref()
            .and_then(|p| p.fragment_instance_id.as_ref())
            .map(UniqueId::from_pb)
            .unwrap_or_default();
        let (debug_node_id, debug_phase, debug_action) = params
            .params
            .as_ref()
            .map(|p| (p.debug_node_id, p.debug_phase, p.debug_action))
            .unwrap_or((-1, 0, 0));
        self.state.exec_calls.lock().unwrap().push(ExecCall {
            backend: self.addr.clone(),
            instance_id,
            backend_num: params.backend_num,
            debug_node_id,
            debug_phase,
            debug_action,
        });
        if take_failure(&self.state.exec_transport_failures, &self.addr) {
            return Err(RpcError {
                message: format!("connection reset by peer: {}", self.addr),
            });
        }
        let status = self
            .state
            .exec_status_overrides
            .lock()
            .unwrap()
            .get(&self.addr)
            .cloned()
            .unwrap_or_else(Status::ok);
        Ok(pb::PExecPlanFragmentResult {
            status: Some(status.to_pb()),
        })
    }

    fn cancel_plan_fragment(
        &self,
        params: &pb::PCancelPlanFragmentParams,
    ) -> Result<pb::PCancelPlanFragmentResult, RpcError> {
        let instance_id = params
            .fragment_instance_id
            .as_ref()
            .map(UniqueId::from_pb)
            .unwrap_or_default();
        self.state
            .cancel_calls
            .lock()
            .unwrap()
            .push((self.addr.clone(), instance_id));
        if take_failure(&self.state.cancel_transport_failures, &self.addr) {
            return Err(RpcError {
                message: format!("connection reset by peer: {}", self.addr),
            });
        }
        Ok(pb::PCancelPlanFragmentResult {
            status: Some(Status::ok().to_pb()),
        })
    }
}

/// Scripted coordinator-fragment executor.
#[derive(Default)]
pub struct MockExecutor {
    pub prepare_done: Arc<AtomicBool>,
    pub prepare_error: Mutex<Option<Status>>,
    pub open_error: Mutex<Option<Status>>,
    pub batches: Mutex<VecDeque<Result<Option<RowBatch>, Status>>>,
    pub limit_reached: AtomicBool,
    pub cancelled: AtomicBool,
    pub receiver_streams_cancelled: AtomicBool,
    pub resources_released: AtomicBool,
    pub profile: Mutex<Option<RuntimeProfile>>,
    pub dml: Mutex<DmlExecState>,
}

impl MockExecutor {
    pub fn push_batch(&self, rows: usize) {
        let batch = RowBatch {
            rows: (0..rows).map(|i| vec![i as u8]).collect(),
        };
        self.batches.lock().unwrap().push_back(Ok(Some(batch)));
    }

    pub fn push_eos(&self) {
        self.batches.lock().unwrap().push_back(Ok(None));
    }

    pub fn push_error(&self, status: Status) {
        self.batches.lock().unwrap().push_back(Err(status));
    }
}

impl FragmentExecutor for MockExecutor {
    fn prepare(&self, _rpc_params: &pb::PExecPlanFragmentParams) -> Result<(), Status> {
        if let Some(e) = self.prepare_error.lock().unwrap().clone() {
            return Err(e);
        }
        self.prepare_done.store(true, Ordering::Release);
        Ok(())
    }

    fn prepare_output_exprs(&self, exprs: &[Vec<u8>]) -> Result<Vec<OutputExpr>, Status> {
        Ok(exprs
            .iter()
            .map(|e| OutputExpr { expr: e.clone() })
            .collect())
    }

    fn open(&self) -> Result<(), Status> {
        match self.open_error.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn get_next(&self) -> Result<Option<RowBatch>, Status> {
        self.batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(None))
    }

    fn reached_limit(&self) -> bool {
        self.limit_reached.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn cancel_receiver_streams(&self) {
        self.receiver_streams_cancelled.store(true, Ordering::Release);
    }

    fn release_exec_resources(&self) {
        self.resources_released.store(true, Ordering::Release);
    }

    fn profile(&self) -> RuntimeProfile {
        let mut guard = self.profile.lock().unwrap();
        guard
            .get_or_insert_with(|| RuntimeProfile::new("Coordinator Fragment"))
            .clone()
    }

    fn dml_state(&self) -> DmlExecState {
        self.dml.lock().unwrap().clone()
    }
}

pub struct TestEnv {
    pub temp_dir: TempDir,
    pub rpc: Arc<MockRpcState>,
    pub executor: Arc<MockExecutor>,
    pub exec_env: Arc<ExecEnv>,
}

pub fn test_env() -> TestEnv {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let builder = opendal::services::Fs::default().root(&temp_dir.path().to_string_lossy());
    let op = opendal::Operator::new(builder)
        .expect("init fs operator")
        .finish();
    let fs = Arc::new(FsExecutor::new(op).expect("init fs executor"));

    let rpc = Arc::new(MockRpcState::default());
    // schedules without a coordinator fragment never call prepare()
    rpc.prepare_done.store(true, Ordering::Release);

    let executor = Arc::new(MockExecutor {
        prepare_done: Arc::clone(&rpc.prepare_done),
        ..MockExecutor::default()
    });

    let factory_executor = Arc::clone(&executor);
    let exec_env = Arc::new(ExecEnv::new(
        addr("coordinator"),
        Arc::new(MockClientCache::new(Arc::clone(&rpc))),
        fs,
        Box::new(move || Arc::clone(&factory_executor) as Arc<dyn FragmentExecutor>),
    ));

    TestEnv {
        temp_dir,
        rpc,
        executor,
        exec_env,
    }
}

fn plan_fragment(partition: PartitionType) -> PlanFragment {
    PlanFragment {
        fragment: vec![0xde, 0xad],
        partition,
        output_exprs: vec![vec![0x01]],
        scan_node_ids: vec![0],
    }
}

fn fragment_params(fragment_idx: usize, hosts: &[&str]) -> FragmentExecParams {
    let mut params = FragmentExecParams::default();
    for (i, host) in hosts.iter().enumerate() {
        params.hosts.push(addr(host));
        params
            .instance_ids
            .push(UniqueId::new(fragment_idx as i64 + 1, i as i64 + 1));
    }
    params
}

/// A schedule whose fragments all run remotely.
pub fn remote_schedule(fragment_hosts: &[&[&str]]) -> QuerySchedule {
    QuerySchedule {
        query_id: QUERY_ID,
        stmt_type: StmtType::Query,
        fragments: fragment_hosts
            .iter()
            .map(|_| plan_fragment(PartitionType::HashPartitioned))
            .collect(),
        exec_params: fragment_hosts
            .iter()
            .enumerate()
            .map(|(idx, hosts)| fragment_params(idx, hosts))
            .collect(),
        query_options: QueryOptions::default(),
        query_ctx: vec![0x42],
        desc_tbl: vec![0x17],
        finalize_params: None,
        reservation: None,
        num_scan_ranges: 0,
    }
}

/// Root fragment unpartitioned (run by the coordinator), remaining fragments
/// remote.
pub fn coordinator_schedule(remote_hosts: &[&[&str]]) -> QuerySchedule {
    let mut schedule = remote_schedule(remote_hosts);
    schedule
        .fragments
        .insert(0, plan_fragment(PartitionType::Unpartitioned));
    schedule.exec_params.insert(0, {
        let mut p = fragment_params(0, &["coordinator"]);
        p.instance_ids = vec![UniqueId::new(0, 1)];
        p
    });
    schedule
}

/// The S1 shape: fragment 0 partitioned (one instance), 3 instances of
/// fragment 1 on hosts a, b and c, finalizing into the test warehouse.
pub fn dml_schedule() -> QuerySchedule {
    let mut schedule = remote_schedule(&[&["host-root"], &["host-a", "host-b", "host-c"]]);
    schedule.stmt_type = StmtType::Dml;
    schedule.finalize_params = Some(FinalizeParams {
        base_dir: "warehouse/t1".to_string(),
        staging_dir: "staging".to_string(),
        is_overwrite: false,
    });
    schedule
}

pub fn instance_id(schedule: &QuerySchedule, fragment_idx: usize, instance_idx: usize) -> UniqueId {
    schedule.exec_params[fragment_idx].instance_ids[instance_idx]
}

/// A profile tree with one scan node carrying progress counters.
pub fn profile_with_scan_progress(
    node_id: i32,
    ranges_complete: i64,
    throughput: i64,
    total_time_ns: i64,
) -> pb::PRuntimeProfileTree {
    let root = RuntimeProfile::new("Instance");
    root.counter_set("TotalTime", CounterUnit::TimeNs, total_time_ns);
    let scan = root.child(format!("SCAN_NODE (id={node_id})"));
    scan.set_metadata(i64::from(node_id));
    scan.counter_set("ScanRangesComplete", CounterUnit::Unit, ranges_complete);
    scan.counter_set("TotalReadThroughput", CounterUnit::BytesPerSecond, throughput);
    root.to_pb_tree()
}

pub struct ReportBuilder {
    params: pb::PReportExecStatusParams,
}

impl ReportBuilder {
    pub fn new(backend_num: i32, instance_id: UniqueId) -> Self {
        Self {
            params: pb::PReportExecStatusParams {
                protocol_version: 1,
                query_id: Some(QUERY_ID.to_pb()),
                backend_num,
                fragment_instance_id: Some(instance_id.to_pb()),
                status: Some(Status::ok().to_pb()),
                done: false,
                profile: None,
                error_log: Vec::new(),
                insert_exec_status: None,
            },
        }
    }

    pub fn done(mut self) -> Self {
        self.params.done = true;
        self
    }

    pub fn status(mut self, status: &Status) -> Self {
        self.params.status = Some(status.to_pb());
        self
    }

    pub fn profile(mut self, profile: pb::PRuntimeProfileTree) -> Self {
        self.params.profile = Some(profile);
        self
    }

    pub fn error_log(mut self, lines: &[&str]) -> Self {
        self.params.error_log = lines.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn appended_rows(mut self, partition: &str, rows: i64) -> Self {
        let insert = self
            .params
            .insert_exec_status
            .get_or_insert_with(Default::default);
        *insert
            .num_appended_rows
            .entry(partition.to_string())
            .or_insert(0) += rows;
        self
    }

    pub fn file_to_move(mut self, src: &str, dst: &str) -> Self {
        let insert = self
            .params
            .insert_exec_status
            .get_or_insert_with(Default::default);
        insert
            .files_to_move
            .insert(src.to_string(), dst.to_string());
        self
    }

    pub fn insert_bytes(mut self, partition: &str, bytes: i64) -> Self {
        let insert = self
            .params
            .insert_exec_status
            .get_or_insert_with(Default::default);
        insert.insert_stats.insert(
            partition.to_string(),
            pb::PInsertStats {
                bytes_written: bytes,
            },
        );
        self
    }

    pub fn build(self) -> pb::PReportExecStatusParams {
        self.params
    }
}
