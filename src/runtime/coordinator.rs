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
//! Per-query control plane: dispatches plan fragments to backends, runs the
//! unpartitioned root fragment in process when there is one, merges worker
//! status reports, streams result batches to the client, and commits INSERT
//! side effects.
//!
//! Lock hierarchy, coarsest first: `wait_lock`, the global `lock`, then each
//! `BackendExecState` lock. A lower lock may be taken while holding a higher
//! one, never the reverse.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};

use crate::common::status::Status;
use crate::common::types::{NetworkAddress, UniqueId};
use crate::common::util::{SummaryStats, pretty_bytes, pretty_bytes_per_sec, pretty_time_ns};
use crate::pronghorn_logging::{debug, info};
use crate::runtime::backend_state::{
    BackendExecState, FragmentInstanceCounters, collect_scan_node_counters,
};
use crate::runtime::debug::{DebugAction, DebugOptions, ExecNodePhase};
use crate::runtime::exec_env::ExecEnv;
use crate::runtime::finalize;
use crate::runtime::fragment_executor::{FragmentExecutor, InsertStats, OutputExpr, RowBatch};
use crate::runtime::parallel::exec_parallel;
use crate::runtime::profile::{RuntimeProfile, ScopedTimer};
use crate::runtime::progress::ProgressUpdater;
use crate::runtime::query_schedule::{
    FinalizeParams, FragmentExecParams, PlanFragment, QuerySchedule, StmtType,
};
use crate::service::pb;

pub const PROTOCOL_VERSION: i32 = 1;

/// Catalog changes produced by a DML statement.
#[derive(Debug, Default)]
pub struct CatalogUpdate {
    pub created_partitions: BTreeSet<String>,
}

/// Aggregated statistics for one fragment across its instances.
struct PerFragmentProfileData {
    num_instances: usize,
    /// For the coordinator fragment this IS the executor profile: with a
    /// single instance the average equals the value.
    averaged_profile: RuntimeProfile,
    /// Collection point the per-instance profiles hang off; absent for the
    /// coordinator fragment.
    root_profile: Option<RuntimeProfile>,
    instance_profiles: Mutex<Vec<RuntimeProfile>>,
    bytes_assigned: Mutex<SummaryStats>,
    completion_times: Mutex<SummaryStats>,
    rates: Mutex<SummaryStats>,
}

impl PerFragmentProfileData {
    fn new(num_instances: usize, averaged: RuntimeProfile, root: RuntimeProfile) -> Self {
        Self {
            num_instances,
            averaged_profile: averaged,
            root_profile: Some(root),
            instance_profiles: Mutex::new(Vec::new()),
            bytes_assigned: Mutex::new(SummaryStats::default()),
            completion_times: Mutex::new(SummaryStats::default()),
            rates: Mutex::new(SummaryStats::default()),
        }
    }

    fn for_coordinator(profile: RuntimeProfile) -> Self {
        Self {
            num_instances: 1,
            averaged_profile: profile,
            root_profile: None,
            instance_profiles: Mutex::new(Vec::new()),
            bytes_assigned: Mutex::new(SummaryStats::default()),
            completion_times: Mutex::new(SummaryStats::default()),
            rates: Mutex::new(SummaryStats::default()),
        }
    }

    fn register_instance_profile(&self, profile: RuntimeProfile) {
        self.instance_profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(profile);
    }
}

/// Query metadata frozen while Exec holds the global lock.
struct ExecMeta {
    query_id: UniqueId,
    stmt_type: StmtType,
    finalize_params: Option<FinalizeParams>,
    query_profile: RuntimeProfile,
    finalization_timer: crate::runtime::profile::CounterRef,
    fragment_profiles: Vec<PerFragmentProfileData>,
    /// Scan-node counters of the local coordinator fragment.
    coordinator_counters: FragmentInstanceCounters,
    progress: ProgressUpdater,
    coord_instance_id: Option<UniqueId>,
}

/// Mutable query-wide state behind the global lock.
struct CoordState {
    /// Sticky: set exactly once, by the first error or cancellation.
    query_status: Status,
    /// Remote instances that have not reported done with an OK status.
    num_remaining_backends: usize,
    /// Indexed by backend_num. Slots stay None when Exec fails before
    /// reaching their fragment.
    backend_states: Vec<Option<Arc<BackendExecState>>>,
    partition_row_counts: HashMap<String, i64>,
    files_to_move: BTreeMap<String, String>,
    partition_insert_stats: HashMap<String, InsertStats>,
}

pub struct Coordinator {
    exec_env: Arc<ExecEnv>,
    /// Serializes Wait() callers without blocking Cancel/UpdateStatus.
    wait_lock: Mutex<()>,
    has_called_wait: AtomicBool,
    /// Once true, CANCELLED reports from stragglers are benign tail noise.
    returned_all_results: AtomicBool,
    /// Runner for the unpartitioned root fragment, when there is one.
    executor: OnceLock<Arc<dyn FragmentExecutor>>,
    exec_meta: OnceLock<ExecMeta>,
    lock: Mutex<CoordState>,
    /// Signaled when num_remaining_backends drops to 0 and at the end of
    /// every cancel sweep. Waited on under the global lock.
    backend_completion_cv: Condvar,
}

impl Coordinator {
    pub fn new(exec_env: Arc<ExecEnv>) -> Self {
        Self {
            exec_env,
            wait_lock: Mutex::new(()),
            has_called_wait: AtomicBool::new(false),
            returned_all_results: AtomicBool::new(false),
            executor: OnceLock::new(),
            exec_meta: OnceLock::new(),
            lock: Mutex::new(CoordState {
                query_status: Status::ok(),
                num_remaining_backends: 0,
                backend_states: Vec::new(),
                partition_row_counts: HashMap::new(),
                files_to_move: BTreeMap::new(),
                partition_insert_stats: HashMap::new(),
            }),
            backend_completion_cv: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordState> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn query_id(&self) -> Option<UniqueId> {
        self.exec_meta.get().map(|m| m.query_id)
    }

    pub fn query_profile(&self) -> Option<RuntimeProfile> {
        self.exec_meta.get().map(|m| m.query_profile.clone())
    }

    pub fn progress_num_complete(&self) -> i64 {
        self.exec_meta
            .get()
            .map(|m| m.progress.num_complete())
            .unwrap_or(0)
    }

    pub fn num_remaining_backends(&self) -> usize {
        self.lock_state().num_remaining_backends
    }

    pub fn partition_row_counts(&self) -> HashMap<String, i64> {
        self.lock_state().partition_row_counts.clone()
    }

    /// Dispatch the scheduled plan. Holds the global lock for the whole call
    /// so an async Cancel cannot observe partially populated state. Returns
    /// the prepared output expressions of the coordinator fragment (empty
    /// when every fragment is remote).
    pub fn exec(self: &Arc<Self>, schedule: QuerySchedule) -> Result<Vec<OutputExpr>, Status> {
        if schedule.fragments.is_empty() {
            return Err(Status::internal_error("query schedule has no fragments"));
        }
        if schedule.exec_params.len() != schedule.fragments.len() {
            return Err(Status::internal_error(
                "schedule exec params do not match fragments",
            ));
        }
        for params in &schedule.exec_params {
            if params.hosts.len() != params.instance_ids.len() {
                return Err(Status::internal_error(
                    "schedule hosts do not match instance ids",
                ));
            }
        }
        if self.exec_meta.get().is_some() {
            return Err(Status::internal_error("Exec() called twice"));
        }

        let mut coord = self.lock_state();

        let query_id = schedule.query_id;
        info!(target: "pronghorn::coord", query_id = %query_id, "Exec()");

        let has_coordinator_fragment = schedule.has_coordinator_fragment();
        if has_coordinator_fragment && schedule.exec_params[0].hosts.is_empty() {
            return Err(Status::internal_error(
                "coordinator fragment has no instance",
            ));
        }

        let query_profile = RuntimeProfile::new(format!("Execution Profile {query_id}"));
        let _total_time = ScopedTimer::new(query_profile.total_time_counter());
        let finalization_timer = query_profile.add_timer("FinalizationTimer");
        let coord_address = self.exec_env.coord_address().clone();

        // The coordinator fragment is prepared before any remote instance is
        // started: its exchange node must be registered with the stream
        // manager before senders begin transmitting.
        let mut output_exprs = Vec::new();
        let mut coordinator_counters = FragmentInstanceCounters::default();
        if has_coordinator_fragment {
            let executor = self.exec_env.create_fragment_executor();
            let rpc_params = build_exec_plan_fragment_params(
                &schedule,
                &schedule.fragments[0],
                &schedule.exec_params[0],
                0,
                0,
                &coord_address,
                None,
            );
            executor.prepare(&rpc_params)?;
            // Prepare the output exprs first; the fragment's other exprs were
            // prepared inside prepare(). Deferred codegen runs only after all
            // of them exist.
            output_exprs = executor.prepare_output_exprs(&schedule.fragments[0].output_exprs)?;
            executor.optimize_codegen();

            let profile = executor.profile();
            profile.set_name("Coordinator Fragment");
            query_profile.add_child(profile.clone());
            collect_scan_node_counters(&profile, &mut coordinator_counters);
            let _ = self.executor.set(executor);
        }

        // Per-fragment profile placeholders, registered in fragment-index
        // order so averaged profiles show up top-down.
        let num_fragments = schedule.fragments.len();
        let mut fragment_profiles = Vec::with_capacity(num_fragments);
        for i in 0..num_fragments {
            if i == 0 && has_coordinator_fragment {
                let executor = self.executor.get().expect("executor set above");
                fragment_profiles.push(PerFragmentProfileData::for_coordinator(
                    executor.profile(),
                ));
                continue;
            }
            let num_instances = schedule.exec_params[i].hosts.len();
            let averaged = RuntimeProfile::new(format!("Averaged Fragment {i}"));
            query_profile.add_child(averaged.clone());
            let root = RuntimeProfile::new(format!("Fragment {i}"));
            query_profile.add_child(root.clone());
            fragment_profiles.push(PerFragmentProfileData::new(num_instances, averaged, root));
        }

        let debug_options = match schedule
            .query_options
            .debug_action
            .as_deref()
            .and_then(DebugOptions::parse)
        {
            Some(opts)
                if opts.phase == ExecNodePhase::Close && opts.action == DebugAction::Wait =>
            {
                // workers cannot be cancelled while inside Close
                return Err(Status::internal_error(
                    "debug action CLOSE:WAIT is not allowed",
                ));
            }
            other => other,
        };

        let num_backends = schedule.num_backends();
        coord.backend_states = vec![None; num_backends];
        coord.num_remaining_backends = num_backends;

        let coord_instance_id = if has_coordinator_fragment {
            schedule.exec_params[0].instance_ids.first().copied()
        } else {
            None
        };
        let meta = ExecMeta {
            query_id,
            stmt_type: schedule.stmt_type,
            finalize_params: schedule.finalize_params.clone(),
            query_profile: query_profile.clone(),
            finalization_timer,
            fragment_profiles,
            coordinator_counters,
            progress: ProgressUpdater::new(format!("Query {query_id}"), schedule.num_scan_ranges),
            coord_instance_id,
        };
        if self.exec_meta.set(meta).is_err() {
            return Err(Status::internal_error("Exec() called twice"));
        }
        let meta = self.exec_meta.get().expect("exec meta just set");

        info!(
            target: "pronghorn::coord",
            query_id = %query_id,
            num_backends,
            "starting backends"
        );

        // Start instances left to right so receivers have prepared before
        // their senders start sending.
        let first_remote_fragment = if has_coordinator_fragment { 1 } else { 0 };
        let mut backend_num = 0usize;
        for fragment_idx in first_remote_fragment..num_fragments {
            let params = &schedule.exec_params[fragment_idx];
            let fragment = &schedule.fragments[fragment_idx];
            let num_hosts = params.hosts.len();

            let mut fragment_states = Vec::with_capacity(num_hosts);
            for instance_idx in 0..num_hosts {
                let instance_debug = debug_options.filter(|o| o.applies_to_backend(backend_num));
                let rpc_params = build_exec_plan_fragment_params(
                    &schedule,
                    fragment,
                    params,
                    instance_idx,
                    backend_num as i32,
                    &coord_address,
                    instance_debug.as_ref(),
                );
                let state = Arc::new(BackendExecState::new(
                    backend_num,
                    fragment_idx,
                    params.instance_ids[instance_idx],
                    params.hosts[instance_idx].clone(),
                    rpc_params,
                ));
                meta.fragment_profiles[fragment_idx]
                    .register_instance_profile(state.profile.clone());
                debug!(
                    target: "pronghorn::coord",
                    fragment_idx,
                    instance_id = %state.fragment_instance_id,
                    "starting instance"
                );
                coord.backend_states[backend_num] = Some(Arc::clone(&state));
                fragment_states.push(state);
                backend_num += 1;
            }

            // all of this fragment's exec rpcs go out in parallel
            let this = Arc::clone(self);
            let fragments_exec_status = exec_parallel(
                self.exec_env.exec_rpc_pool(),
                &fragment_states,
                move |state: &BackendExecState| this.exec_remote_fragment(state),
            );

            if !fragments_exec_status.is_ok() {
                // nobody can have cancelled yet: Exec still holds the lock
                debug_assert!(coord.query_status.is_ok());
                coord.query_status = fragments_exec_status.clone();
                self.cancel_internal(&mut coord);
                return Err(fragments_exec_status);
            }
        }

        if has_coordinator_fragment && num_fragments > 1 {
            // The root fragment mostly waits on remote senders; holding on
            // to its exec resources would underutilize the machine.
            if let Some(executor) = self.executor.get() {
                executor.release_exec_resources();
            }
        }

        self.print_backend_info(&coord);

        Ok(output_exprs)
    }

    /// Issue one ExecPlanFragment RPC; runs on the dispatch pool with the
    /// state's lock held for the duration.
    fn exec_remote_fragment(&self, state: &BackendExecState) -> Status {
        let meta = self.exec_meta.get().expect("exec meta set before dispatch");
        debug!(
            target: "pronghorn::rpc",
            query_id = %meta.query_id,
            instance_id = %state.fragment_instance_id,
            host = %state.backend_address,
            "making rpc: ExecPlanFragment"
        );
        let mut inner = state.lock();

        let client = match self.exec_env.client_cache().get_client(&state.backend_address) {
            Ok(client) => client,
            Err(e) => return e,
        };

        let result = match client.exec_plan_fragment(&state.rpc_params) {
            Err(e) => {
                // A backend that stopped and restarted leaves a stale cached
                // connection behind; force a reopen and retry once.
                debug!(
                    target: "pronghorn::rpc",
                    error = %e,
                    "Retrying ExecPlanFragment"
                );
                match self.exec_env.client_cache().reopen(&state.backend_address) {
                    Ok(client) => client.exec_plan_fragment(&state.rpc_params),
                    Err(e) => {
                        inner.status = e.clone();
                        return e;
                    }
                }
            }
            ok => ok,
        };
        let rpc_result = match result {
            Ok(r) => r,
            Err(e) => {
                let status = Status::rpc_error(format!(
                    "ExecPlanFragment rpc query_id={} instance_id={} failed: {e}",
                    meta.query_id, state.fragment_instance_id
                ));
                info!(
                    target: "pronghorn::rpc",
                    error = %status.message(),
                    "exec rpc failed"
                );
                inner.status = status.clone();
                return status;
            }
        };

        inner.status = rpc_result
            .status
            .as_ref()
            .map(Status::from_pb)
            .unwrap_or_else(Status::ok);
        if inner.status.is_ok() {
            inner.initiated = true;
            state.stopwatch.start();
        }
        inner.status.clone()
    }

    pub fn get_status(&self) -> Status {
        self.lock_state().query_status.clone()
    }

    /// Merge an incoming status into the query status: the first error wins
    /// and triggers cancellation; later ones only reach per-state error
    /// logs. Returns the (possibly unchanged) query status.
    pub fn update_status(&self, status: &Status, instance_id: Option<UniqueId>) -> Status {
        let result = {
            let mut coord = self.lock_state();

            // The query is done and we are only waiting for stragglers to
            // clean up; their cancelled updates are benign.
            if self.returned_all_results.load(Ordering::Acquire) && status.is_cancelled() {
                return coord.query_status.clone();
            }
            if status.is_ok() {
                return coord.query_status.clone();
            }
            // never override an earlier error; cancellation already started
            if !coord.query_status.is_ok() {
                return coord.query_status.clone();
            }

            coord.query_status = status.clone();
            self.cancel_internal(&mut coord);
            coord.query_status.clone()
        };

        if let (Some(instance_id), Some(meta)) = (instance_id, self.exec_meta.get()) {
            info!(
                target: "pronghorn::coord",
                query_id = %meta.query_id,
                instance_id = %instance_id,
                "query failed because a fragment instance failed"
            );
        }

        result
    }

    pub fn cancel(&self, cause: Option<&Status>) {
        let mut coord = self.lock_state();
        // a non-OK query status means cancellation has already been started
        if !coord.query_status.is_ok() {
            return;
        }
        coord.query_status = match cause {
            Some(c) if !c.is_ok() => c.clone(),
            _ => Status::cancelled(),
        };
        self.cancel_internal(&mut coord);
    }

    /// Requires the global lock held and `query_status` already non-OK.
    fn cancel_internal(&self, coord: &mut CoordState) {
        debug_assert!(!coord.query_status.is_ok());
        if let Some(meta) = self.exec_meta.get() {
            info!(target: "pronghorn::coord", query_id = %meta.query_id, "Cancel()");
        }
        if let Some(executor) = self.executor.get() {
            executor.cancel();
        }
        self.cancel_remote_fragments_impl(&coord.backend_states);
        // report the summary with whatever progress the query made
        self.report_query_summary_impl(&coord.backend_states);
    }

    fn cancel_remote_fragments(&self) {
        let states = self.lock_state().backend_states.clone();
        self.cancel_remote_fragments_impl(&states);
    }

    /// Best-effort cancel sweep: every initiated, not-done instance gets at
    /// most one CancelPlanFragment RPC; failures are recorded on the state
    /// and never abort the sweep.
    fn cancel_remote_fragments_impl(&self, states: &[Option<Arc<BackendExecState>>]) {
        let query_id = self.query_id().unwrap_or_default();
        // Slots left unpopulated by a failed Exec are skipped.
        for state in states.iter().flatten() {
            // Each state locks individually to synchronize with status
            // reports, which do not take the global lock for their own state.
            let mut inner = state.lock();

            // already terminated with an error: execution must not be cancelled
            if !inner.status.is_ok() {
                continue;
            }
            // nothing to cancel if the exec rpc was never sent
            if !inner.initiated {
                continue;
            }
            if inner.done {
                continue;
            }

            // pre-set CANCELLED so this instance is cancelled only once
            inner.status = Status::cancelled();

            let client = match self.exec_env.client_cache().get_client(&state.backend_address) {
                Ok(client) => client,
                // keep going; other backends still need the cancel
                Err(_) => continue,
            };

            let params = pb::PCancelPlanFragmentParams {
                protocol_version: PROTOCOL_VERSION,
                fragment_instance_id: Some(state.fragment_instance_id.to_pb()),
            };
            info!(
                target: "pronghorn::rpc",
                query_id = %query_id,
                instance_id = %state.fragment_instance_id,
                backend = %state.backend_address,
                "sending CancelPlanFragment rpc"
            );
            let result = match client.cancel_plan_fragment(&params) {
                Err(e) => {
                    debug!(
                        target: "pronghorn::rpc",
                        error = %e,
                        "Retrying CancelPlanFragment"
                    );
                    match self.exec_env.client_cache().reopen(&state.backend_address) {
                        Ok(client) => client.cancel_plan_fragment(&params),
                        Err(reopen_err) => {
                            inner.status.add_error(&reopen_err);
                            continue;
                        }
                    }
                }
                ok => ok,
            };
            let rpc_result = match result {
                Ok(r) => r,
                Err(e) => {
                    // note the failure, keep cancelling the other fragments
                    inner.status.add_error_msg(format!(
                        "CancelPlanFragment rpc query_id={query_id} instance_id={} failed: {e}",
                        state.fragment_instance_id
                    ));
                    continue;
                }
            };
            if let Some(status) = rpc_result.status.as_ref() {
                let status = Status::from_pb(status);
                if !status.is_ok() {
                    inner.status.add_error_msg(status.message());
                }
            }
        }

        // wake any waiter: completion now arrives via cancellation
        self.backend_completion_cv.notify_all();
    }

    fn wait_for_all_backends(&self) -> Status {
        let mut coord = self.lock_state();
        while coord.num_remaining_backends > 0 && coord.query_status.is_ok() {
            debug!(
                target: "pronghorn::coord",
                remaining = coord.num_remaining_backends,
                "waiting for backends to finish"
            );
            coord = self
                .backend_completion_cv
                .wait(coord)
                .unwrap_or_else(|e| e.into_inner());
        }
        if coord.query_status.is_ok() {
            debug!(target: "pronghorn::coord", "all backends finished successfully");
        } else {
            debug!(target: "pronghorn::coord", "all backends finished due to one or more errors");
        }
        coord.query_status.clone()
    }

    /// Idempotent. Blocks until the local fragment opened or every backend
    /// reported, runs finalization for plans that need it, and reports the
    /// query summary for DML.
    pub fn wait(&self) -> Result<(), Status> {
        let _wait_guard = self.wait_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.has_called_wait.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let meta = self
            .exec_meta
            .get()
            .ok_or_else(|| Status::internal_error("Wait() called before Exec()"))?;
        let _total_time = ScopedTimer::new(meta.query_profile.total_time_counter());

        if let Some(executor) = self.executor.get() {
            // Open() may block
            let open_status = Status::from_result(&executor.open());
            let return_status = self.update_status(&open_status, meta.coord_instance_id);

            if return_status.is_ok() {
                // The root sink has finished executing; copy its DML state
                // into the query-wide accumulators. Remote backends carry DML
                // output only when the coordinator has no fragment, so these
                // must still be empty.
                let dml = executor.dml_state();
                let mut coord = self.lock_state();
                debug_assert!(coord.files_to_move.is_empty());
                debug_assert!(coord.partition_row_counts.is_empty());
                coord.files_to_move = dml.files_to_move;
                coord.partition_row_counts = dml.num_appended_rows;
                coord.partition_insert_stats = dml.insert_stats;
            }
        } else {
            // Finalization needs every backend's final report, so its error
            // handling is deferred to finalize_query(); without finalization
            // an error surfaces right here.
            let status = self.wait_for_all_backends();
            if meta.finalize_params.is_none() {
                status.into_result()?;
            }
        }

        if meta.finalize_params.is_some() {
            self.finalize_query()?;
        }

        if meta.stmt_type == StmtType::Dml {
            let insert_stats = self.lock_state().partition_insert_stats.clone();
            meta.query_profile
                .add_info_string("Insert Stats", format_insert_stats(&insert_stats));
            // a DML query is complete once Wait is done
            self.report_query_summary();
        }

        Ok(())
    }

    /// Commit INSERT side effects. Runs even when the query failed: the
    /// staging directory must be cleaned up either way.
    fn finalize_query(&self) -> Result<(), Status> {
        let meta = self.exec_meta.get().expect("Exec() ran");
        let params = meta
            .finalize_params
            .as_ref()
            .expect("finalize params present");
        debug_assert!(self.has_called_wait.load(Ordering::Acquire));
        info!(target: "pronghorn::finalize", query_id = %meta.query_id, "finalizing query");
        let _t = ScopedTimer::new(meta.finalization_timer.clone());

        let mut return_status = self.get_status().into_result();
        if return_status.is_ok() {
            let (row_counts, files_to_move) = {
                let coord = self.lock_state();
                (
                    coord.partition_row_counts.clone(),
                    coord.files_to_move.clone(),
                )
            };
            return_status = finalize::finalize_successful_insert(
                self.exec_env.fs(),
                params,
                &row_counts,
                &files_to_move,
                &meta.query_profile,
            );
        }

        finalize::cleanup_staging_dir(self.exec_env.fs(), params, meta.query_id);
        return_status
    }

    /// Stream the next result batch. `Ok(None)` is only returned once every
    /// backend has completed: post-query finalization may depend on their
    /// final reports.
    pub fn get_next(&self) -> Result<Option<RowBatch>, Status> {
        debug_assert!(self.has_called_wait.load(Ordering::Acquire));
        let meta = self
            .exec_meta
            .get()
            .ok_or_else(|| Status::internal_error("GetNext() called before Exec()"))?;
        let _total_time = ScopedTimer::new(meta.query_profile.total_time_counter());

        let Some(executor) = self.executor.get() else {
            // no local fragment: no output, and execution finished in Wait
            return self.get_status().into_result().map(|_| None);
        };

        // The global lock is not taken here; holding it across the executor
        // call would block an async Cancel().
        let result = executor.get_next();
        let local_status = match &result {
            Ok(_) => Status::ok(),
            Err(e) => e.clone(),
        };
        // On error, return the query status rather than the executor's,
        // which is often just CANCELLED by the time we look.
        self.update_status(&local_status, meta.coord_instance_id)
            .into_result()?;

        let batch = result.unwrap_or(None);
        if let Some(batch) = batch {
            return Ok(Some(batch));
        }

        self.returned_all_results.store(true, Ordering::Release);
        if executor.reached_limit() {
            // The limit was reached, so the exchange node stopped reading.
            // Remote senders must be cancelled explicitly, and so must the
            // streams feeding the local receivers.
            self.cancel_remote_fragments();
            executor.cancel_receiver_streams();
        }

        self.wait_for_all_backends().into_result()?;
        self.report_query_summary();
        Ok(None)
    }

    /// Merge one worker status report. Errors it carries are swallowed at
    /// the RPC reply after triggering cancellation; only an unknown backend
    /// number is reported back to the caller.
    pub fn update_fragment_exec_status(
        &self,
        params: &pb::PReportExecStatusParams,
    ) -> Result<(), Status> {
        let meta = self
            .exec_meta
            .get()
            .ok_or_else(|| Status::internal_error("status report before Exec()"))?;
        debug!(
            target: "pronghorn::coord",
            query_id = %meta.query_id,
            backend_num = params.backend_num,
            done = params.done,
            "UpdateFragmentExecStatus()"
        );

        let state = {
            let coord = self.lock_state();
            let slot = usize::try_from(params.backend_num)
                .ok()
                .and_then(|idx| coord.backend_states.get(idx).cloned())
                .flatten();
            slot.ok_or_else(|| Status::internal_error("unknown backend number"))?
        };

        let status = params
            .status
            .as_ref()
            .map(Status::from_pb)
            .unwrap_or_else(Status::ok);
        {
            let mut inner = state.lock();
            if !status.is_ok() {
                // During cancellation the state is pre-set to CANCELLED, but a
                // non-error report sent before the cancel arrived may still be
                // in flight. Never go back from an error status to OK.
                inner.status = status.clone();
            }
            inner.done = params.done;
            if inner.status.is_ok() {
                // The profile must not change while report_query_summary()
                // sorts children. Summaries run only after all backends
                // reported or from inside the cancel sweep, which pre-sets
                // every status to CANCELLED and thereby suppresses this
                // branch. A final update arriving in that window is dropped.
                if let Some(profile) = params.profile.as_ref() {
                    state.profile.update(profile);
                    state.profile.compute_time_in_profile();
                    self.update_average_profile(meta, &state);
                }
            }
            if !inner.profile_created {
                collect_scan_node_counters(&state.profile, &mut inner.aggregate_counters);
            }
            inner.profile_created = true;

            if !params.error_log.is_empty() {
                inner.error_log.extend(params.error_log.iter().cloned());
                debug!(
                    target: "pronghorn::coord",
                    instance_id = %state.fragment_instance_id,
                    error_log = %inner.error_log.join("\n"),
                    "backend error log"
                );
            }
            meta.progress.update(inner.update_num_scan_ranges_completed());
        }

        if params.done {
            if let Some(insert_status) = params.insert_exec_status.as_ref() {
                // merge table update data: partitions written to and files to
                // move during finalization
                let mut coord = self.lock_state();
                for (partition, rows) in &insert_status.num_appended_rows {
                    *coord
                        .partition_row_counts
                        .entry(partition.clone())
                        .or_insert(0) += rows;
                }
                for (src, dst) in &insert_status.files_to_move {
                    coord.files_to_move.insert(src.clone(), dst.clone());
                }
                for (partition, stats) in &insert_status.insert_stats {
                    let entry = coord
                        .partition_insert_stats
                        .entry(partition.clone())
                        .or_default();
                    entry.bytes_written += stats.bytes_written;
                }
            }
        }

        // Abort the query on any reported error, except a CANCELLED straggler
        // after all results have been returned.
        if !status.is_ok()
            && !(self.returned_all_results.load(Ordering::Acquire) && status.is_cancelled())
        {
            self.update_status(
                &status,
                params.fragment_instance_id.as_ref().map(UniqueId::from_pb),
            );
            return Ok(());
        }

        if params.done {
            let mut coord = self.lock_state();
            state.stopwatch.stop();
            debug_assert!(coord.num_remaining_backends > 0);
            info!(
                target: "pronghorn::coord",
                query_id = %meta.query_id,
                backend_num = params.backend_num,
                remaining = coord.num_remaining_backends.saturating_sub(1),
                "backend completed"
            );
            if coord.num_remaining_backends > 1 {
                // log the first backend still in progress as a debugging aid
                // for backend deadlocks
                for other in coord.backend_states.iter().flatten() {
                    let other_inner = other.lock();
                    if !other_inner.done {
                        debug!(
                            target: "pronghorn::coord",
                            query_id = %meta.query_id,
                            backend = %other.backend_address,
                            "first in-progress backend"
                        );
                        break;
                    }
                }
            }
            coord.num_remaining_backends = coord.num_remaining_backends.saturating_sub(1);
            if coord.num_remaining_backends == 0 {
                self.backend_completion_cv.notify_all();
            }
        }

        Ok(())
    }

    /// Query-wide read throughput for one plan node: memoized backend
    /// counters plus the coordinator-local counter. Counter values are read
    /// without holding any coordinator lock.
    pub fn compute_total_throughput(&self, node_id: i32) -> i64 {
        let states = self.lock_state().backend_states.clone();
        let mut value = 0i64;
        for state in states.iter().flatten() {
            value += state.node_throughput(node_id);
        }
        if let Some(meta) = self.exec_meta.get() {
            if let Some(counter) = meta.coordinator_counters.throughput_counters.get(&node_id) {
                value += counter.value();
            }
        }
        value
    }

    /// Query-wide completed scan ranges for one plan node.
    pub fn compute_total_scan_ranges_complete(&self, node_id: i32) -> i64 {
        let states = self.lock_state().backend_states.clone();
        let mut value = 0i64;
        for state in states.iter().flatten() {
            value += state.num_scan_ranges_completed(node_id);
        }
        if let Some(meta) = self.exec_meta.get() {
            if let Some(counter) = meta
                .coordinator_counters
                .scan_ranges_complete_counters
                .get(&node_id)
            {
                value += counter.value();
            }
        }
        value
    }

    /// Local runtime errors followed by each backend's error log.
    pub fn get_error_log(&self) -> String {
        let mut out = String::new();
        let coord = self.lock_state();
        if let Some(executor) = self.executor.get() {
            let log = executor.error_log();
            if !log.is_empty() {
                out.push_str(&log.join("\n"));
                out.push('\n');
            }
        }
        for state in coord.backend_states.iter().flatten() {
            let inner = state.lock();
            if !inner.error_log.is_empty() {
                out.push_str(&format!(
                    "Backend {}:{}\n",
                    state.backend_num,
                    inner.error_log.join("\n")
                ));
            }
        }
        out
    }

    /// Collect the partitions this DML statement created or wrote. Returns
    /// whether the catalog needs updating at all.
    pub fn prepare_catalog_update(&self, catalog_update: &mut CatalogUpdate) -> bool {
        debug_assert!(self.has_called_wait.load(Ordering::Acquire));
        let coord = self.lock_state();
        for partition in coord.partition_row_counts.keys() {
            catalog_update.created_partitions.insert(partition.clone());
        }
        !catalog_update.created_partitions.is_empty()
    }

    fn update_average_profile(&self, meta: &ExecMeta, state: &BackendExecState) {
        let data = &meta.fragment_profiles[state.fragment_idx];
        let instances = data
            .instance_profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        data.averaged_profile.update_to_average_of(&instances);
        // attaching is idempotent, the profile may already hang there
        if let Some(root) = data.root_profile.as_ref() {
            root.add_child(state.profile.clone());
        }
    }

    fn compute_fragment_summary_stats(&self, meta: &ExecMeta, state: &BackendExecState) {
        let data = &meta.fragment_profiles[state.fragment_idx];
        let completion_time_ns = state.stopwatch.elapsed_ns();
        data.completion_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(completion_time_ns as f64);
        let rate = if completion_time_ns > 0 {
            state.total_split_size as f64 / (completion_time_ns as f64 / 1e9)
        } else {
            0.0
        };
        data.rates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(rate);
        if let Some(root) = data.root_profile.as_ref() {
            root.add_child(state.profile.clone());
        }
    }

    /// Per-fragment "split sizes" summary after dispatch succeeded.
    fn print_backend_info(&self, coord: &CoordState) {
        let Some(meta) = self.exec_meta.get() else {
            return;
        };
        for state in coord.backend_states.iter().flatten() {
            meta.fragment_profiles[state.fragment_idx]
                .bytes_assigned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .update(state.total_split_size as f64);
        }
        let first = if self.executor.get().is_some() { 1 } else { 0 };
        for (fragment_idx, data) in meta.fragment_profiles.iter().enumerate().skip(first) {
            let acc = data
                .bytes_assigned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            let label = format!(
                "min: {}, max: {}, avg: {}, stddev: {}",
                pretty_bytes(acc.min()),
                pretty_bytes(acc.max()),
                pretty_bytes(acc.mean()),
                pretty_bytes(acc.stddev())
            );
            data.averaged_profile.add_info_string("split sizes", &label);
            debug!(
                target: "pronghorn::coord",
                fragment_idx,
                split_sizes = %label,
                "bytes assigned"
            );
        }
    }

    pub fn report_query_summary(&self) {
        let states = self.lock_state().backend_states.clone();
        self.report_query_summary_impl(&states);
    }

    /// Append averaged profiles and duration/rate summaries to the query
    /// profile and log it. Callers must guarantee no concurrent profile
    /// updates: either all backends reported, or the cancel sweep pre-set
    /// every state to CANCELLED first.
    fn report_query_summary_impl(&self, states: &[Option<Arc<BackendExecState>>]) {
        // Before Wait the query has made so little progress that a summary
        // is not useful, and some state may not exist yet.
        if !self.has_called_wait.load(Ordering::Acquire) {
            return;
        }
        let Some(meta) = self.exec_meta.get() else {
            return;
        };

        if let Some(executor) = self.executor.get() {
            executor.profile().compute_time_in_profile();
        }

        let present: Vec<&Arc<BackendExecState>> = states.iter().flatten().collect();
        if !present.is_empty() {
            for state in &present {
                state.profile.compute_time_in_profile();
                self.update_average_profile(meta, state);
                self.compute_fragment_summary_stats(meta, state);
            }

            let first = if self.executor.get().is_some() { 1 } else { 0 };
            for data in meta.fragment_profiles.iter().skip(first) {
                if let Some(root) = data.root_profile.as_ref() {
                    root.sort_children_by_total_time();
                }
                let completion_times = data
                    .completion_times
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                let rates = data.rates.lock().unwrap_or_else(|e| e.into_inner()).clone();
                data.averaged_profile.add_info_string(
                    "completion times",
                    format!(
                        "min:{}  max:{}  mean: {}  stddev:{}",
                        pretty_time_ns(completion_times.min()),
                        pretty_time_ns(completion_times.max()),
                        pretty_time_ns(completion_times.mean()),
                        pretty_time_ns(completion_times.stddev())
                    ),
                );
                data.averaged_profile.add_info_string(
                    "execution rates",
                    format!(
                        "min:{}  max:{}  mean:{}  stddev:{}",
                        pretty_bytes_per_sec(rates.min()),
                        pretty_bytes_per_sec(rates.max()),
                        pretty_bytes_per_sec(rates.mean()),
                        pretty_bytes_per_sec(rates.stddev())
                    ),
                );
                data.averaged_profile
                    .add_info_string("num instances", data.num_instances.to_string());
            }
        }

        info!(
            target: "pronghorn::coord",
            query_id = %meta.query_id,
            summary = %meta.query_profile.pretty_print(),
            "query summary"
        );
    }
}

fn format_insert_stats(stats: &HashMap<String, InsertStats>) -> String {
    let mut entries: Vec<_> = stats.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .iter()
        .map(|(partition, s)| {
            let name = if partition.is_empty() {
                "default"
            } else {
                partition.as_str()
            };
            format!("{}: bytes written={}", name, s.bytes_written)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Assemble the full exec-RPC payload for one fragment instance.
fn build_exec_plan_fragment_params(
    schedule: &QuerySchedule,
    fragment: &PlanFragment,
    params: &FragmentExecParams,
    instance_idx: usize,
    backend_num: i32,
    coord: &NetworkAddress,
    debug_options: Option<&DebugOptions>,
) -> pb::PExecPlanFragmentParams {
    let exec_host = &params.hosts[instance_idx];
    // scan ranges may not be assigned to every host
    let per_node_scan_ranges = params
        .scan_range_assignment
        .get(exec_host)
        .cloned()
        .unwrap_or_default();

    let mut plan_params = pb::PPlanFragmentExecParams {
        query_id: Some(schedule.query_id.to_pb()),
        fragment_instance_id: Some(params.instance_ids[instance_idx].to_pb()),
        per_node_scan_ranges,
        per_exch_num_senders: params.per_exch_num_senders.clone(),
        destinations: params.destinations.clone(),
        request_pool: schedule
            .query_options
            .request_pool
            .clone()
            .unwrap_or_default(),
        debug_node_id: -1,
        debug_phase: ExecNodePhase::Invalid as i32,
        debug_action: DebugAction::Wait as i32,
    };
    if let Some(opts) = debug_options {
        plan_params.debug_node_id = opts.node_id;
        plan_params.debug_phase = opts.phase as i32;
        plan_params.debug_action = opts.action as i32;
    }

    let mut rpc_params = pb::PExecPlanFragmentParams {
        protocol_version: PROTOCOL_VERSION,
        fragment: fragment.fragment.clone(),
        desc_tbl: schedule.desc_tbl.clone(),
        params: Some(plan_params),
        coord: Some(coord.to_pb()),
        backend_num,
        query_ctx: schedule.query_ctx.clone(),
        reserved_resource: None,
        local_resource_address: None,
    };
    if let Some(resource_host) = schedule.resource_hostport(exec_host) {
        // the reservation was validated when the schedule was built
        if let Some(resource) = schedule.reserved_resource(resource_host) {
            rpc_params.reserved_resource = Some(resource.clone());
            rpc_params.local_resource_address = Some(resource_host.to_pb());
        }
    }
    rpc_params
}
