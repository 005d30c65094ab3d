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
//! Surface of the in-process executor that runs the unpartitioned root
//! fragment. The execution engine behind it lives elsewhere; the coordinator
//! only drives this interface.

use std::collections::{BTreeMap, HashMap};

use crate::common::status::Status;
use crate::runtime::profile::RuntimeProfile;
use crate::service::pb;

/// One batch of result rows, already rendered into the client wire format.
#[derive(Clone, Debug, Default)]
pub struct RowBatch {
    pub rows: Vec<Vec<u8>>,
}

impl RowBatch {
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }
}

/// A prepared output expression handle, opaque to the coordinator.
#[derive(Clone, Debug)]
pub struct OutputExpr {
    pub expr: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InsertStats {
    pub bytes_written: i64,
}

impl InsertStats {
    pub fn to_pb(self) -> pb::PInsertStats {
        pb::PInsertStats {
            bytes_written: self.bytes_written,
        }
    }

    pub fn from_pb(stats: &pb::PInsertStats) -> Self {
        Self {
            bytes_written: stats.bytes_written,
        }
    }
}

/// DML side effects accumulated by a fragment's table sink. Partition keys
/// are path suffixes under the finalize base directory; "" is the
/// unpartitioned table root.
#[derive(Clone, Debug, Default)]
pub struct DmlExecState {
    /// src -> dst; empty dst marks src as a temp directory to delete.
    pub files_to_move: BTreeMap<String, String>,
    pub num_appended_rows: HashMap<String, i64>,
    pub insert_stats: HashMap<String, InsertStats>,
}

impl DmlExecState {
    pub fn is_empty(&self) -> bool {
        self.files_to_move.is_empty()
            && self.num_appended_rows.is_empty()
            && self.insert_stats.is_empty()
    }
}

/// Runner for the coordinator fragment. Prepare/Open/GetNext may block;
/// Cancel may be called concurrently from another thread at any point after
/// Prepare has been invoked.
pub trait FragmentExecutor: Send + Sync {
    fn prepare(&self, rpc_params: &pb::PExecPlanFragmentParams) -> Result<(), Status>;

    /// Prepare the root fragment's output expressions against the executor's
    /// row descriptor. Called after `prepare`, before `optimize_codegen`.
    fn prepare_output_exprs(&self, exprs: &[Vec<u8>]) -> Result<Vec<OutputExpr>, Status>;

    /// Deferred codegen optimization, run once all expressions are prepared.
    fn optimize_codegen(&self) {}

    fn open(&self) -> Result<(), Status>;

    /// `Ok(None)` signals end of stream.
    fn get_next(&self) -> Result<Option<RowBatch>, Status>;

    /// True once a LIMIT was satisfied; remote senders are then cancelled
    /// eagerly because the exchange node stops reading.
    fn reached_limit(&self) -> bool;

    fn cancel(&self);

    /// Tear down the streams feeding this fragment's exchange nodes.
    fn cancel_receiver_streams(&self) {}

    /// Give back scheduling resources while the mostly-idle root fragment
    /// waits on remote senders.
    fn release_exec_resources(&self) {}

    fn profile(&self) -> RuntimeProfile;

    fn dml_state(&self) -> DmlExecState {
        DmlExecState::default()
    }

    fn error_log(&self) -> Vec<String> {
        Vec::new()
    }
}
