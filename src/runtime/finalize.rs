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
//! INSERT finalization: prepare target partition directories, move the
//! sink's temp files into place, and clean up. Runs only after every backend
//! reported its final status.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::common::status::Status;
use crate::common::types::UniqueId;
use crate::fs::bulk::{FsExecutor, FsOp, FsOpKind, FsOperationSet};
use crate::pronghorn_logging::{info, warn};
use crate::runtime::profile::RuntimeProfile;
use crate::runtime::query_schedule::FinalizeParams;

/// Hive and this engine treat dot- and underscore-prefixed files as hidden.
fn is_hidden_file(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

fn partition_path(base_dir: &str, partition: &str) -> String {
    let base = base_dir.trim_end_matches('/');
    if partition.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{partition}")
    }
}

pub(crate) fn staging_directory(staging_dir: &str, query_id: UniqueId) -> String {
    format!(
        "{}/{}/",
        staging_dir.trim_end_matches('/'),
        query_id.to_path_string()
    )
}

/// Phases 1-3 of finalization. Phase 4 (staging cleanup) is driven by the
/// caller because it must run even when this returns an error.
pub(crate) fn finalize_successful_insert(
    fs: &Arc<FsExecutor>,
    params: &FinalizeParams,
    partition_row_counts: &HashMap<String, i64>,
    files_to_move: &BTreeMap<String, String>,
    query_profile: &RuntimeProfile,
) -> Result<(), Status> {
    // Phase 1: for OVERWRITE remove what the insert replaces, then create
    // all partition directories.
    let mut partition_create_ops = FsOperationSet::new();
    {
        let _t = query_profile.scoped_timer("Overwrite/PartitionCreationTimer");
        for partition in partition_row_counts.keys() {
            let part_path = partition_path(&params.base_dir, partition);
            if params.is_overwrite {
                if partition.is_empty() {
                    // Writing the table root means the table is unpartitioned.
                    // Only files are deleted: directories are ignored as data
                    // by readers and may hold unrelated content, and the
                    // sink's temp directories live here as well.
                    debug_assert_eq!(partition_row_counts.len(), 1);
                    let entries = fs.list(&part_path).map_err(|e| {
                        Status::fs_error(format!("Could not list directory {part_path}: {e}"))
                    })?;
                    for entry in entries {
                        if entry.is_file && !is_hidden_file(&entry.name) {
                            partition_create_ops.add(FsOp::delete(entry.path));
                        }
                    }
                } else if fs.exists_dir(&part_path).unwrap_or(false) {
                    // A partition directory can be removed recursively once we
                    // know it exists. The probe races with third-party
                    // deletions; the window is accepted here.
                    partition_create_ops.add(FsOp::delete_then_create(part_path));
                } else {
                    partition_create_ops.add(FsOp::create_dir(part_path));
                }
            } else {
                partition_create_ops.add(FsOp::create_dir(part_path));
            }
        }

        let errors = partition_create_ops.execute(fs);
        // Directory creation may fail because the directory already exists;
        // permission problems resurface when the files move in.
        let num_errors = errors.len();
        if let Some((_, first)) = errors
            .iter()
            .find(|(op, _)| op.kind != FsOpKind::CreateDir)
        {
            return Err(Status::fs_error(format!(
                "Error(s) deleting partition directories. First error (of {num_errors}) was: {first}"
            )));
        }
    }

    // Phase 2: move the sink's temp files into their partitions. An empty
    // destination marks the source as a temp directory, deleted in phase 3
    // only after all its contents have moved out.
    let mut move_ops = FsOperationSet::new();
    let mut dir_deletion_ops = FsOperationSet::new();
    for (src, dst) in files_to_move {
        if dst.is_empty() {
            dir_deletion_ops.add(FsOp::delete(src.clone()));
        } else {
            move_ops.add(FsOp::rename(src.clone(), dst.clone()));
        }
    }

    {
        let _t = query_profile.scoped_timer("FileMoveTimer");
        let errors = move_ops.execute(fs);
        if let Some((_, first)) = errors.first() {
            return Err(Status::fs_error(format!(
                "Error(s) moving partition files. First error (of {}) was: {first}",
                errors.len()
            )));
        }
    }

    // Phase 3: remove the now-empty temp directories.
    {
        let _t = query_profile.scoped_timer("FileDeletionTimer");
        let errors = dir_deletion_ops.execute(fs);
        if let Some((_, first)) = errors.first() {
            return Err(Status::fs_error(format!(
                "Error(s) deleting staging directories. First error (of {}) was: {first}",
                errors.len()
            )));
        }
    }

    Ok(())
}

/// Phase 4: best-effort recursive removal of the per-query staging
/// directory. Failures are logged, never reported.
pub(crate) fn cleanup_staging_dir(fs: &Arc<FsExecutor>, params: &FinalizeParams, query_id: UniqueId) {
    let staging = staging_directory(&params.staging_dir, query_id);
    info!(
        target: "pronghorn::finalize",
        query_id = %query_id,
        staging = %staging,
        "removing staging directory"
    );
    if let Err(e) = fs.remove_all(&staging) {
        warn!(
            target: "pronghorn::finalize",
            query_id = %query_id,
            staging = %staging,
            error = %e,
            "staging cleanup failed"
        );
    }
}
