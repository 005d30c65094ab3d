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
//! Bulk filesystem operations for query finalization, executed in parallel
//! on a dedicated thread pool over an `opendal::Operator`. All paths are
//! relative to the operator root.

use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Context, Result};
use opendal::{EntryMode, Operator};
use threadpool::ThreadPool;
use tokio::runtime::Runtime;

use crate::common::config::fs_op_threads;
use crate::pronghorn_logging::debug;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FsOpKind {
    CreateDir,
    Delete,
    DeleteThenCreate,
    Rename,
}

#[derive(Clone, Debug)]
pub struct FsOp {
    pub kind: FsOpKind,
    pub src: String,
    /// Only set for Rename.
    pub dst: Option<String>,
}

impl FsOp {
    pub fn create_dir(path: impl Into<String>) -> Self {
        Self {
            kind: FsOpKind::CreateDir,
            src: path.into(),
            dst: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            kind: FsOpKind::Delete,
            src: path.into(),
            dst: None,
        }
    }

    pub fn delete_then_create(path: impl Into<String>) -> Self {
        Self {
            kind: FsOpKind::DeleteThenCreate,
            src: path.into(),
            dst: None,
        }
    }

    pub fn rename(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            kind: FsOpKind::Rename,
            src: src.into(),
            dst: Some(dst.into()),
        }
    }
}

/// A directory listing entry.
#[derive(Clone, Debug)]
pub struct FsEntry {
    pub path: String,
    pub name: String,
    pub is_file: bool,
}

/// Shared driver owning the operator, a runtime to drive it, and the pool
/// bulk operation sets fan out on.
pub struct FsExecutor {
    op: Operator,
    rt: Runtime,
    pool: ThreadPool,
}

impl FsExecutor {
    pub fn new(op: Operator) -> Result<Self> {
        let rt = Runtime::new().context("init tokio runtime for fs executor")?;
        let pool = ThreadPool::with_name("fs_op".to_string(), fs_op_threads().max(1));
        Ok(Self { op, rt, pool })
    }

    pub fn exists_dir(&self, path: &str) -> Result<bool, String> {
        self.rt
            .block_on(self.op.exists(&dir_path(path)))
            .map_err(|e| e.to_string())
    }

    /// Direct children of a directory. Directories the listing reports with
    /// an unknown mode are treated as non-files.
    pub fn list(&self, path: &str) -> Result<Vec<FsEntry>, String> {
        let dir = dir_path(path);
        let entries = self
            .rt
            .block_on(self.op.list(&dir))
            .map_err(|e| e.to_string())?;
        Ok(entries
            .into_iter()
            .filter(|e| e.path() != dir)
            .map(|e| FsEntry {
                path: e.path().to_string(),
                name: e.name().trim_end_matches('/').to_string(),
                is_file: e.metadata().mode() == EntryMode::FILE,
            })
            .collect())
    }

    /// Recursive delete; absent paths are not an error.
    pub fn remove_all(&self, path: &str) -> Result<(), String> {
        self.rt
            .block_on(self.op.remove_all(path))
            .map_err(|e| e.to_string())
    }

    fn apply(&self, op: &FsOp) -> Result<(), String> {
        debug!(
            target: "pronghorn::fs",
            kind = ?op.kind,
            src = %op.src,
            dst = op.dst.as_deref().unwrap_or(""),
            "fs op"
        );
        match op.kind {
            FsOpKind::CreateDir => self
                .rt
                .block_on(self.op.create_dir(&dir_path(&op.src)))
                .map_err(|e| e.to_string()),
            FsOpKind::Delete => self.remove_all(&op.src),
            FsOpKind::DeleteThenCreate => {
                self.remove_all(&op.src)?;
                self.rt
                    .block_on(self.op.create_dir(&dir_path(&op.src)))
                    .map_err(|e| e.to_string())
            }
            FsOpKind::Rename => {
                let dst = op.dst.as_deref().unwrap_or("");
                self.rt
                    .block_on(self.op.rename(&op.src, dst))
                    .map_err(|e| e.to_string())
            }
        }
    }
}

fn dir_path(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// A batch of filesystem operations executed together. Failures never abort
/// the batch; callers decide which errors are fatal.
#[derive(Default)]
pub struct FsOperationSet {
    ops: Vec<FsOp>,
}

impl FsOperationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, op: FsOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Run all operations on the executor's pool and return the failures in
    /// submission order.
    pub fn execute(self, fs: &Arc<FsExecutor>) -> Vec<(FsOp, String)> {
        if self.ops.is_empty() {
            return Vec::new();
        }
        let (tx, rx) = mpsc::channel::<(usize, FsOp, String)>();
        let num_ops = self.ops.len();
        for (idx, op) in self.ops.into_iter().enumerate() {
            let fs = Arc::clone(fs);
            let tx = tx.clone();
            fs.pool.clone().execute(move || {
                if let Err(e) = fs.apply(&op) {
                    let _ = tx.send((idx, op, e));
                }
            });
        }
        drop(tx);

        let mut errors: Vec<(usize, FsOp, String)> = rx.into_iter().collect();
        errors.sort_by_key(|(idx, _, _)| *idx);
        debug_assert!(errors.len() <= num_ops);
        errors.into_iter().map(|(_, op, e)| (op, e)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{FsExecutor, FsOp, FsOperationSet};

    fn fs_executor(root: &std::path::Path) -> Arc<FsExecutor> {
        let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
        let op = opendal::Operator::new(builder)
            .expect("init fs operator")
            .finish();
        Arc::new(FsExecutor::new(op).expect("init fs executor"))
    }

    #[test]
    fn create_list_and_delete_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = fs_executor(dir.path());

        let mut ops = FsOperationSet::new();
        ops.add(FsOp::create_dir("a/b"));
        ops.add(FsOp::create_dir("a/c"));
        let errors = ops.execute(&fs);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");

        std::fs::write(dir.path().join("a/b/part-0"), b"rows").expect("write file");
        let entries = fs.list("a/b").expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "part-0");
        assert!(entries[0].is_file);

        let mut ops = FsOperationSet::new();
        ops.add(FsOp::delete("a/b"));
        assert!(ops.execute(&fs).is_empty());
        assert!(!fs.exists_dir("a/b").expect("exists"));
    }

    #[test]
    fn rename_moves_file_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = fs_executor(dir.path());
        std::fs::create_dir_all(dir.path().join("tmp")).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("final")).expect("mkdir");
        std::fs::write(dir.path().join("tmp/f1"), b"payload").expect("write");

        let mut ops = FsOperationSet::new();
        ops.add(FsOp::rename("tmp/f1", "final/f1"));
        assert!(ops.execute(&fs).is_empty());

        assert!(dir.path().join("final/f1").exists());
        assert!(!dir.path().join("tmp/f1").exists());
    }

    #[test]
    fn failures_are_reported_in_submission_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = fs_executor(dir.path());

        let mut ops = FsOperationSet::new();
        ops.add(FsOp::rename("missing/x", "y"));
        ops.add(FsOp::create_dir("ok"));
        ops.add(FsOp::rename("missing/z", "w"));
        let errors = ops.execute(&fs);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].0.src, "missing/x");
        assert_eq!(errors[1].0.src, "missing/z");
    }
}
