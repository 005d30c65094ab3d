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
use std::sync::Arc;
use std::sync::mpsc;

use threadpool::ThreadPool;

use crate::common::status::Status;

/// Run `f` once per state concurrently on `pool` and block until every
/// invocation has settled. Returns the first non-OK status by state order
/// (OK when all succeed). Each state is handled exactly once.
pub fn exec_parallel<T, F>(pool: &ThreadPool, states: &[Arc<T>], f: F) -> Status
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> Status + Send + Sync + 'static,
{
    if states.is_empty() {
        return Status::ok();
    }

    let f = Arc::new(f);
    let (tx, rx) = mpsc::channel::<(usize, Status)>();
    for (idx, state) in states.iter().enumerate() {
        let state = Arc::clone(state);
        let f = Arc::clone(&f);
        let tx = tx.clone();
        pool.execute(move || {
            let status = f(&state);
            let _ = tx.send((idx, status));
        });
    }
    drop(tx);

    let mut first_error: Option<(usize, Status)> = None;
    for (idx, status) in rx {
        if status.is_ok() {
            continue;
        }
        match &first_error {
            Some((first_idx, _)) if *first_idx <= idx => {}
            _ => first_error = Some((idx, status)),
        }
    }
    match first_error {
        Some((_, status)) => status,
        None => Status::ok(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use threadpool::ThreadPool;

    use super::exec_parallel;
    use crate::common::status::Status;

    #[test]
    fn all_states_run_exactly_once() {
        let pool = ThreadPool::new(4);
        let states: Vec<Arc<AtomicUsize>> =
            (0..16).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let status = exec_parallel(&pool, &states, |s: &AtomicUsize| {
            s.fetch_add(1, Ordering::SeqCst);
            Status::ok()
        });
        assert!(status.is_ok());
        for s in &states {
            assert_eq!(s.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn returns_first_error_by_state_order() {
        let pool = ThreadPool::new(4);
        let states: Vec<Arc<usize>> = (0..8).map(Arc::new).collect();
        let status = exec_parallel(&pool, &states, |s: &usize| {
            if *s >= 3 {
                Status::rpc_error(format!("state {s} failed"))
            } else {
                Status::ok()
            }
        });
        assert_eq!(status.message(), "state 3 failed");
    }
}
