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
use std::sync::atomic::{AtomicI64, Ordering};

use crate::common::config::progress_log_period_percent;
use crate::pronghorn_logging::{info, warn};

/// Query-wide scan-range completion tracker. Deltas arrive from concurrent
/// status-report threads; completion is monotonically non-decreasing and the
/// log output is rate-limited to percentage steps.
#[derive(Debug)]
pub struct ProgressUpdater {
    label: String,
    total: i64,
    num_complete: AtomicI64,
    last_logged_percentage: AtomicI64,
    log_period_percent: i64,
}

impl ProgressUpdater {
    pub fn new(label: impl Into<String>, total: i64) -> Self {
        Self {
            label: label.into(),
            total,
            num_complete: AtomicI64::new(0),
            last_logged_percentage: AtomicI64::new(0),
            log_period_percent: progress_log_period_percent().max(1),
        }
    }

    pub fn update(&self, delta: i64) {
        debug_assert!(delta >= 0, "progress delta must be non-negative");
        if delta < 0 {
            warn!(
                target: "pronghorn::progress",
                label = %self.label,
                delta,
                "ignoring negative progress delta"
            );
            return;
        }
        if delta == 0 {
            return;
        }
        let num_complete = self.num_complete.fetch_add(delta, Ordering::Relaxed) + delta;
        if self.total <= 0 {
            return;
        }
        let percentage = num_complete * 100 / self.total;
        let last = self.last_logged_percentage.load(Ordering::Relaxed);
        if percentage >= last + self.log_period_percent
            && self
                .last_logged_percentage
                .compare_exchange(last, percentage, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            info!(
                target: "pronghorn::progress",
                label = %self.label,
                num_complete,
                total = self.total,
                percentage,
                "progress"
            );
        }
    }

    pub fn num_complete(&self) -> i64 {
        self.num_complete.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn done(&self) -> bool {
        self.num_complete() >= self.total
    }
}

#[cfg(test)]
mod tests {
    use super::ProgressUpdater;

    #[test]
    fn updates_accumulate_until_done() {
        let progress = ProgressUpdater::new("Query 0:1", 10);
        progress.update(4);
        progress.update(0);
        assert_eq!(progress.num_complete(), 4);
        assert!(!progress.done());
        progress.update(6);
        assert!(progress.done());
    }
}
