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
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Running min/max/mean/stddev accumulator.
#[derive(Clone, Debug, Default)]
pub struct SummaryStats {
    count: u64,
    min: f64,
    max: f64,
    sum: f64,
    sum_sq: f64,
}

impl SummaryStats {
    pub fn update(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = (self.sum_sq / self.count as f64 - mean * mean).max(0.0);
        variance.sqrt()
    }
}

/// Wall-clock stopwatch with interior mutability, so that starting (under a
/// per-backend lock) and stopping (under the coordinator lock) need not share
/// a guard. The internal lock is a leaf and never held across other locks.
#[derive(Debug, Default)]
pub struct MonotonicStopwatch {
    inner: Mutex<StopwatchInner>,
}

#[derive(Debug, Default)]
struct StopwatchInner {
    started_at: Option<Instant>,
    accumulated: Duration,
}

impl MonotonicStopwatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.started_at.is_none() {
            inner.started_at = Some(Instant::now());
        }
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(started_at) = inner.started_at.take() {
            inner.accumulated += started_at.elapsed();
        }
    }

    pub fn elapsed_ns(&self) -> i64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let running = inner
            .started_at
            .map(|s| s.elapsed())
            .unwrap_or(Duration::ZERO);
        clamp_u128_to_i64((inner.accumulated + running).as_nanos())
    }
}

pub fn clamp_u128_to_i64(value: u128) -> i64 {
    if value > i64::MAX as u128 {
        i64::MAX
    } else {
        value as i64
    }
}

const BYTE_UNITS: [(f64, &str); 4] = [
    (1024.0 * 1024.0 * 1024.0, "GB"),
    (1024.0 * 1024.0, "MB"),
    (1024.0, "KB"),
    (1.0, "B"),
];

pub fn pretty_bytes(value: f64) -> String {
    for (scale, unit) in BYTE_UNITS {
        if value.abs() >= scale || scale == 1.0 {
            return format!("{:.2} {}", value / scale, unit);
        }
    }
    unreachable!("BYTE_UNITS ends with a unit scale")
}

pub fn pretty_bytes_per_sec(value: f64) -> String {
    format!("{}/sec", pretty_bytes(value))
}

pub fn pretty_time_ns(value: f64) -> String {
    let ns = value.max(0.0);
    if ns < 1_000.0 {
        format!("{:.0}ns", ns)
    } else if ns < 1_000_000.0 {
        format!("{:.1}us", ns / 1_000.0)
    } else if ns < 1_000_000_000.0 {
        format!("{:.1}ms", ns / 1_000_000.0)
    } else {
        format!("{:.2}s", ns / 1_000_000_000.0)
    }
}
