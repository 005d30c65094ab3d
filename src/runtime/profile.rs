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
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::service::pb;

pub const TOTAL_TIME_COUNTER: &str = "TotalTime";
pub const LOCAL_TIME_COUNTER: &str = "LocalTime";

/// Counter measurement unit. Time counters average across instances when
/// profiles are merged; everything else sums.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum CounterUnit {
    Unit = 0,
    UnitPerSecond = 1,
    Bytes = 2,
    BytesPerSecond = 3,
    TimeNs = 4,
}

impl CounterUnit {
    pub fn from_i32(unit: i32) -> Self {
        match unit {
            1 => CounterUnit::UnitPerSecond,
            2 => CounterUnit::Bytes,
            3 => CounterUnit::BytesPerSecond,
            4 => CounterUnit::TimeNs,
            _ => CounterUnit::Unit,
        }
    }

    fn averages_on_merge(self) -> bool {
        matches!(self, CounterUnit::TimeNs)
    }
}

#[derive(Clone, Debug)]
struct CounterSnapshot {
    name: String,
    unit: CounterUnit,
    value: i64,
}

/// A tree of named counters and info strings describing one execution.
/// Handles are cheap clones of a shared, internally synchronized node, so
/// callers never need an outer lock to update a profile.
#[derive(Clone, Debug)]
pub struct RuntimeProfile {
    inner: Arc<RuntimeProfileInner>,
}

#[derive(Debug)]
struct RuntimeProfileInner {
    name: RwLock<String>,
    // plan node id for exec-node profiles, -1 otherwise
    metadata: AtomicI64,
    counters: Mutex<HashMap<String, CounterRef>>,
    info_strings: Mutex<BTreeMap<String, String>>,
    children: Mutex<Vec<RuntimeProfile>>,
    child_map: Mutex<HashMap<String, RuntimeProfile>>,
}

impl RuntimeProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RuntimeProfileInner {
                name: RwLock::new(name.into()),
                metadata: AtomicI64::new(-1),
                counters: Mutex::new(HashMap::new()),
                info_strings: Mutex::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
                child_map: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner
            .name
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn set_name(&self, name: impl Into<String>) {
        let mut guard = self.inner.name.write().unwrap_or_else(|e| e.into_inner());
        *guard = name.into();
    }

    pub fn metadata(&self) -> i64 {
        self.inner.metadata.load(Ordering::Relaxed)
    }

    pub fn set_metadata(&self, md: i64) {
        self.inner.metadata.store(md, Ordering::Relaxed);
    }

    pub fn get_child(&self, name: &str) -> Option<RuntimeProfile> {
        self.inner
            .child_map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Transitive children in depth-first order, excluding self.
    pub fn all_children(&self) -> Vec<RuntimeProfile> {
        let mut out = Vec::new();
        for child in self.children() {
            out.push(child.clone());
            out.extend(child.all_children());
        }
        out
    }

    /// Attach a child profile. A no-op when a child with the same name is
    /// already attached, which makes repeated attachment from status reports
    /// idempotent.
    pub fn add_child(&self, child: RuntimeProfile) {
        let child_name = child.name();
        {
            let mut map = self
                .inner
                .child_map
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if map.contains_key(&child_name) {
                return;
            }
            map.insert(child_name.clone(), child.clone());
        }
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        children.push(child);
    }

    pub fn child(&self, name: impl Into<String>) -> RuntimeProfile {
        let name = name.into();
        if let Some(existing) = self.get_child(&name) {
            return existing;
        }
        let child = RuntimeProfile::new(name);
        self.add_child(child.clone());
        child
    }

    /// Sort direct children by descending total time. Must not run while
    /// other threads still update the children's counters.
    pub fn sort_children_by_total_time(&self) {
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        children.sort_by_key(|c| std::cmp::Reverse(c.total_time_ns()));
    }

    fn total_time_ns(&self) -> i64 {
        self.get_counter(TOTAL_TIME_COUNTER)
            .map(|c| c.value())
            .unwrap_or(0)
    }

    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut guard = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        guard.insert(key.into(), value.into());
    }

    pub fn get_info_string(&self, key: &str) -> Option<String> {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    pub fn add_counter(&self, name: impl Into<String>, unit: CounterUnit) -> CounterRef {
        let name = name.into();
        let mut guard = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = guard.get(&name) {
            return Arc::clone(counter);
        }
        let counter = Arc::new(Counter::new(name.clone(), unit));
        guard.insert(name, Arc::clone(&counter));
        counter
    }

    pub fn get_counter(&self, name: &str) -> Option<CounterRef> {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn counter_set(&self, name: &str, unit: CounterUnit, value: i64) {
        let c = self.add_counter(name.to_string(), unit);
        c.set(value);
    }

    pub fn add_timer(&self, name: impl Into<String>) -> CounterRef {
        self.add_counter(name, CounterUnit::TimeNs)
    }

    pub fn total_time_counter(&self) -> CounterRef {
        self.add_timer(TOTAL_TIME_COUNTER)
    }

    pub fn scoped_timer(&self, name: impl Into<String>) -> ScopedTimer {
        ScopedTimer::new(self.add_timer(name))
    }

    /// Replace this profile's contents with the given cumulative tree.
    /// Counter values are overwritten, never added; children are matched by
    /// name and created as needed, so re-applying the same tree is a no-op.
    pub fn update(&self, tree: &pb::PRuntimeProfileTree) {
        let mut idx = 0usize;
        self.update_from_nodes(&tree.nodes, &mut idx);
    }

    fn update_from_nodes(&self, nodes: &[pb::PRuntimeProfileNode], idx: &mut usize) {
        let Some(node) = nodes.get(*idx) else {
            return;
        };
        *idx += 1;
        self.set_metadata(node.metadata);
        for counter in &node.counters {
            let c = self.add_counter(counter.name.clone(), CounterUnit::from_i32(counter.unit));
            c.set(counter.value);
        }
        if !node.info_strings.is_empty() {
            let mut guard = self
                .inner
                .info_strings
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for (k, v) in &node.info_strings {
                guard.insert(k.clone(), v.clone());
            }
        }
        let num_children = node.num_children.max(0) as usize;
        for _ in 0..num_children {
            let Some(child_node) = nodes.get(*idx) else {
                return;
            };
            let child = self.child(child_node.name.clone());
            child.update_from_nodes(nodes, idx);
        }
    }

    pub fn to_pb_tree(&self) -> pb::PRuntimeProfileTree {
        let mut nodes = Vec::new();
        self.to_pb_nodes(&mut nodes);
        pb::PRuntimeProfileTree { nodes }
    }

    fn to_pb_nodes(&self, out: &mut Vec<pb::PRuntimeProfileNode>) {
        let counters = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|c| c.to_pb())
            .collect::<Vec<_>>();
        let info_strings = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let children = self.children();

        out.push(pb::PRuntimeProfileNode {
            name: self.name(),
            num_children: children.len() as i32,
            counters,
            metadata: self.metadata(),
            info_strings,
        });

        for child in children {
            child.to_pb_nodes(out);
        }
    }

    /// Derive per-node local time: TotalTime minus the children's TotalTime.
    pub fn compute_time_in_profile(&self) {
        let children = self.children();
        let child_total: i64 = children
            .iter()
            .map(|c| c.total_time_ns())
            .fold(0i64, |acc, v| acc.saturating_add(v));
        let local = (self.total_time_ns() - child_total).max(0);
        self.counter_set(LOCAL_TIME_COUNTER, CounterUnit::TimeNs, local);
        for child in children {
            child.compute_time_in_profile();
        }
    }

    /// Overwrite this profile with the average of the given instance
    /// profiles: time counters average, all others sum. Children are merged
    /// only when present under the same name in every instance.
    pub fn update_to_average_of(&self, profiles: &[RuntimeProfile]) {
        if profiles.is_empty() {
            return;
        }
        self.set_metadata(profiles[0].metadata());

        let all_counter_names: BTreeSet<String> = profiles
            .iter()
            .flat_map(|p| {
                p.inner
                    .counters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();

        for name in all_counter_names {
            let snapshots: Vec<CounterSnapshot> = profiles
                .iter()
                .filter_map(|p| p.counter_snapshot(&name))
                .collect();
            if snapshots.is_empty() {
                continue;
            }
            let unit = snapshots[0].unit;
            let values: Vec<i64> = snapshots.iter().map(|s| s.value).collect();
            let (merged, min_value, max_value) = merge_counter_values(unit, &values);
            let c = self.add_counter(name, unit);
            c.set(merged);
            c.set_min(min_value);
            c.set_max(max_value);
        }

        for child in profiles[0].children() {
            let child_name = child.name();
            let mut child_profiles = Vec::with_capacity(profiles.len());
            for p in profiles {
                if let Some(c) = p.get_child(&child_name) {
                    child_profiles.push(c);
                }
            }
            if child_profiles.len() != profiles.len() {
                continue;
            }
            let merged_child = self.child(child_name);
            merged_child.update_to_average_of(&child_profiles);
        }
    }

    fn counter_snapshot(&self, name: &str) -> Option<CounterSnapshot> {
        let guard = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let c = guard.get(name)?;
        Some(CounterSnapshot {
            name: c.name.clone(),
            unit: c.unit,
            value: c.value(),
        })
    }

    /// Multi-line rendering for query-summary logging.
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        self.pretty_print_into(&mut out, 0);
        out
    }

    fn pretty_print_into(&self, out: &mut String, indent: usize) {
        let pad = "  ".repeat(indent);
        out.push_str(&format!("{}{}:\n", pad, self.name()));
        let info_strings = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (k, v) in info_strings {
            out.push_str(&format!("{}   {}: {}\n", pad, k, v));
        }
        let mut counters = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|c| (c.name.clone(), c.value()))
            .collect::<Vec<_>>();
        counters.sort();
        for (name, value) in counters {
            out.push_str(&format!("{}   {} = {}\n", pad, name, value));
        }
        for child in self.children() {
            child.pretty_print_into(out, indent + 1);
        }
    }
}

pub type CounterRef = Arc<Counter>;

#[derive(Debug)]
pub struct Counter {
    name: String,
    unit: CounterUnit,
    value: AtomicI64,
    min_value: Mutex<Option<i64>>,
    max_value: Mutex<Option<i64>>,
}

impl Counter {
    pub fn new(name: impl Into<String>, unit: CounterUnit) -> Self {
        Self {
            name: name.into(),
            unit,
            value: AtomicI64::new(0),
            min_value: Mutex::new(None),
            max_value: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set_min(&self, min: i64) {
        let mut guard = self.min_value.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(min);
    }

    pub fn set_max(&self, max: i64) {
        let mut guard = self.max_value.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(max);
    }

    fn to_pb(&self) -> pb::PCounter {
        pb::PCounter {
            name: self.name.clone(),
            unit: self.unit as i32,
            value: self.value(),
        }
    }
}

pub struct ScopedTimer {
    counter: CounterRef,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(counter: CounterRef) -> Self {
        Self {
            counter,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        let elapsed_ns = self.start.elapsed().as_nanos();
        self.counter
            .add(crate::common::util::clamp_u128_to_i64(elapsed_ns));
    }
}

fn merge_counter_values(unit: CounterUnit, values: &[i64]) -> (i64, i64, i64) {
    let min_value = values.iter().copied().min().unwrap_or(0);
    let max_value = values.iter().copied().max().unwrap_or(0);
    let n = values.len() as i64;
    let sum = values
        .iter()
        .copied()
        .fold(0i64, |acc, v| acc.saturating_add(v));
    let merged = if unit.averages_on_merge() && n > 0 {
        sum / n
    } else {
        sum
    };
    (merged, min_value, max_value)
}

#[cfg(test)]
mod tests {
    use super::{CounterUnit, RuntimeProfile, TOTAL_TIME_COUNTER};

    fn instance_profile(total_time: i64, rows: i64) -> RuntimeProfile {
        let p = RuntimeProfile::new("Instance");
        p.counter_set(TOTAL_TIME_COUNTER, CounterUnit::TimeNs, total_time);
        let scan = p.child("SCAN (id=0)");
        scan.set_metadata(0);
        scan.counter_set("RowsRead", CounterUnit::Unit, rows);
        p
    }

    #[test]
    fn add_child_is_idempotent_by_name() {
        let root = RuntimeProfile::new("root");
        let child = RuntimeProfile::new("child");
        root.add_child(child.clone());
        root.add_child(child);
        assert_eq!(root.children().len(), 1);
    }

    #[test]
    fn pb_round_trip_preserves_structure() {
        let p = instance_profile(100, 7);
        p.add_info_string("Host", "a:1");
        let tree = p.to_pb_tree();
        assert_eq!(tree.nodes.len(), 2);

        let q = RuntimeProfile::new("Instance");
        q.update(&tree);
        assert_eq!(
            q.get_child("SCAN (id=0)")
                .and_then(|c| c.get_counter("RowsRead"))
                .map(|c| c.value()),
            Some(7)
        );
        assert_eq!(q.get_info_string("Host").as_deref(), Some("a:1"));
    }

    #[test]
    fn update_overwrites_instead_of_accumulating() {
        let p = instance_profile(100, 10);
        let q = RuntimeProfile::new("Instance");
        q.update(&p.to_pb_tree());
        q.update(&p.to_pb_tree());
        assert_eq!(
            q.get_child("SCAN (id=0)")
                .and_then(|c| c.get_counter("RowsRead"))
                .map(|c| c.value()),
            Some(10)
        );
        assert_eq!(q.children().len(), 1);
    }

    #[test]
    fn averaging_averages_time_and_sums_units() {
        let a = instance_profile(100, 10);
        let b = instance_profile(300, 30);
        let avg = RuntimeProfile::new("Averaged Fragment 1");
        avg.update_to_average_of(&[a, b]);
        assert_eq!(
            avg.get_counter(TOTAL_TIME_COUNTER).map(|c| c.value()),
            Some(200)
        );
        assert_eq!(
            avg.get_child("SCAN (id=0)")
                .and_then(|c| c.get_counter("RowsRead"))
                .map(|c| c.value()),
            Some(40)
        );
    }

    #[test]
    fn compute_time_in_profile_derives_local_time() {
        let p = RuntimeProfile::new("root");
        p.counter_set(TOTAL_TIME_COUNTER, CounterUnit::TimeNs, 100);
        let child = p.child("child");
        child.counter_set(TOTAL_TIME_COUNTER, CounterUnit::TimeNs, 70);
        p.compute_time_in_profile();
        assert_eq!(
            p.get_counter(super::LOCAL_TIME_COUNTER).map(|c| c.value()),
            Some(30)
        );
    }

    #[test]
    fn sort_children_orders_by_descending_total_time() {
        let p = RuntimeProfile::new("root");
        let fast = p.child("fast");
        fast.counter_set(TOTAL_TIME_COUNTER, CounterUnit::TimeNs, 10);
        let slow = p.child("slow");
        slow.counter_set(TOTAL_TIME_COUNTER, CounterUnit::TimeNs, 90);
        p.sort_children_by_total_time();
        let names: Vec<String> = p.children().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["slow".to_string(), "fast".to_string()]);
    }
}
