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
use std::fmt;
use std::sync::OnceLock;

use chrono::Local;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

use crate::common::app_config;

static INIT: OnceLock<()> = OnceLock::new();

// One event per line:
//   2026-08-02 14:03:05.123456 INFO  [pronghorn::coord] coordinator.rs:224 (exec_rpc) msg fields
// The bracketed tag is the event target; this codebase scopes targets by
// subsystem (pronghorn::coord, pronghorn::rpc, pronghorn::finalize, ...),
// so the tag names the component a line came from. The thread name appears
// only for named pool threads.
struct EventLineFormatter;

fn file_basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

impl<S, N> FormatEvent<S, N> for EventLineFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &tracing_fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        write!(
            writer,
            "{} {:<5} [{}] ",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            metadata.level(),
            metadata.target()
        )?;
        if let (Some(file), Some(line)) = (metadata.file(), metadata.line()) {
            write!(writer, "{}:{} ", file_basename(file), line)?;
        }
        if let Some(name) = std::thread::current().name() {
            write!(writer, "({name}) ")?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

pub fn init_with_level(filter: &str) {
    INIT.get_or_init(|| {
        // ANSI escapes only when stderr is a terminal.
        let use_ansi = atty::is(atty::Stream::Stderr);
        let _ = tracing_fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_writer(std::io::stderr)
            .with_ansi(use_ansi)
            .event_format(EventLineFormatter)
            .try_init();
    });
}

/// Initialize from the loaded config's `log_filter`/`log_level`; info-level
/// output when no config file is present.
pub fn init_from_config() {
    let filter = app_config::config()
        .map(|c| c.effective_log_filter())
        .unwrap_or_else(|_| "info".to_string());
    init_with_level(&filter);
}

pub fn init() {
    init_with_level("info");
}

pub use tracing::{debug, error, info, trace, warn};
