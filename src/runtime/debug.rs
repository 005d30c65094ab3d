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
//! Fault-injection directives carried in the `debug_action` query option and
//! forwarded to fragment instances through their exec params.

/// Exec-node lifecycle phase a debug action is anchored to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum ExecNodePhase {
    Invalid = 0,
    Prepare = 1,
    Open = 2,
    GetNext = 3,
    Close = 4,
}

impl ExecNodePhase {
    fn parse(key: &str) -> Self {
        match key.to_ascii_lowercase().as_str() {
            "prepare" => ExecNodePhase::Prepare,
            "open" => ExecNodePhase::Open,
            "getnext" => ExecNodePhase::GetNext,
            "close" => ExecNodePhase::Close,
            _ => ExecNodePhase::Invalid,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum DebugAction {
    Wait = 0,
    Fail = 1,
}

impl DebugAction {
    fn parse(key: &str) -> Self {
        match key.to_ascii_lowercase().as_str() {
            "fail" => DebugAction::Fail,
            // unknown actions silently degrade to WAIT
            _ => DebugAction::Wait,
        }
    }
}

/// Parsed `[backend_num:]node_id:phase:action` directive.
/// `backend_num == -1` applies the directive to every instance.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DebugOptions {
    pub backend_num: i32,
    pub node_id: i32,
    pub phase: ExecNodePhase,
    pub action: DebugAction,
}

impl DebugOptions {
    /// Returns `None` for directives that silently degrade: wrong arity or
    /// an unknown phase. The CLOSE:WAIT pair is rejected by `Coordinator::exec`
    /// because workers cannot be cancelled inside Close.
    pub fn parse(directive: &str) -> Option<DebugOptions> {
        if directive.is_empty() {
            return None;
        }
        let components: Vec<&str> = directive.split(':').collect();
        if components.len() < 3 || components.len() > 4 {
            return None;
        }
        let opts = if components.len() == 3 {
            DebugOptions {
                backend_num: -1,
                node_id: components[0].parse().unwrap_or(-1),
                phase: ExecNodePhase::parse(components[1]),
                action: DebugAction::parse(components[2]),
            }
        } else {
            DebugOptions {
                backend_num: components[0].parse().unwrap_or(-1),
                node_id: components[1].parse().unwrap_or(-1),
                phase: ExecNodePhase::parse(components[2]),
                action: DebugAction::parse(components[3]),
            }
        };
        if opts.phase == ExecNodePhase::Invalid {
            return None;
        }
        Some(opts)
    }

    pub fn applies_to_backend(&self, backend_num: usize) -> bool {
        self.backend_num < 0 || self.backend_num as usize == backend_num
    }
}

#[cfg(test)]
mod tests {
    use super::{DebugAction, DebugOptions, ExecNodePhase};

    #[test]
    fn parses_three_part_directive_for_all_backends() {
        let opts = DebugOptions::parse("5:OPEN:FAIL").expect("valid directive");
        assert_eq!(opts.backend_num, -1);
        assert_eq!(opts.node_id, 5);
        assert_eq!(opts.phase, ExecNodePhase::Open);
        assert_eq!(opts.action, DebugAction::Fail);
        assert!(opts.applies_to_backend(0));
        assert!(opts.applies_to_backend(17));
    }

    #[test]
    fn parses_four_part_directive_for_one_backend() {
        let opts = DebugOptions::parse("2:5:prepare:wait").expect("valid directive");
        assert_eq!(opts.backend_num, 2);
        assert!(!opts.applies_to_backend(0));
        assert!(opts.applies_to_backend(2));
        assert_eq!(opts.phase, ExecNodePhase::Prepare);
        assert_eq!(opts.action, DebugAction::Wait);
    }

    #[test]
    fn wrong_arity_and_unknown_phase_degrade_silently() {
        assert_eq!(DebugOptions::parse(""), None);
        assert_eq!(DebugOptions::parse("5:OPEN"), None);
        assert_eq!(DebugOptions::parse("1:2:3:4:5"), None);
        assert_eq!(DebugOptions::parse("5:FROBNICATE:FAIL"), None);
    }

    #[test]
    fn unknown_action_degrades_to_wait() {
        let opts = DebugOptions::parse("5:GETNEXT:explode").expect("valid directive");
        assert_eq!(opts.action, DebugAction::Wait);
    }
}
