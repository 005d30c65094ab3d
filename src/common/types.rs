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

use crate::service::pb;

/// Query and fragment-instance identifier.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

impl UniqueId {
    pub fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }

    /// Filesystem-safe rendering, used for per-query staging directories.
    pub fn to_path_string(self) -> String {
        format!("{:x}_{:x}", self.hi as u64, self.lo as u64)
    }

    pub fn to_pb(self) -> pb::PUniqueId {
        pb::PUniqueId {
            hi: self.hi,
            lo: self.lo,
        }
    }

    pub fn from_pb(id: &pb::PUniqueId) -> Self {
        Self {
            hi: id.hi,
            lo: id.lo,
        }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.hi as u64, self.lo as u64)
    }
}

/// Host/port of a backend's internal service.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct NetworkAddress {
    pub hostname: String,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    pub fn to_pb(&self) -> pb::PNetworkAddress {
        pb::PNetworkAddress {
            hostname: self.hostname.clone(),
            port: i32::from(self.port),
        }
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::UniqueId;

    #[test]
    fn unique_id_display_is_hex_pair() {
        let id = UniqueId::new(0x1a2b, 0x3c4d);
        assert_eq!(id.to_string(), "1a2b:3c4d");
        assert_eq!(id.to_path_string(), "1a2b_3c4d");
    }

    #[test]
    fn unique_id_path_string_handles_negative_halves() {
        let id = UniqueId::new(-1, 16);
        assert_eq!(id.to_path_string(), "ffffffffffffffff_10");
    }
}
