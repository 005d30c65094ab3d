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

/// Error categories carried across the coordinator/worker boundary.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    InternalError = 2,
    RpcError = 3,
    RemoteError = 4,
    FsError = 5,
}

impl StatusCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            3 => StatusCode::RpcError,
            4 => StatusCode::RemoteError,
            5 => StatusCode::FsError,
            _ => StatusCode::InternalError,
        }
    }
}

/// Operation outcome. A query-wide `Status` stays `Ok` until the first fatal
/// error or cancellation and is never reset afterwards; later errors are only
/// appended to the message log of the state that observed them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Status {
    code: StatusCode,
    error_msgs: Vec<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            error_msgs: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            code: StatusCode::Cancelled,
            error_msgs: vec!["Cancelled".to_string()],
        }
    }

    pub fn internal_error(msg: impl Into<String>) -> Self {
        Self::with_code(StatusCode::InternalError, msg)
    }

    pub fn rpc_error(msg: impl Into<String>) -> Self {
        Self::with_code(StatusCode::RpcError, msg)
    }

    pub fn remote_error(msg: impl Into<String>) -> Self {
        Self::with_code(StatusCode::RemoteError, msg)
    }

    pub fn fs_error(msg: impl Into<String>) -> Self {
        Self::with_code(StatusCode::FsError, msg)
    }

    fn with_code(code: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            error_msgs: vec![msg.into()],
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == StatusCode::Cancelled
    }

    pub fn message(&self) -> String {
        self.error_msgs.join("; ")
    }

    pub fn error_msgs(&self) -> &[String] {
        &self.error_msgs
    }

    pub fn add_error_msg(&mut self, msg: impl Into<String>) {
        self.error_msgs.push(msg.into());
    }

    /// Merge another status: adopt it wholesale if this one is still OK,
    /// otherwise keep the original code and append the messages.
    pub fn add_error(&mut self, other: &Status) {
        if other.is_ok() {
            return;
        }
        if self.is_ok() {
            *self = other.clone();
        } else {
            self.error_msgs.extend(other.error_msgs.iter().cloned());
        }
    }

    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() { Ok(()) } else { Err(self) }
    }

    pub fn from_result(result: &Result<(), Status>) -> Status {
        match result {
            Ok(()) => Status::ok(),
            Err(e) => e.clone(),
        }
    }

    pub fn to_pb(&self) -> pb::PStatus {
        pb::PStatus {
            status_code: self.code as i32,
            error_msgs: self.error_msgs.clone(),
        }
    }

    pub fn from_pb(status: &pb::PStatus) -> Self {
        Self {
            code: StatusCode::from_i32(status.status_code),
            error_msgs: status.error_msgs.clone(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            write!(f, "OK")
        } else {
            write!(f, "{:?}: {}", self.code, self.message())
        }
    }
}
