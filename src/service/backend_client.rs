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
//! Outbound worker RPC clients. Channels are cached per backend address; a
//! backend that restarted leaves a stale cached channel behind, so callers
//! retry transport failures once through `reopen`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::common::config::{rpc_connect_timeout_ms, rpc_timeout_ms};
use crate::common::status::Status;
use crate::common::types::NetworkAddress;
use crate::pronghorn_logging::debug;
use crate::service::pb;
use crate::service::pb::pronghorn_internal_service_client::PronghornInternalServiceClient;

const GRPC_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Transport-level RPC failure. Application-level errors travel inside the
/// result messages instead.
#[derive(Clone, Debug)]
pub struct RpcError {
    pub message: String,
}

impl RpcError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub trait BackendClient: Send + Sync {
    fn exec_plan_fragment(
        &self,
        params: &pb::PExecPlanFragmentParams,
    ) -> Result<pb::PExecPlanFragmentResult, RpcError>;

    fn cancel_plan_fragment(
        &self,
        params: &pb::PCancelPlanFragmentParams,
    ) -> Result<pb::PCancelPlanFragmentResult, RpcError>;
}

/// Per-address client cache. `reopen` drops the cached connection and
/// dials again; callers use it after the first transport failure.
pub trait BackendClientCache: Send + Sync {
    fn get_client(&self, addr: &NetworkAddress) -> Result<Arc<dyn BackendClient>, Status>;

    fn reopen(&self, addr: &NetworkAddress) -> Result<Arc<dyn BackendClient>, Status>;
}

fn client_runtime() -> &'static tokio::runtime::Runtime {
    static RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RT.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(4)
            .thread_name("backend_rpc")
            .build()
            .expect("build tokio runtime")
    })
}

#[derive(Default)]
pub struct GrpcBackendClientCache {
    channels: Mutex<HashMap<String, Channel>>,
}

impl GrpcBackendClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn connect(&self, addr: &NetworkAddress) -> Result<Channel, Status> {
        debug!(
            target: "pronghorn::rpc",
            addr = %addr,
            "opening backend channel"
        );
        let endpoint = format!("http://{}:{}", addr.hostname, addr.port)
            .parse::<Endpoint>()
            .map_err(|e| Status::rpc_error(format!("invalid backend endpoint {addr}: {e}")))?
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_millis(rpc_timeout_ms()))
            .connect_timeout(Duration::from_millis(rpc_connect_timeout_ms()));

        client_runtime()
            .block_on(endpoint.connect())
            .map_err(|e| Status::rpc_error(format!("connect to backend {addr} failed: {e}")))
    }
}

impl BackendClientCache for GrpcBackendClientCache {
    fn get_client(&self, addr: &NetworkAddress) -> Result<Arc<dyn BackendClient>, Status> {
        let key = addr.to_string();
        if let Some(ch) = self
            .channels
            .lock()
            .expect("backend channel cache lock")
            .get(&key)
            .cloned()
        {
            return Ok(Arc::new(GrpcBackendClient { channel: ch }));
        }
        let ch = self.connect(addr)?;
        self.channels
            .lock()
            .expect("backend channel cache lock")
            .insert(key, ch.clone());
        Ok(Arc::new(GrpcBackendClient { channel: ch }))
    }

    fn reopen(&self, addr: &NetworkAddress) -> Result<Arc<dyn BackendClient>, Status> {
        self.channels
            .lock()
            .expect("backend channel cache lock")
            .remove(&addr.to_string());
        self.get_client(addr)
    }
}

struct GrpcBackendClient {
    channel: Channel,
}

impl GrpcBackendClient {
    fn client(&self) -> PronghornInternalServiceClient<Channel> {
        PronghornInternalServiceClient::new(self.channel.clone())
            .max_encoding_message_size(GRPC_MAX_MESSAGE_BYTES)
            .max_decoding_message_size(GRPC_MAX_MESSAGE_BYTES)
    }
}

impl BackendClient for GrpcBackendClient {
    fn exec_plan_fragment(
        &self,
        params: &pb::PExecPlanFragmentParams,
    ) -> Result<pb::PExecPlanFragmentResult, RpcError> {
        let mut client = self.client();
        let request = params.clone();
        client_runtime()
            .block_on(client.exec_plan_fragment(request))
            .map(|resp| resp.into_inner())
            .map_err(|e| RpcError::new(e.to_string()))
    }

    fn cancel_plan_fragment(
        &self,
        params: &pb::PCancelPlanFragmentParams,
    ) -> Result<pb::PCancelPlanFragmentResult, RpcError> {
        let mut client = self.client();
        let request = params.clone();
        client_runtime()
            .block_on(client.cancel_plan_fragment(request))
            .map(|resp| resp.into_inner())
            .map_err(|e| RpcError::new(e.to_string()))
    }
}
