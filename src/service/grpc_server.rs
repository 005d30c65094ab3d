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
//! Inbound side of the internal service: workers push ReportExecStatus here
//! and the report is routed to the owning coordinator by query id. The
//! exec/cancel RPCs of the shared service definition are served by workers,
//! not by this process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};

use tonic::transport::Server;
use tonic::{Request, Response};

use crate::common::status::Status;
use crate::common::types::UniqueId;
use crate::pronghorn_logging::{info, warn};
use crate::runtime::coordinator::Coordinator;
use crate::service::pb;
use crate::service::pb::pronghorn_internal_service_server::{
    PronghornInternalService, PronghornInternalServiceServer,
};

const GRPC_MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

static REGISTRY: OnceLock<Mutex<HashMap<UniqueId, Arc<Coordinator>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<UniqueId, Arc<Coordinator>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Make a coordinator reachable for worker status reports. Called by the
/// query driver once Exec succeeded.
pub fn register_coordinator(query_id: UniqueId, coordinator: Arc<Coordinator>) {
    let mut guard = registry().lock().expect("coordinator registry lock");
    guard.insert(query_id, coordinator);
}

pub fn unregister_coordinator(query_id: UniqueId) {
    let mut guard = registry().lock().expect("coordinator registry lock");
    guard.remove(&query_id);
}

fn lookup_coordinator(query_id: UniqueId) -> Option<Arc<Coordinator>> {
    registry()
        .lock()
        .expect("coordinator registry lock")
        .get(&query_id)
        .cloned()
}

#[derive(Default)]
pub struct InternalService;

#[tonic::async_trait]
impl PronghornInternalService for InternalService {
    async fn exec_plan_fragment(
        &self,
        _request: Request<pb::PExecPlanFragmentParams>,
    ) -> Result<Response<pb::PExecPlanFragmentResult>, tonic::Status> {
        Err(tonic::Status::unimplemented(
            "exec_plan_fragment is served by workers",
        ))
    }

    async fn cancel_plan_fragment(
        &self,
        _request: Request<pb::PCancelPlanFragmentParams>,
    ) -> Result<Response<pb::PCancelPlanFragmentResult>, tonic::Status> {
        Err(tonic::Status::unimplemented(
            "cancel_plan_fragment is served by workers",
        ))
    }

    async fn report_exec_status(
        &self,
        request: Request<pb::PReportExecStatusParams>,
    ) -> Result<Response<pb::PReportExecStatusResult>, tonic::Status> {
        let params = request.into_inner();
        let Some(query_id) = params.query_id.as_ref().map(UniqueId::from_pb) else {
            let status = Status::internal_error("report_exec_status missing query_id");
            return Ok(Response::new(pb::PReportExecStatusResult {
                status: Some(status.to_pb()),
            }));
        };

        let Some(coordinator) = lookup_coordinator(query_id) else {
            warn!(
                target: "pronghorn::rpc",
                query_id = %query_id,
                "report_exec_status for unknown query"
            );
            let status = Status::internal_error(format!("unknown query id {query_id}"));
            return Ok(Response::new(pb::PReportExecStatusResult {
                status: Some(status.to_pb()),
            }));
        };

        // Reports take coordinator locks and may block behind Exec.
        let result = tokio::task::spawn_blocking(move || {
            coordinator.update_fragment_exec_status(&params)
        })
        .await
        .map_err(|e| tonic::Status::internal(format!("report task panicked: {e}")))?;

        let status = Status::from_result(&result);
        Ok(Response::new(pb::PReportExecStatusResult {
            status: Some(status.to_pb()),
        }))
    }
}

/// Serve the internal service until the process exits.
pub async fn start_internal_service(addr: SocketAddr) -> Result<(), tonic::transport::Error> {
    info!(
        target: "pronghorn::rpc",
        addr = %addr,
        "starting internal service"
    );
    Server::builder()
        .add_service(
            PronghornInternalServiceServer::new(InternalService)
                .max_encoding_message_size(GRPC_MAX_MESSAGE_BYTES)
                .max_decoding_message_size(GRPC_MAX_MESSAGE_BYTES),
        )
        .serve(addr)
        .await
}
