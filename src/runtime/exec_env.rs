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
//! Process-wide execution environment shared by all coordinators: the worker
//! client cache, the RPC fan-out pool, the filesystem driver, and the factory
//! producing in-process executors for coordinator fragments.

use std::sync::Arc;

use threadpool::ThreadPool;

use crate::common::config::exec_rpc_threads;
use crate::common::types::NetworkAddress;
use crate::fs::bulk::FsExecutor;
use crate::runtime::fragment_executor::FragmentExecutor;
use crate::service::backend_client::BackendClientCache;

pub type FragmentExecutorFactory = Box<dyn Fn() -> Arc<dyn FragmentExecutor> + Send + Sync>;

pub struct ExecEnv {
    coord_address: NetworkAddress,
    client_cache: Arc<dyn BackendClientCache>,
    exec_rpc_pool: ThreadPool,
    fs: Arc<FsExecutor>,
    executor_factory: FragmentExecutorFactory,
}

impl ExecEnv {
    pub fn new(
        coord_address: NetworkAddress,
        client_cache: Arc<dyn BackendClientCache>,
        fs: Arc<FsExecutor>,
        executor_factory: FragmentExecutorFactory,
    ) -> Self {
        let exec_rpc_pool =
            ThreadPool::with_name("exec_rpc".to_string(), exec_rpc_threads().max(1));
        Self {
            coord_address,
            client_cache,
            exec_rpc_pool,
            fs,
            executor_factory,
        }
    }

    pub fn coord_address(&self) -> &NetworkAddress {
        &self.coord_address
    }

    pub fn client_cache(&self) -> &Arc<dyn BackendClientCache> {
        &self.client_cache
    }

    pub fn exec_rpc_pool(&self) -> &ThreadPool {
        &self.exec_rpc_pool
    }

    pub fn fs(&self) -> &Arc<FsExecutor> {
        &self.fs
    }

    pub fn create_fragment_executor(&self) -> Arc<dyn FragmentExecutor> {
        (self.executor_factory)()
    }
}
