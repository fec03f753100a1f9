/*
Copyright 2024 San Francisco Compute Company

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use crate::domain::services::controller::generate_controller;
use crate::domain::services::driver::run_controller;
use crate::domain::services::planner::{plan_batch, probe_capabilities};
use crate::domain::services::preparer::TargetPreparer;
use crate::domain::services::streaming::run_streaming;
use crate::domain::{ExecutionConfig, ExecutionError, ExecutionResult, WorkItem};
use crate::ports::{DependencyProvider, ScriptRunningService, StreamSinks, Target};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Domain service that implements batch script execution
///
/// This service plans a batch, stages it on the target, runs it through a
/// single controller and splits the controller's output into per-item results.
pub struct ScriptExecutionService {
    preparer: TargetPreparer,
    config: ExecutionConfig,
    /// Once cancelled, batches that have not started their controller return no results
    cancellation: CancellationToken,
}

impl ScriptExecutionService {
    /// Create a new script execution service
    ///
    /// # Arguments
    /// * `dependencies` - Lookup for binary dependencies
    /// * `config` - Execution settings
    pub fn new(dependencies: Arc<dyn DependencyProvider>, config: ExecutionConfig) -> Self {
        Self {
            preparer: TargetPreparer::new(dependencies, config.clone()),
            config,
            cancellation: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with an interrupt forwarder
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

#[async_trait]
impl ScriptRunningService for ScriptExecutionService {
    async fn run_scripts(
        &self,
        target: &dyn Target,
        items: &[WorkItem],
    ) -> Result<HashMap<String, ExecutionResult>, ExecutionError> {
        let capabilities = probe_capabilities(target).await;
        let batch = plan_batch(items, capabilities)?;
        info!(
            "running {} scripts on {} ({} concurrent, {} sequential)",
            batch.len(),
            target.name(),
            batch.concurrent.len(),
            batch.sequential.len()
        );

        if self.cancellation.is_cancelled() {
            warn!("interrupted before staging scripts on {}", target.name());
            return Ok(HashMap::new());
        }
        let all: Vec<WorkItem> = batch.all_items().cloned().collect();
        let prepared = self.preparer.prepare(target, &all).await?;

        let result = async {
            if self.cancellation.is_cancelled() {
                warn!("interrupted before the controller started on {}", target.name());
                return Ok(HashMap::new());
            }
            let controller = generate_controller(
                &prepared.temp_dir,
                &batch.concurrent,
                &batch.sequential,
                self.config.continue_on_sequential_error,
            )?;
            run_controller(
                target,
                &prepared.temp_dir,
                &prepared.local_dir,
                &controller,
                capabilities,
            )
            .await
        }
        .await;

        // modules come off whether or not the controller succeeded
        self.preparer
            .cleanup(target, &prepared.installed_modules)
            .await;

        let results = result?;
        debug!(
            "collected {} of {} results from {}",
            results.len(),
            batch.len(),
            target.name()
        );
        Ok(results)
    }

    async fn run_script(
        &self,
        target: &dyn Target,
        item: &WorkItem,
    ) -> Result<ExecutionResult, ExecutionError> {
        let mut results = self
            .run_scripts(target, std::slice::from_ref(item))
            .await?;
        results
            .remove(&item.name)
            .ok_or_else(|| ExecutionError::OutputMissing(item.name.clone()))
    }

    async fn run_script_stream(
        &self,
        target: &dyn Target,
        item: &WorkItem,
        sinks: StreamSinks,
    ) -> Result<(), ExecutionError> {
        run_streaming(&self.preparer, target, item, sinks).await
    }
}
