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

use crate::domain::{ExecutionError, ExecutionResult, WorkItem};
use crate::ports::{StreamSinks, Target};
use async_trait::async_trait;
use std::collections::HashMap;

/// Primary port - Main interface offered by the script execution domain
///
/// This is what external systems (CLI, report generators, library consumers) use
/// to run work items on a target.
#[async_trait]
pub trait ScriptRunningService: Send + Sync {
    /// Run a batch of work items on a target
    ///
    /// # Arguments
    /// * `target` - Where to run
    /// * `items` - Work items; privileged items are dropped if the target can't elevate
    ///
    /// # Returns
    /// * `Ok(HashMap)` - Results keyed by original name; a missing key means unknown/failed
    /// * `Err(ExecutionError)` - Planning, preparation or transport failure
    async fn run_scripts(
        &self,
        target: &dyn Target,
        items: &[WorkItem],
    ) -> Result<HashMap<String, ExecutionResult>, ExecutionError>;

    /// Run a single work item and return its result
    ///
    /// # Returns
    /// * `Ok(ExecutionResult)` - The item's result
    /// * `Err(ExecutionError)` - As for `run_scripts`, or `OutputMissing` when no result was produced
    async fn run_script(
        &self,
        target: &dyn Target,
        item: &WorkItem,
    ) -> Result<ExecutionResult, ExecutionError>;

    /// Run a single work item, streaming its output as it is produced
    ///
    /// The process handle is delivered through `sinks.process` before the item
    /// finishes so the caller can cancel it.
    ///
    /// # Returns
    /// * `Ok(())` - The item ran to completion (or was cancelled) and its exit code was sent
    /// * `Err(ExecutionError)` - Preparation or transport failure
    async fn run_script_stream(
        &self,
        target: &dyn Target,
        item: &WorkItem,
        sinks: StreamSinks,
    ) -> Result<(), ExecutionError>;
}
