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

pub mod cancellation;
pub mod controller;
pub mod demux;
pub mod driver;
pub mod execution;
pub mod planner;
pub mod preparer;
pub mod streaming;

#[cfg(test)]
pub(crate) mod testing;

pub use cancellation::{interrupt_all, interrupt_controller, spawn_interrupt_forwarder};
pub use controller::{generate_controller, ControllerScript, BLOCK_DELIMITER};
pub use demux::parse_controller_output;
pub use driver::run_controller;
pub use execution::ScriptExecutionService;
pub use planner::{plan_batch, probe_capabilities};
pub use preparer::{render_script, PreparedTarget, TargetPreparer};
pub use streaming::run_streaming;
