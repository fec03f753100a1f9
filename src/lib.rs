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

//! Script Runner Library
//!
//! This library runs batches of diagnostic shell scripts on the local host or on
//! remote hosts reached over ssh, and collects each script's stdout, stderr and
//! exit code. It uses a Ports and Adapters (Hexagonal) architecture.
//!
//! # Architecture
//!
//! - **Domain**: Work items, planning, controller generation and output parsing
//! - **Ports**: The execution service interface and the target/dependency/config interfaces
//! - **Adapters**: Local and ssh targets, on-disk dependency lookup, TOML configuration
//!
//! A batch is split into a concurrent group and a sequential group, a bash
//! controller script is generated that runs both groups on the target, and the
//! controller's delimited output is parsed back into one result per script.
//!
//! # Usage
//!
//! ```rust,no_run
//! use script_runner::{ServiceContainer, WorkItem};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let container = ServiceContainer::default();
//!     let target = container.create_target("admin@node7")?;
//!     let service = container.create_execution_service();
//!
//!     let items = vec![
//!         WorkItem::new("kernel", "uname -a"),
//!         WorkItem::new("dmesg", "dmesg").privileged(),
//!     ];
//!     let results = service.run_scripts(target.as_ref(), &items).await?;
//!     for (name, result) in &results {
//!         println!("{}: exit {}", name, result.exit_code);
//!     }
//!     target.remove_temp_directory().await?;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod container;
pub mod domain;
pub mod ports;

pub use adapters::{
    FileSystemDependencyProvider, LocalTarget, RemoteConnection, RemoteTarget,
    TomlConfigurationProvider,
};
pub use container::{ContainerConfig, ContainerConfigBuilder, ServiceContainer};
pub use domain::{
    applicable, ConfigError, ExecutionConfig, ExecutionConfigBuilder, ExecutionError,
    ExecutionResult, RegistryError, TargetError, TargetProfile, WorkItem, WorkItemRegistry,
    INDETERMINATE_EXIT_CODE, INTERRUPTED_EXIT_CODE,
};
pub use ports::{
    CommandOutput, ConfigurationProvider, DependencyProvider, ProcessHandle, RunOptions,
    ScriptRunningService, Signal, StreamSinks, Target, TargetCommand,
};
