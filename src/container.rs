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

//! Dependency injection container for script execution services

use crate::adapters::{
    FileSystemDependencyProvider, LocalTarget, RemoteConnection, RemoteTarget,
};
use crate::domain::{ConfigError, ExecutionConfig, ScriptExecutionService};
use crate::ports::{ConfigurationProvider, DependencyProvider, ScriptRunningService, Target};
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Configuration for the dependency injection container
#[derive(Clone, Default)]
pub struct ContainerConfig {
    /// Execution settings handed to the services
    pub execution: ExecutionConfig,
    /// Password for `sudo -S` on the local host
    pub sudo_password: Option<String>,
    /// Private key for remote targets
    pub ssh_key: Option<PathBuf>,
    /// Password for remote targets (used through sshpass)
    pub ssh_password: Option<String>,
}

fn mask(secret: &Option<String>) -> Option<&'static str> {
    secret.as_ref().map(|_| "******")
}

impl fmt::Debug for ContainerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerConfig")
            .field("execution", &self.execution)
            .field("sudo_password", &mask(&self.sudo_password))
            .field("ssh_key", &self.ssh_key)
            .field("ssh_password", &mask(&self.ssh_password))
            .finish()
    }
}

/// Configuration provider serving a fixed configuration
pub struct StaticConfigurationProvider {
    config: ExecutionConfig,
}

impl StaticConfigurationProvider {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl ConfigurationProvider for StaticConfigurationProvider {
    async fn get_execution_config(&self) -> Result<ExecutionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config.clone())
    }
}

/// Dependency injection container
pub struct ServiceContainer {
    config: ContainerConfig,
    cancellation: CancellationToken,
}

impl ServiceContainer {
    /// Create a new service container with configuration
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            cancellation: CancellationToken::new(),
        }
    }

    /// Token shared by every execution service this container creates
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Create the dependency provider
    pub fn create_dependency_provider(&self) -> Arc<dyn DependencyProvider> {
        Arc::new(FileSystemDependencyProvider::new(
            self.config.execution.tools_dir.clone(),
            self.config.execution.resources_dir.clone(),
        ))
    }

    /// Create the local host target
    pub fn create_local_target(&self) -> Arc<dyn Target> {
        Arc::new(LocalTarget::new(
            self.config.sudo_password.clone(),
            self.config.execution.module_command_timeout(),
        ))
    }

    /// Create a target from `local` or `[user@]host[:port]`
    pub fn create_target(&self, spec: &str) -> Result<Arc<dyn Target>, Box<dyn Error>> {
        if spec == "local" || spec == "localhost" {
            return Ok(self.create_local_target());
        }
        let mut connection = RemoteConnection::parse(spec)?;
        connection.key = self.config.ssh_key.clone();
        connection.password = self.config.ssh_password.clone();
        Ok(Arc::new(RemoteTarget::new(
            connection,
            self.config.execution.scratch_dir.clone(),
            self.config.execution.module_command_timeout(),
        )))
    }

    /// Create the configuration provider
    pub fn create_configuration_provider(&self) -> Arc<dyn ConfigurationProvider> {
        Arc::new(StaticConfigurationProvider::new(
            self.config.execution.clone(),
        ))
    }

    /// Create the complete script execution service
    pub fn create_execution_service(&self) -> Arc<dyn ScriptRunningService> {
        Arc::new(
            ScriptExecutionService::new(
                self.create_dependency_provider(),
                self.config.execution.clone(),
            )
            .with_cancellation(self.cancellation()),
        )
    }
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new(ContainerConfig::default())
    }
}

/// Builder pattern for container configuration
pub struct ContainerConfigBuilder {
    config: ContainerConfig,
}

impl ContainerConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            config: ContainerConfig::default(),
        }
    }

    /// Set execution settings
    pub fn execution(mut self, execution: ExecutionConfig) -> Self {
        self.config.execution = execution;
        self
    }

    /// Set the local sudo password
    pub fn sudo_password(mut self, password: Option<String>) -> Self {
        self.config.sudo_password = password;
        self
    }

    /// Set the ssh private key
    pub fn ssh_key(mut self, key: Option<PathBuf>) -> Self {
        self.config.ssh_key = key;
        self
    }

    /// Set the ssh password
    pub fn ssh_password(mut self, password: Option<String>) -> Self {
        self.config.ssh_password = password;
        self
    }

    /// Build the configuration
    pub fn build(self) -> ContainerConfig {
        self.config
    }
}

impl Default for ContainerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
