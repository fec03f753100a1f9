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

//! TOML file configuration adapter

use crate::domain::{ConfigError, ExecutionConfig};
use crate::ports::ConfigurationProvider;
use async_trait::async_trait;
use std::path::PathBuf;

/// Reads execution settings from a TOML file
pub struct TomlConfigurationProvider {
    path: PathBuf,
}

impl TomlConfigurationProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigurationProvider for TomlConfigurationProvider {
    async fn get_execution_config(&self) -> Result<ExecutionConfig, ConfigError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ConfigError::ReadFailed {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;
        ExecutionConfig::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[tokio::test]
    async fn test_reads_file() {
        let dir = assert_fs::TempDir::new().unwrap();
        let file = dir.child("runner.toml");
        file.write_str("fail_if_dependency_not_found = true\ninterrupt_grace_secs = 30\n")
            .unwrap();

        let config = TomlConfigurationProvider::new(file.path())
            .get_execution_config()
            .await
            .unwrap();
        assert!(config.fail_if_dependency_not_found);
        assert_eq!(config.interrupt_grace_secs, 30);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let result = TomlConfigurationProvider::new("/definitely/not/here.toml")
            .get_execution_config()
            .await;
        assert!(matches!(result, Err(ConfigError::ReadFailed { .. })));
    }
}
