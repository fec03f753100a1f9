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

//! Stages scripts, dependencies and kernel modules on a target

use crate::domain::{ExecutionConfig, ExecutionError, InstalledModules, WorkItem};
use crate::ports::{DependencyProvider, Target};
use log::{debug, info, warn};
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything `prepare` put in place on the target
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTarget {
    /// Target temp directory holding the pushed scripts and dependencies
    pub temp_dir: String,
    /// Local per-target scratch directory
    pub local_dir: PathBuf,
    /// Modules this batch loaded; the caller must unload exactly these
    pub installed_modules: InstalledModules,
}

/// Domain service that readies a target for a batch of work items
pub struct TargetPreparer {
    dependencies: Arc<dyn DependencyProvider>,
    config: ExecutionConfig,
}

impl TargetPreparer {
    /// Create a new target preparer
    ///
    /// # Arguments
    /// * `dependencies` - Lookup for binary dependencies
    /// * `config` - Execution settings (scratch dir, dependency policy, temp root)
    pub fn new(dependencies: Arc<dyn DependencyProvider>, config: ExecutionConfig) -> Self {
        Self {
            dependencies,
            config,
        }
    }

    /// Local scratch directory for a target
    pub fn local_dir(&self, target: &dyn Target) -> PathBuf {
        self.config
            .scratch_dir
            .join(target.name().replace(['/', '\\'], "_"))
    }

    /// Push scripts and dependencies for `items`, then load their kernel modules.
    ///
    /// # Returns
    /// * `Ok(PreparedTarget)` - Paths used and the modules newly loaded
    /// * `Err(ExecutionError)` - Transport failure, required dependency missing, or module load failure
    pub async fn prepare(
        &self,
        target: &dyn Target,
        items: &[WorkItem],
    ) -> Result<PreparedTarget, ExecutionError> {
        self.prepare_items(target, items, self.config.fail_if_dependency_not_found)
            .await
    }

    /// Like [`prepare`](Self::prepare), but a missing dependency is always an error.
    pub async fn prepare_strict(
        &self,
        target: &dyn Target,
        items: &[WorkItem],
    ) -> Result<PreparedTarget, ExecutionError> {
        self.prepare_items(target, items, true).await
    }

    async fn prepare_items(
        &self,
        target: &dyn Target,
        items: &[WorkItem],
        fail_if_dependency_not_found: bool,
    ) -> Result<PreparedTarget, ExecutionError> {
        let temp_dir = match target.temp_directory() {
            Some(dir) => dir,
            None => {
                target
                    .create_temp_directory(&self.config.target_temp_root)
                    .await?
            }
        };
        let user_path = target.user_path().await?;
        let architecture = target.architecture().await?;

        let local_dir = self.local_dir(target);
        tokio::fs::create_dir_all(&local_dir).await.map_err(|e| {
            ExecutionError::Preparation(format!(
                "failed to create scratch directory {}: {}",
                local_dir.display(),
                e
            ))
        })?;

        let mut modules: Vec<String> = Vec::new();
        let mut dependencies: Vec<String> = Vec::new();
        for item in items {
            for module in &item.required_modules {
                if !modules.contains(module) {
                    modules.push(module.clone());
                }
            }
            for binary in &item.required_binaries {
                let qualified = format!("{architecture}/{binary}");
                if !dependencies.contains(&qualified) {
                    dependencies.push(qualified);
                }
            }

            let script = render_script(item, &temp_dir, &user_path);
            let local_path = local_dir.join(item.script_file_name());
            tokio::fs::write(&local_path, script).await.map_err(|e| {
                ExecutionError::Preparation(format!(
                    "failed to write script {}: {}",
                    local_path.display(),
                    e
                ))
            })?;
            target.push_file(&local_path, &temp_dir).await?;
            debug!("pushed script '{}' to {}:{}", item.name, target.name(), temp_dir);
        }

        for dependency in &dependencies {
            match self.dependencies.locate(dependency, &local_dir).await? {
                Some(path) => {
                    target.push_file(&path, &temp_dir).await?;
                    debug!("pushed dependency {} to {}", dependency, target.name());
                }
                None if fail_if_dependency_not_found => {
                    return Err(ExecutionError::DependencyNotFound(dependency.clone()));
                }
                None => warn!(
                    "dependency not found, scripts that need it will likely fail: target={}, dependency={}",
                    target.name(),
                    dependency
                ),
            }
        }

        let installed_modules = if modules.is_empty() {
            InstalledModules::default()
        } else {
            let installed = target
                .install_modules(&modules)
                .await
                .map_err(|e| ExecutionError::ModuleInstall(e.to_string()))?;
            if !installed.is_empty() {
                info!("loaded kernel modules on {}: {}", target.name(), installed.join(", "));
            }
            InstalledModules::new(installed)
        };

        Ok(PreparedTarget {
            temp_dir,
            local_dir,
            installed_modules,
        })
    }

    /// Unload modules a batch loaded; failures are logged, not returned
    pub async fn cleanup(&self, target: &dyn Target, installed: &InstalledModules) {
        if installed.is_empty() {
            return;
        }
        if let Err(e) = target.uninstall_modules(installed.names()).await {
            warn!(
                "failed to unload kernel modules on {}: {}: {}",
                target.name(),
                installed.names().join(", "),
                e
            );
        }
    }
}

/// Render a work item as a standalone script that runs inside the target temp directory
pub fn render_script(item: &WorkItem, temp_dir: &str, user_path: &str) -> String {
    let path = if user_path.is_empty() {
        temp_dir.to_string()
    } else {
        format!("{temp_dir}:{user_path}")
    };
    format!(
        "#!/usr/bin/env bash\nexport PATH={}\ncd {} || exit 1\n{}\n",
        shell_escape::unix::escape(Cow::Owned(path)),
        shell_escape::unix::escape(Cow::Borrowed(temp_dir)),
        item.body
    )
}
