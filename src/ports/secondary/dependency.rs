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

use crate::domain::TargetError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Secondary port - Binary dependency lookup
///
/// Work items name the tools they need (e.g. `turbostat`); the preparer asks
/// this port for a local copy of each one, qualified by target architecture.
#[async_trait]
pub trait DependencyProvider: Send + Sync {
    /// Find a local copy of a dependency
    ///
    /// # Arguments
    /// * `dependency` - Architecture-qualified path, e.g. `x86_64/turbostat`
    /// * `staging_dir` - Per-target scratch directory where bundled files may be extracted
    ///
    /// # Returns
    /// * `Ok(Some(PathBuf))` - Local path of the dependency, ready to push
    /// * `Ok(None)` - The dependency is not available
    /// * `Err(TargetError)` - The dependency exists but could not be staged
    async fn locate(
        &self,
        dependency: &str,
        staging_dir: &Path,
    ) -> Result<Option<PathBuf>, TargetError>;
}
