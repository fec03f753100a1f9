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

//! Dependency lookup in a tools directory and a resource bundle on disk

use crate::adapters::secondary::target::common::copy_tree;
use crate::domain::TargetError;
use crate::ports::DependencyProvider;
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};

/// Finds dependencies in an optional tools directory, then in the resource bundle
pub struct FileSystemDependencyProvider {
    tools_dir: Option<PathBuf>,
    resources_dir: PathBuf,
}

impl FileSystemDependencyProvider {
    /// Create a provider
    ///
    /// # Arguments
    /// * `tools_dir` - Checked first, for `<arch>/<name>` and then `<name>`
    /// * `resources_dir` - Bundle laid out as `<arch>/<name>`; hits are copied to the staging directory
    pub fn new(tools_dir: Option<PathBuf>, resources_dir: PathBuf) -> Self {
        Self {
            tools_dir,
            resources_dir,
        }
    }

    /// Some(true) for a directory, Some(false) for a file, None when absent
    async fn kind(path: &Path) -> Option<bool> {
        tokio::fs::metadata(path).await.ok().map(|meta| meta.is_dir())
    }
}

#[async_trait]
impl DependencyProvider for FileSystemDependencyProvider {
    async fn locate(
        &self,
        dependency: &str,
        staging_dir: &Path,
    ) -> Result<Option<PathBuf>, TargetError> {
        let file_name = Path::new(dependency)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(dependency));

        if let Some(tools_dir) = &self.tools_dir {
            for candidate in [tools_dir.join(dependency), tools_dir.join(&file_name)] {
                if Self::kind(&candidate).await.is_some() {
                    debug!("using {} from tools directory", candidate.display());
                    return Ok(Some(candidate));
                }
            }
        }

        let bundled = self.resources_dir.join(dependency);
        let Some(is_dir) = Self::kind(&bundled).await else {
            return Ok(None);
        };
        tokio::fs::create_dir_all(staging_dir).await?;
        let staged = staging_dir.join(&file_name);
        // copy keeps the executable bit
        if is_dir {
            copy_tree(&bundled, &staged).await?;
        } else {
            tokio::fs::copy(&bundled, &staged).await?;
        }
        debug!("staged {} at {}", bundled.display(), staged.display());
        Ok(Some(staged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use predicates::prelude::*;

    #[tokio::test]
    async fn test_tools_directory_wins() {
        let tools = assert_fs::TempDir::new().unwrap();
        let resources = assert_fs::TempDir::new().unwrap();
        let staging = assert_fs::TempDir::new().unwrap();
        tools.child("turbostat").write_str("tools copy").unwrap();
        resources.child("x86_64/turbostat").write_str("bundled").unwrap();

        let provider = FileSystemDependencyProvider::new(
            Some(tools.path().to_path_buf()),
            resources.path().to_path_buf(),
        );
        let found = provider
            .locate("x86_64/turbostat", staging.path())
            .await
            .unwrap();
        assert_eq!(found, Some(tools.path().join("turbostat")));
        staging.child("turbostat").assert(predicate::path::missing());
    }

    #[tokio::test]
    async fn test_bundle_is_staged() {
        let resources = assert_fs::TempDir::new().unwrap();
        let staging = assert_fs::TempDir::new().unwrap();
        resources.child("aarch64/spe-tool").write_str("bundled").unwrap();

        let provider = FileSystemDependencyProvider::new(None, resources.path().to_path_buf());
        let found = provider
            .locate("aarch64/spe-tool", &staging.path().join("host"))
            .await
            .unwrap();
        assert_eq!(found, Some(staging.path().join("host").join("spe-tool")));
        staging
            .child("host/spe-tool")
            .assert(predicate::str::contains("bundled"));
    }

    #[tokio::test]
    async fn test_directory_bundle_is_staged() {
        let resources = assert_fs::TempDir::new().unwrap();
        let staging = assert_fs::TempDir::new().unwrap();
        resources
            .child("x86_64/async-profiler/bin/asprof")
            .write_str("launcher")
            .unwrap();
        resources
            .child("x86_64/async-profiler/lib/libasyncProfiler.so")
            .write_str("elf")
            .unwrap();

        let provider = FileSystemDependencyProvider::new(None, resources.path().to_path_buf());
        let found = provider
            .locate("x86_64/async-profiler", staging.path())
            .await
            .unwrap();
        assert_eq!(found, Some(staging.path().join("async-profiler")));
        staging
            .child("async-profiler/bin/asprof")
            .assert(predicate::str::contains("launcher"));
        staging
            .child("async-profiler/lib/libasyncProfiler.so")
            .assert(predicate::path::is_file());
    }

    #[tokio::test]
    async fn test_tools_directory_holds_directory_dependency() {
        let tools = assert_fs::TempDir::new().unwrap();
        let resources = assert_fs::TempDir::new().unwrap();
        let staging = assert_fs::TempDir::new().unwrap();
        tools.child("async-profiler/bin/asprof").write_str("tools").unwrap();

        let provider = FileSystemDependencyProvider::new(
            Some(tools.path().to_path_buf()),
            resources.path().to_path_buf(),
        );
        assert_eq!(
            provider
                .locate("x86_64/async-profiler", staging.path())
                .await
                .unwrap(),
            Some(tools.path().join("async-profiler"))
        );
    }

    #[tokio::test]
    async fn test_missing_dependency() {
        let resources = assert_fs::TempDir::new().unwrap();
        let staging = assert_fs::TempDir::new().unwrap();
        let provider = FileSystemDependencyProvider::new(None, resources.path().to_path_buf());
        assert_eq!(
            provider.locate("x86_64/nope", staging.path()).await.unwrap(),
            None
        );
    }
}
