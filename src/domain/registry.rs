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

//! Catalog of named work items, built once at startup and passed around by reference

use crate::domain::{validate_name, RegistryError, TargetProfile, WorkItem};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Registry file layout: a list of `[[script]]` tables
#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    script: Vec<WorkItem>,
}

/// Ordered catalog of work items keyed by name
#[derive(Debug, Clone, Default)]
pub struct WorkItemRegistry {
    items: Vec<WorkItem>,
    index: HashMap<String, usize>,
}

impl WorkItemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a work item, rejecting invalid or duplicate names
    pub fn register(&mut self, item: WorkItem) -> Result<(), RegistryError> {
        validate_name(&item.name)?;
        if self.index.contains_key(&item.name) {
            return Err(RegistryError::DuplicateName(item.name));
        }
        self.index.insert(item.name.clone(), self.items.len());
        self.items.push(item);
        Ok(())
    }

    /// Build a registry from TOML text
    ///
    /// # Example
    /// ```toml
    /// [[script]]
    /// name = "kernel log"
    /// body = "dmesg --kernel --human --nopager | tail -n{{lines}}"
    /// superuser = true
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile =
            toml::from_str(text).map_err(|e| RegistryError::LoadFailed(e.to_string()))?;
        let mut registry = Self::new();
        for item in file.script {
            registry.register(item)?;
        }
        Ok(registry)
    }

    /// Load a registry from a TOML file
    pub async fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            RegistryError::LoadFailed(format!("{}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn get(&self, name: &str) -> Option<&WorkItem> {
        self.index.get(name).map(|&i| &self.items[i])
    }

    /// Look up several items, preserving the requested order
    pub fn resolve(&self, names: &[&str]) -> Result<Vec<WorkItem>, RegistryError> {
        self.resolve_with_params(names, &HashMap::new())
    }

    /// Look up several items and render their bodies with the given parameters
    pub fn resolve_with_params(
        &self,
        names: &[&str],
        params: &HashMap<String, String>,
    ) -> Result<Vec<WorkItem>, RegistryError> {
        names
            .iter()
            .map(|name| {
                let item = self
                    .get(name)
                    .ok_or_else(|| RegistryError::UnknownScript(name.to_string()))?;
                Ok(WorkItem {
                    body: item.render_body(params),
                    ..item.clone()
                })
            })
            .collect()
    }

    /// Registered names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Keep only the items that apply to the given target
pub fn applicable(items: Vec<WorkItem>, profile: &TargetProfile) -> Vec<WorkItem> {
    items
        .into_iter()
        .filter(|item| item.applies_to(profile))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY_TOML: &str = r#"
[[script]]
name = "hostname"
body = "hostname"

[[script]]
name = "kernel log"
body = "dmesg | tail -n{{lines}}"
superuser = true
lkms = ["msr"]

[[script]]
name = "turbostat"
body = "turbostat -i {{interval}}"
sequential = true
needs_kill = true
depends = ["turbostat"]
architectures = ["x86_64"]
"#;

    #[test]
    fn test_from_toml_str() {
        let registry = WorkItemRegistry::from_toml_str(REGISTRY_TOML).unwrap();
        assert_eq!(registry.names(), vec!["hostname", "kernel log", "turbostat"]);

        let kernel_log = registry.get("kernel log").unwrap();
        assert!(kernel_log.requires_privilege);
        assert_eq!(kernel_log.required_modules, vec!["msr".to_string()]);

        let turbostat = registry.get("turbostat").unwrap();
        assert!(turbostat.isolated);
        assert!(turbostat.force_killable);
        assert_eq!(turbostat.required_binaries, vec!["turbostat".to_string()]);
    }

    #[test]
    fn test_register_rejects_duplicates_and_bad_names() {
        let mut registry = WorkItemRegistry::new();
        registry.register(WorkItem::new("date", "date")).unwrap();
        assert_eq!(
            registry.register(WorkItem::new("date", "date -u")),
            Err(RegistryError::DuplicateName("date".to_string()))
        );
        assert!(matches!(
            registry.register(WorkItem::new("../etc", "true")),
            Err(RegistryError::InvalidName(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_with_params() {
        let registry = WorkItemRegistry::from_toml_str(REGISTRY_TOML).unwrap();
        let params = HashMap::from([("lines".to_string(), "50".to_string())]);
        let items = registry
            .resolve_with_params(&["kernel log", "hostname"], &params)
            .unwrap();
        assert_eq!(items[0].body, "dmesg | tail -n50");
        assert_eq!(items[1].name, "hostname");

        assert_eq!(
            registry.resolve(&["nope"]),
            Err(RegistryError::UnknownScript("nope".to_string()))
        );
    }

    #[test]
    fn test_applicable() {
        let registry = WorkItemRegistry::from_toml_str(REGISTRY_TOML).unwrap();
        let items = registry.resolve(&registry.names()).unwrap();
        let arm = TargetProfile {
            architecture: "aarch64".to_string(),
            ..Default::default()
        };
        let names: Vec<String> = applicable(items, &arm).into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["hostname".to_string(), "kernel log".to_string()]);
    }
}
