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

use crate::domain::RegistryError;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

lazy_static! {
    static ref SCRIPT_NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 ._+-]*$").unwrap();
}

/// Exit code reported when the controller output carried no usable exit code.
/// Any negative exit code means "indeterminate", never a real process status.
pub const INDETERMINATE_EXIT_CODE: i32 = -100;

/// Exit code the controller records for a job it had to interrupt or kill
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// File (in the target temp directory) holding the controller's pid while it runs
pub const CONTROLLER_PID_FILE_NAME: &str = "controller.pid";

/// File name of the controller script in the target temp directory
pub const CONTROLLER_SCRIPT_NAME: &str = "controller.sh";

/// A named unit of work: a shell script plus what it needs to run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkItem {
    /// Unique name, also used (sanitized) as a file name and shell key
    pub name: String,
    /// Shell script body; may contain `{{key}}` placeholders
    pub body: String,
    /// Architectures this item applies to (empty means all)
    pub architectures: Vec<String>,
    /// CPU vendors this item applies to (empty means all)
    pub vendors: Vec<String>,
    /// Microarchitectures this item applies to (empty means all)
    pub microarchitectures: Vec<String>,
    /// Needs root or sudo
    #[serde(alias = "superuser")]
    pub requires_privilege: bool,
    /// Must run alone, in the sequential phase
    #[serde(alias = "sequential")]
    pub isolated: bool,
    /// Spawns a background process that has to be killed through `<sanitized>_cmd.pid`
    #[serde(alias = "needs_kill")]
    pub force_killable: bool,
    /// Kernel modules to load before running
    #[serde(alias = "lkms")]
    pub required_modules: Vec<String>,
    /// Binaries that must be present in the target's PATH
    #[serde(alias = "depends")]
    pub required_binaries: Vec<String>,
}

impl WorkItem {
    /// Create a work item with the given name and body
    pub fn new(name: &str, body: &str) -> Self {
        Self {
            name: name.to_string(),
            body: body.to_string(),
            ..Default::default()
        }
    }

    /// Mark the item as requiring superuser privileges
    pub fn privileged(mut self) -> Self {
        self.requires_privilege = true;
        self
    }

    /// Force the item into the sequential phase
    pub fn isolated(mut self) -> Self {
        self.isolated = true;
        self
    }

    /// Mark the item's nested background process for forced kill on interrupt
    pub fn force_killable(mut self) -> Self {
        self.force_killable = true;
        self
    }

    /// Set kernel modules required by the item
    pub fn modules(mut self, modules: &[&str]) -> Self {
        self.required_modules = modules.iter().map(|m| m.to_string()).collect();
        self
    }

    /// Set binaries required by the item
    pub fn binaries(mut self, binaries: &[&str]) -> Self {
        self.required_binaries = binaries.iter().map(|b| b.to_string()).collect();
        self
    }

    /// Sanitized token used for file names and shell keys
    pub fn sanitized_name(&self) -> String {
        sanitize_name(&self.name)
    }

    /// Name of the script file written to the target
    pub fn script_file_name(&self) -> String {
        format!("{}.sh", self.sanitized_name())
    }

    /// Render the body, replacing `{{key}}` placeholders with the given values
    pub fn render_body(&self, params: &HashMap<String, String>) -> String {
        let mut rendered = self.body.clone();
        for (key, value) in params {
            rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
        }
        rendered
    }

    /// Check whether the item applies to a target with the given profile
    pub fn applies_to(&self, profile: &TargetProfile) -> bool {
        fn matches(constraints: &[String], value: &str) -> bool {
            constraints.is_empty() || constraints.iter().any(|c| c == value)
        }
        matches(&self.architectures, &profile.architecture)
            && matches(&self.vendors, &profile.vendor)
            && matches(&self.microarchitectures, &profile.microarchitecture)
    }
}

/// Replace spaces and hyphens with underscores
pub fn sanitize_name(name: &str) -> String {
    name.replace([' ', '-'], "_")
}

/// Validate a work item name at the registration boundary
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    if SCRIPT_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

/// Identification of a target used for applicability filtering
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetProfile {
    pub architecture: String,
    pub vendor: String,
    pub microarchitecture: String,
}

/// What the target lets the current user do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrivilegeCapabilities {
    /// sudo (or root) is available
    pub can_elevate: bool,
    /// Already running as root
    pub is_super_user: bool,
}

impl PrivilegeCapabilities {
    /// True when privileged items can run at all
    pub fn allows_privileged(&self) -> bool {
        self.can_elevate || self.is_super_user
    }
}

/// Work items split into the two controller phases
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionBatch {
    /// Run one at a time, in order, after the concurrent phase
    pub sequential: Vec<WorkItem>,
    /// Run together as background jobs
    pub concurrent: Vec<WorkItem>,
}

impl ExecutionBatch {
    pub fn is_empty(&self) -> bool {
        self.sequential.is_empty() && self.concurrent.is_empty()
    }

    /// All items, concurrent first, in submission order within each phase
    pub fn all_items(&self) -> impl Iterator<Item = &WorkItem> {
        self.concurrent.iter().chain(self.sequential.iter())
    }

    pub fn len(&self) -> usize {
        self.sequential.len() + self.concurrent.len()
    }
}

/// Captured output of one work item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Original (unsanitized) name
    pub name: String,
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or a negative value when it could not be determined
    pub exit_code: i32,
}

impl ExecutionResult {
    /// True when the exit code could not be determined from the output
    pub fn is_indeterminate(&self) -> bool {
        self.exit_code < 0
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Kernel modules loaded for a batch that were not loaded before it.
///
/// Whoever holds this value owns their removal; nothing else may be unloaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledModules(Vec<String>);

impl InstalledModules {
    pub fn new(modules: Vec<String>) -> Self {
        Self(modules)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }
}
