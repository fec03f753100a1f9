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

//! Target operations built on `run_command`, shared by every target kind

use crate::domain::TargetError;
use crate::ports::{CommandOutput, RunOptions, Target, TargetCommand};
use log::{debug, warn};
use std::path::Path;
use std::time::Duration;

/// `mktemp` template for target temp directories
pub const TEMP_DIR_TEMPLATE: &str = "script_runner.tmp.XXXXXXXXXX";

/// Timeout for short probe commands
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Wrap `command` in sudo unless the target user is already root
pub fn elevated(target: &dyn Target, command: TargetCommand) -> TargetCommand {
    if target.is_super_user() {
        command
    } else {
        command.with_sudo_stdin()
    }
}

/// Run a command that must succeed, returning its trimmed stdout
pub async fn run_checked(
    target: &dyn Target,
    command: &TargetCommand,
    limit: Duration,
) -> Result<String, TargetError> {
    let CommandOutput {
        stdout,
        stderr,
        exit_code,
    } = target.run_command(command, RunOptions::quick(limit)).await?;
    if exit_code != 0 {
        return Err(TargetError::CommandFailed {
            command: command.to_string(),
            exit_code,
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(stdout.trim().to_string())
}

/// Create a fresh temp directory under `root`
pub async fn make_temp_directory(target: &dyn Target, root: &str) -> Result<String, TargetError> {
    let command = TargetCommand::new("mktemp").args(&["-d", "-p", root, TEMP_DIR_TEMPLATE]);
    let dir = run_checked(target, &command, PROBE_TIMEOUT).await?;
    if dir.is_empty() {
        return Err(TargetError::NoTempDirectory(target.name()));
    }
    Ok(dir)
}

/// Remove a directory, retrying with sudo when files inside belong to root
pub async fn remove_directory(target: &dyn Target, dir: &str) -> Result<(), TargetError> {
    let command = TargetCommand::new("rm").args(&["-rf", dir]);
    match run_checked(target, &command, PROBE_TIMEOUT).await {
        Ok(_) => Ok(()),
        Err(e) if !target.is_super_user() && target.can_elevate_privileges().await => {
            debug!("retrying removal of {} with sudo: {}", dir, e);
            run_checked(target, &command.with_sudo_stdin(), PROBE_TIMEOUT)
                .await
                .map(|_| ())
        }
        Err(e) => Err(e),
    }
}

/// Machine architecture from `uname -m`
pub async fn uname_machine(target: &dyn Target) -> Result<String, TargetError> {
    run_checked(target, &TargetCommand::new("uname").args(&["-m"]), PROBE_TIMEOUT).await
}

/// Whether sudo works for this user, asking for the password rather than using cached credentials
pub async fn probe_sudo(target: &dyn Target) -> bool {
    let options = RunOptions::quick(PROBE_TIMEOUT);
    // drop cached credentials so the probe checks the password itself
    if let Err(e) = target
        .run_command(&TargetCommand::new("sudo").args(&["-k"]), options)
        .await
    {
        debug!("sudo -k failed on {}: {}", target.name(), e);
    }
    match target
        .run_command(&TargetCommand::new("ls").with_sudo_stdin(), options)
        .await
    {
        Ok(output) => output.success(),
        Err(e) => {
            debug!("sudo probe failed on {}: {}", target.name(), e);
            false
        }
    }
}

fn normalize_module(name: &str) -> String {
    name.replace('-', "_")
}

/// Names of the loaded kernel modules, from `/proc/modules`
pub fn parse_loaded_modules(proc_modules: &str) -> Vec<String> {
    proc_modules
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(normalize_module)
        .collect()
}

/// Load the modules that are not loaded yet; returns the ones this call loaded
pub async fn install_modules(
    target: &dyn Target,
    modules: &[String],
    limit: Duration,
) -> Result<Vec<String>, TargetError> {
    if !target.can_elevate_privileges().await {
        return Err(TargetError::ElevationRequired(format!(
            "loading kernel modules {} on {}",
            modules.join(", "),
            target.name()
        )));
    }
    let loaded = parse_loaded_modules(
        &run_checked(
            target,
            &TargetCommand::new("cat").args(&["/proc/modules"]),
            PROBE_TIMEOUT,
        )
        .await?,
    );

    let mut installed = Vec::new();
    for module in modules {
        if loaded.contains(&normalize_module(module)) {
            debug!("kernel module {} already loaded on {}", module, target.name());
            continue;
        }
        let command = elevated(
            target,
            TargetCommand::new("modprobe").args(&["--first-time", module]),
        );
        match run_checked(target, &command, limit).await {
            Ok(_) => installed.push(module.clone()),
            // missing or built-in modules are not fatal; the scripts report what they lack
            Err(e) => warn!("could not load kernel module {} on {}: {}", module, target.name(), e),
        }
    }
    Ok(installed)
}

/// Unload kernel modules
pub async fn uninstall_modules(
    target: &dyn Target,
    modules: &[String],
    limit: Duration,
) -> Result<(), TargetError> {
    let mut first_error = None;
    for module in modules {
        let command = elevated(target, TargetCommand::new("modprobe").args(&["-r", module.as_str()]));
        match run_checked(target, &command, limit).await {
            Ok(_) => debug!("unloaded module {} on {}", module, target.name()),
            Err(e) => {
                warn!("failed to unload module {} on {}: {}", module, target.name(), e);
                first_error.get_or_insert(e);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Copy a directory tree, keeping file modes
pub async fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((source, destination)) = pending.pop() {
        tokio::fs::create_dir_all(&destination).await?;
        let mut entries = tokio::fs::read_dir(&source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = destination.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

/// Keep only the PATH entries that are existing directories
pub fn filter_existing_paths(path: &str) -> String {
    path.split(':')
        .filter(|entry| !entry.is_empty() && Path::new(entry).is_dir())
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::services::testing::RecordingTarget;

    #[test]
    fn test_parse_loaded_modules() {
        let proc_modules = "msr 16384 0 - Live 0x0000000000000000\n\
                            intel_rapl_msr 20480 0 - Live 0x0000000000000000\n\
                            \n";
        assert_eq!(parse_loaded_modules(proc_modules), vec!["msr", "intel_rapl_msr"]);
    }

    #[test]
    fn test_filter_existing_paths() {
        let dir = tempfile::TempDir::new().unwrap();
        let existing = dir.path().to_str().unwrap();
        let path = format!("{existing}:/definitely/not/here::{existing}");
        assert_eq!(filter_existing_paths(&path), format!("{existing}:{existing}"));
    }

    #[tokio::test]
    async fn test_install_skips_loaded_modules() {
        let target = RecordingTarget::new("t")
            .with_elevation(true, false)
            .with_responder(|command| CommandOutput {
                stdout: if command.program == "cat" {
                    "intel_rapl_msr 20480 0 - Live 0x0\n".to_string()
                } else {
                    String::new()
                },
                stderr: String::new(),
                exit_code: 0,
            });
        let modules = vec!["intel-rapl-msr".to_string(), "msr".to_string()];
        let installed = install_modules(&target, &modules, PROBE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(installed, vec!["msr".to_string()]);

        let argv: Vec<Vec<String>> = target.commands().into_iter().map(|(c, _)| c.argv()).collect();
        assert_eq!(
            argv.last().unwrap(),
            &vec!["sudo", "-S", "modprobe", "--first-time", "msr"]
        );
    }

    #[tokio::test]
    async fn test_install_requires_elevation() {
        let target = RecordingTarget::new("t");
        let result = install_modules(&target, &["msr".to_string()], PROBE_TIMEOUT).await;
        assert!(matches!(result, Err(TargetError::ElevationRequired(_))));
    }

    #[tokio::test]
    async fn test_uninstall_modules_command() {
        let target = RecordingTarget::new("t").with_elevation(true, true);
        uninstall_modules(&target, &["msr".to_string(), "cpuid".to_string()], PROBE_TIMEOUT)
            .await
            .unwrap();
        let commands = target.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].0.argv(), vec!["modprobe", "-r", "msr"]);
        assert_eq!(commands[1].0.argv(), vec!["modprobe", "-r", "cpuid"]);
    }

    #[tokio::test]
    async fn test_copy_tree() {
        let src = tempfile::TempDir::new().unwrap();
        let dst = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("lib/native")).unwrap();
        std::fs::write(src.path().join("profiler.sh"), "run").unwrap();
        std::fs::write(src.path().join("lib/native/libprof.so"), "elf").unwrap();

        let out = dst.path().join("async-profiler");
        copy_tree(src.path(), &out).await.unwrap();
        assert_eq!(std::fs::read_to_string(out.join("profiler.sh")).unwrap(), "run");
        assert_eq!(
            std::fs::read_to_string(out.join("lib/native/libprof.so")).unwrap(),
            "elf"
        );
    }
}
