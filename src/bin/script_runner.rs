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

use clap::Parser;
use log::{debug, info, warn};
use script_runner::domain::spawn_interrupt_forwarder;
use script_runner::{
    applicable, ConfigurationProvider, ContainerConfigBuilder, ExecutionConfig, ExecutionResult,
    ScriptRunningService, ServiceContainer, StreamSinks, Target, TargetProfile,
    TomlConfigurationProvider, WorkItem, WorkItemRegistry,
};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Parser)]
#[command(
    name = "script_runner",
    version,
    about = "Run diagnostic scripts on a local or remote target"
)]
struct Opt {
    /// Registry of work items (TOML with `[[script]]` tables)
    #[arg(long)]
    registry: PathBuf,

    /// Execution settings (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// `local` or `[user@]host[:port]`
    #[arg(long, default_value = "local")]
    target: String,

    /// Private key for ssh
    #[arg(long)]
    key: Option<PathBuf>,

    /// Comma separated names to run; all applicable items when omitted
    #[arg(long, value_delimiter = ',')]
    scripts: Vec<String>,

    /// Keep running sequential items after one fails
    #[arg(long)]
    continue_on_error: bool,

    /// Run one item and print its output as it is produced
    #[arg(long, value_name = "NAME", conflicts_with = "scripts")]
    stream: Option<String>,

    /// Write results as JSON to this file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Template parameters in key=value format, substituted for `{{key}}` in script bodies
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// CPU vendor used to select applicable items
    #[arg(long, default_value = "")]
    vendor: String,

    /// CPU microarchitecture used to select applicable items
    #[arg(long, default_value = "")]
    microarchitecture: String,

    /// Password for `sudo -S` on the local host
    #[arg(long, env = "SCRIPT_RUNNER_SUDO_PASSWORD", hide_env_values = true)]
    sudo_password: Option<String>,

    /// Password for ssh, passed through sshpass
    #[arg(long, env = "SCRIPT_RUNNER_SSH_PASSWORD", hide_env_values = true)]
    ssh_password: Option<String>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err("Parameter must be in key=value format".to_string()),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let opt = Opt::parse();
    init_logging(opt.verbose);

    let registry = WorkItemRegistry::load(&opt.registry).await?;
    let mut execution = match &opt.config {
        Some(path) => {
            TomlConfigurationProvider::new(path)
                .get_execution_config()
                .await?
        }
        None => ExecutionConfig::default(),
    };
    if opt.continue_on_error {
        execution.continue_on_sequential_error = true;
    }

    let config = ContainerConfigBuilder::new()
        .execution(execution.clone())
        .sudo_password(opt.sudo_password.clone())
        .ssh_key(opt.key.clone())
        .ssh_password(opt.ssh_password.clone())
        .build();
    debug!("container configuration: {:?}", config);
    let container = ServiceContainer::new(config);
    let target = container.create_target(&opt.target)?;
    let service = container.create_execution_service();
    let params: HashMap<String, String> = opt.params.iter().cloned().collect();

    let outcome = match &opt.stream {
        Some(name) => {
            let item = registry
                .resolve_with_params(&[name.as_str()], &params)?
                .remove(0);
            stream(service.as_ref(), target.as_ref(), item, &execution).await
        }
        None => {
            let items = select_items(&opt, &registry, &params, target.as_ref()).await?;
            let forwarder = spawn_interrupt_forwarder(
                vec![Arc::clone(&target)],
                execution.clone(),
                container.cancellation(),
            );
            let outcome = run_batch(&opt, service.as_ref(), target.as_ref(), items).await;
            forwarder.abort();
            outcome
        }
    };

    if let Err(e) = target.remove_temp_directory().await {
        warn!("failed to remove temp directory on {}: {}", target.name(), e);
    }
    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Requested items, or every registered item that applies to the target
async fn select_items(
    opt: &Opt,
    registry: &WorkItemRegistry,
    params: &HashMap<String, String>,
    target: &dyn Target,
) -> Result<Vec<WorkItem>, Box<dyn Error>> {
    let names: Vec<&str> = if opt.scripts.is_empty() {
        registry.names()
    } else {
        opt.scripts.iter().map(String::as_str).collect()
    };
    let items = registry.resolve_with_params(&names, params)?;

    let profile = TargetProfile {
        architecture: target.architecture().await?,
        vendor: opt.vendor.clone(),
        microarchitecture: opt.microarchitecture.clone(),
    };
    let selected = applicable(items.clone(), &profile);
    for item in &items {
        if !selected.iter().any(|s| s.name == item.name) {
            info!(
                "skipping '{}': not applicable to {} ({:?})",
                item.name,
                target.name(),
                profile
            );
        }
    }
    Ok(selected)
}

async fn run_batch(
    opt: &Opt,
    service: &dyn ScriptRunningService,
    target: &dyn Target,
    items: Vec<WorkItem>,
) -> Result<bool, Box<dyn Error>> {
    let results = service.run_scripts(target, &items).await?;

    let success = print_summary(&items, &results);
    if let Some(path) = &opt.output {
        let ordered: BTreeMap<&String, &ExecutionResult> = results.iter().collect();
        tokio::fs::write(path, serde_json::to_string_pretty(&ordered)?).await?;
        info!("results written to {}", path.display());
    }
    Ok(success)
}

/// Print one line per item and the stderr of failed ones; true when all succeeded
fn print_summary(items: &[WorkItem], results: &HashMap<String, ExecutionResult>) -> bool {
    println!("Script Summary:");
    println!("===============");
    let mut failed = Vec::new();
    for item in items {
        match results.get(&item.name) {
            Some(result) if result.is_indeterminate() => {
                println!("{:<40} exit code unknown", item.name);
                failed.push((item, Some(result)));
            }
            Some(result) => {
                println!("{:<40} exit {}", item.name, result.exit_code);
                if !result.succeeded() {
                    failed.push((item, Some(result)));
                }
            }
            None => {
                println!("{:<40} no result", item.name);
                failed.push((item, None));
            }
        }
    }

    if failed.is_empty() {
        return true;
    }
    println!();
    println!("Failed Scripts:");
    println!("===============");
    for (item, result) in failed {
        match result {
            Some(result) if !result.stderr.trim().is_empty() => {
                println!("{}:", item.name);
                for line in result.stderr.lines() {
                    println!("    {}", line);
                }
            }
            Some(_) => println!("{}: (no stderr)", item.name),
            None => println!("{}: did not run", item.name),
        }
    }
    false
}

async fn stream(
    service: &dyn ScriptRunningService,
    target: &dyn Target,
    item: WorkItem,
    execution: &ExecutionConfig,
) -> Result<bool, Box<dyn Error>> {
    let (stdout_tx, mut stdout_rx) = mpsc::channel::<String>(256);
    let (stderr_tx, mut stderr_rx) = mpsc::channel::<String>(256);
    let (exit_tx, exit_rx) = oneshot::channel();
    let (process_tx, process_rx) = oneshot::channel();
    let sinks = StreamSinks {
        stdout: stdout_tx,
        stderr: stderr_tx,
        exit_code: exit_tx,
        process: process_tx,
    };

    let stdout_printer = tokio::spawn(async move {
        while let Some(line) = stdout_rx.recv().await {
            println!("{}", line);
        }
    });
    let stderr_printer = tokio::spawn(async move {
        while let Some(line) = stderr_rx.recv().await {
            eprintln!("{}", line);
        }
    });
    let grace = execution.interrupt_grace();
    let canceller = tokio::spawn(async move {
        let Ok(handle) = process_rx.await else {
            return;
        };
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping pid {}", handle.pid());
            handle.interrupt_then_kill(grace).await;
        }
    });

    let result = service.run_script_stream(target, &item, sinks).await;
    canceller.abort();
    // the senders are gone once the stream returns
    let _ = stdout_printer.await;
    let _ = stderr_printer.await;
    result?;

    match exit_rx.await {
        Ok(code) => {
            info!("'{}' exited with {}", item.name, code);
            Ok(code == 0)
        }
        Err(_) => {
            warn!("'{}' finished without an exit code", item.name);
            Ok(false)
        }
    }
}
