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

//! Forwarding interrupts to controllers running in their own process group
//!
//! Controllers are started outside the terminal's process group, so a Ctrl-C
//! never reaches them directly. Instead the pid recorded in the target's
//! `controller.pid` is signalled, which lets the controller stop its jobs and
//! print whatever they produced.

use crate::domain::{ExecutionConfig, TargetError, CONTROLLER_PID_FILE_NAME};
use crate::ports::{RunOptions, Signal, Target, TargetCommand};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal as UnixSignal, SignalKind};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn elevate(command: TargetCommand, elevated: bool) -> TargetCommand {
    if elevated {
        command.with_sudo_stdin()
    } else {
        command
    }
}

/// Interrupt the controller running on a target, if any.
///
/// Sends SIGINT to the pid in the target's pid file and waits for that process
/// to exit. If it is still alive after the grace period the controller gets
/// SIGKILL; its partial results are then lost.
///
/// # Returns
/// * `Ok(true)` - A controller was running and has been signalled
/// * `Ok(false)` - No controller is running on the target
/// * `Err(TargetError)` - The target could not be reached
pub async fn interrupt_controller(
    target: &dyn Target,
    config: &ExecutionConfig,
) -> Result<bool, TargetError> {
    let Some(temp_dir) = target.temp_directory() else {
        return Ok(false);
    };
    let pid_file = format!("{temp_dir}/{CONTROLLER_PID_FILE_NAME}");
    let options = RunOptions::quick(config.signal_command_timeout());
    // the controller may be running as root
    let elevated = !target.is_super_user() && target.can_elevate_privileges().await;

    let output = target
        .run_command(&TargetCommand::new("cat").args(&[&pid_file]), options)
        .await?;
    if !output.success() {
        debug!("no controller running on {}", target.name());
        return Ok(false);
    }
    let pid = match output.stdout.trim().parse::<u32>() {
        Ok(pid) => pid.to_string(),
        Err(_) => {
            warn!(
                "ignoring malformed controller pid file on {}: {:?}",
                target.name(),
                output.stdout
            );
            return Ok(false);
        }
    };

    info!("sending SIGINT to controller {} on {}", pid, target.name());
    let kill = |signal: Signal| {
        elevate(
            TargetCommand::new("kill").args(&[&format!("-{}", signal.name()), &pid]),
            elevated,
        )
    };
    target.run_command(&kill(Signal::Interrupt), options).await?;

    let deadline = Instant::now() + config.interrupt_grace();
    let alive = elevate(TargetCommand::new("kill").args(&["-0", pid.as_str()]), elevated);
    while Instant::now() < deadline {
        let output = target.run_command(&alive, options).await?;
        if !output.success() {
            debug!("controller on {} exited", target.name());
            return Ok(true);
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }

    warn!(
        "controller {} on {} did not exit within {:?}, sending SIGKILL",
        pid,
        target.name(),
        config.interrupt_grace()
    );
    target.run_command(&kill(Signal::Kill), options).await?;
    Ok(true)
}

/// Interrupt a target's controller, waiting up to the grace period for one to start.
///
/// An interrupt can arrive while the batch is still being staged, before the
/// controller has written its pid file.
async fn interrupt_when_started(
    target: &dyn Target,
    config: &ExecutionConfig,
) -> Result<bool, TargetError> {
    let deadline = Instant::now() + config.interrupt_grace();
    loop {
        if interrupt_controller(target, config).await? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Interrupt the controllers on every target concurrently
///
/// # Returns
/// The number of targets whose controller was signalled
pub async fn interrupt_all(targets: &[Arc<dyn Target>], config: &ExecutionConfig) -> usize {
    let mut tasks = JoinSet::new();
    for target in targets {
        let target = Arc::clone(target);
        let config = config.clone();
        tasks.spawn(async move {
            match interrupt_when_started(target.as_ref(), &config).await {
                Ok(interrupted) => interrupted,
                Err(e) => {
                    warn!("failed to interrupt controller on {}: {}", target.name(), e);
                    false
                }
            }
        });
    }
    let mut interrupted = 0;
    while let Some(joined) = tasks.join_next().await {
        if matches!(joined, Ok(true)) {
            interrupted += 1;
        }
    }
    interrupted
}

/// Forward every SIGINT and SIGTERM to the controllers on `targets`.
///
/// `cancellation` is cancelled on the first signal so that a batch still
/// being staged does not start its controller.
pub fn spawn_interrupt_forwarder(
    targets: Vec<Arc<dyn Target>>,
    config: ExecutionConfig,
    cancellation: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut signals = match TerminationSignals::install() {
            Ok(signals) => signals,
            Err(e) => {
                warn!("failed to install signal handler: {}", e);
                return;
            }
        };
        while signals.recv().await {
            if cancellation.is_cancelled() {
                info!("received another interrupt, signalling controllers again");
            } else {
                info!("received interrupt, stopping running scripts");
                cancellation.cancel();
            }
            let interrupted = interrupt_all(&targets, &config).await;
            debug!("interrupted {} of {} controllers", interrupted, targets.len());
        }
    })
}

struct TerminationSignals {
    interrupt: UnixSignal,
    terminate: UnixSignal,
}

impl TerminationSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// False once the signal streams are closed
    async fn recv(&mut self) -> bool {
        tokio::select! {
            received = self.interrupt.recv() => received.is_some(),
            received = self.terminate.recv() => received.is_some(),
        }
    }
}
