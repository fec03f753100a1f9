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

//! Controller script generation
//!
//! The controller is a single bash program that runs a whole batch on the
//! target: every concurrent item as a background job in its own process group,
//! then the sequential items one by one. It always finishes by printing one
//! framed block per started item (see [`crate::domain::services::demux`]), including
//! when it is interrupted, so partial results survive cancellation.

use crate::domain::services::planner::check_names;
use crate::domain::{
    ExecutionError, WorkItem, CONTROLLER_PID_FILE_NAME, CONTROLLER_STOP_WINDOW_SECS,
};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write;

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"\{\{(\w+)\}\}").unwrap();
}

/// Line separating result blocks in controller output
pub const BLOCK_DELIMITER: &str = "<---------------------->";

const CONTROLLER_TEMPLATE: &str = r#"#!/usr/bin/env bash
set -o pipefail

script_dir={{target_temp_dir}}
pid_file="$script_dir"/{{pid_file}}
cd "$script_dir" || exit 1

# the driver signals this pid to cancel the batch
echo $$ > "$pid_file"
trap 'rm -f "$pid_file"' EXIT

declare -a concurrent_scripts=()
declare -a sequential_scripts=()
declare -A pids=()
declare -A exitcodes=()
declare -A orig_names=()
declare -A force_kill=()
declare -A interrupted=()
current_seq_script=""

continue_on_script_error={{continue_on_script_error}}
{{script_table}}
ensure_trailing_newline() {
  local f="$1"
  [[ -f "$f" ]] || return 0
  cat "$f" || true
  if [[ -s "$f" ]] && [[ "$(tail -c 1 "$f" | wc -l)" -eq 0 ]]; then echo; fi
}

start_script() {
  local s="$1"
  setsid bash "$script_dir/${s}.sh" > "$script_dir/${s}.stdout" 2> "$script_dir/${s}.stderr" &
  pids[$s]=$!
}

start_concurrent_scripts() {
  for s in "${concurrent_scripts[@]}"; do
    start_script "$s"
  done
}

wait_for_concurrent_scripts() {
  for s in "${concurrent_scripts[@]}"; do
    if wait "${pids[$s]}"; then
      exitcodes[$s]=0
    else
      exitcodes[$s]=$?
    fi
  done
}

run_sequential_scripts() {
  for s in "${sequential_scripts[@]}"; do
    current_seq_script="$s"
    start_script "$s"
    if wait "${pids[$s]}"; then
      exitcodes[$s]=0
    else
      ec=$?
      exitcodes[$s]=$ec
      if [[ "$continue_on_script_error" -eq 0 ]]; then
        echo "Script '${orig_names[$s]}' failed with exit code $ec; stopping further sequential scripts." >&2
        current_seq_script=""
        finish "$ec"
      fi
    fi
    current_seq_script=""
  done
}

signal_script() {
  local s="$1"
  local pid="${pids[$s]:-}"
  if [[ -z "$pid" || -n "${exitcodes[$s]:-}" ]]; then return 0; fi
  if kill -0 "$pid" 2>/dev/null; then
    # negative pid: the whole process group started by setsid
    kill -SIGINT -"$pid" 2>/dev/null || true
    interrupted[$s]=1
    if [[ -n "${force_kill[$s]:-}" && -f "$script_dir/${s}_cmd.pid" ]]; then
      kill -SIGKILL "$(cat "$script_dir/${s}_cmd.pid")" 2>/dev/null || true
    fi
  fi
  return 0
}

any_alive() {
  local s pid
  for s in "$@"; do
    pid="${pids[$s]:-}"
    if [[ -n "$pid" && -n "${interrupted[$s]:-}" ]] && kill -0 "$pid" 2>/dev/null; then
      return 0
    fi
  done
  return 1
}

kill_script() {
  local s="$1"
  local pid="${pids[$s]:-}"
  local ec
  if [[ -z "$pid" || -n "${exitcodes[$s]:-}" ]]; then return 0; fi
  if kill -0 "$pid" 2>/dev/null; then
    kill -SIGKILL -"$pid" 2>/dev/null || true
  fi
  if wait "$pid" 2>/dev/null; then ec=0; else ec=$?; fi
  if [[ -n "${interrupted[$s]:-}" ]]; then
    exitcodes[$s]=130
  else
    exitcodes[$s]=$ec
  fi
  return 0
}

stop_scripts() {
  local s
  for s in "$@"; do
    signal_script "$s"
  done
  # 0.5 second steps
  local waited=0
  while any_alive "$@" && [[ "$waited" -lt {{stop_polls}} ]]; do
    sleep 0.5
    waited=$((waited + 1))
  done
  for s in "$@"; do
    kill_script "$s"
  done
}

print_summary() {
  local s
  for s in "${concurrent_scripts[@]}" "${sequential_scripts[@]}"; do
    # never started
    [[ -n "${pids[$s]:-}" ]] || continue
    echo "<---------------------->"
    echo "SCRIPT NAME: ${orig_names[$s]}"
    echo "STDOUT:"; ensure_trailing_newline "$script_dir/${s}.stdout"
    echo "STDERR:"; ensure_trailing_newline "$script_dir/${s}.stderr"
    echo "EXIT CODE: ${exitcodes[$s]:-}"
  done
}

finish() {
  print_summary
  exit "$1"
}

handle_signal() {
  trap '' SIGINT SIGTERM
  echo "Received signal; attempting graceful shutdown" >&2
  local running=("${concurrent_scripts[@]}")
  if [[ -n "$current_seq_script" ]]; then
    running+=("$current_seq_script")
  fi
  stop_scripts "${running[@]}"
  finish 0
}

trap handle_signal SIGINT SIGTERM

start_concurrent_scripts
wait_for_concurrent_scripts
run_sequential_scripts
finish 0
"#;

/// A rendered controller and whether it must run elevated
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerScript {
    pub text: String,
    /// True if any item requires superuser
    pub needs_elevated_privileges: bool,
}

/// Render the controller for a batch.
///
/// # Arguments
/// * `target_temp_dir` - Directory on the target holding `<sanitized>.sh` scripts
/// * `concurrent` - Items started together in the background
/// * `sequential` - Items run one at a time after the concurrent phase
/// * `continue_on_sequential_error` - Keep going after a failed sequential item
pub fn generate_controller(
    target_temp_dir: &str,
    concurrent: &[WorkItem],
    sequential: &[WorkItem],
    continue_on_sequential_error: bool,
) -> Result<ControllerScript, ExecutionError> {
    if target_temp_dir.is_empty() {
        return Err(ExecutionError::Generation(
            "target temporary directory cannot be empty".to_string(),
        ));
    }
    let all: Vec<WorkItem> = concurrent.iter().chain(sequential).cloned().collect();
    check_names(&all).map_err(|e| ExecutionError::Generation(e.to_string()))?;

    let mut table = String::new();
    for (array, items) in [
        ("concurrent_scripts", concurrent),
        ("sequential_scripts", sequential),
    ] {
        for item in items {
            let token = quote(&item.sanitized_name());
            // writing to a String cannot fail
            let _ = writeln!(table, "{array}+=({token})");
            let _ = writeln!(table, "orig_names[{token}]={}", quote(&item.name));
            if item.force_killable {
                let _ = writeln!(table, "force_kill[{token}]=1");
            }
        }
    }

    let mut values = HashMap::new();
    values.insert("target_temp_dir", quote(target_temp_dir));
    values.insert("pid_file", quote(CONTROLLER_PID_FILE_NAME));
    values.insert(
        "continue_on_script_error",
        if continue_on_sequential_error { "1" } else { "0" }.to_string(),
    );
    values.insert("stop_polls", (CONTROLLER_STOP_WINDOW_SECS * 2).to_string());
    values.insert("script_table", table);
    // one pass, so substituted values are never scanned for placeholders
    let text = PLACEHOLDER_RE
        .replace_all(CONTROLLER_TEMPLATE, |caps: &Captures| {
            values
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned();

    Ok(ControllerScript {
        text,
        needs_elevated_privileges: all.iter().any(|item| item.requires_privilege),
    })
}

fn quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}
