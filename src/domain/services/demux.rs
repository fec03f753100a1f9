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

//! Splits controller output back into per-script results

use crate::domain::services::controller::BLOCK_DELIMITER;
use crate::domain::{ExecutionResult, INDETERMINATE_EXIT_CODE};
use log::warn;
use std::collections::HashMap;

const NAME_MARKER: &str = "SCRIPT NAME: ";
const STDOUT_MARKER: &str = "STDOUT:";
const STDERR_MARKER: &str = "STDERR:";
const EXIT_CODE_MARKER: &str = "EXIT CODE:";

#[derive(Clone, Copy, PartialEq)]
enum Section {
    Header,
    Stdout,
    Stderr,
    Done,
}

/// Parse the framed blocks printed by a controller.
///
/// Results are keyed by the original script name. Malformed blocks are skipped
/// with a warning; a script without a block is absent from the map, which
/// callers must treat as failed rather than successful.
pub fn parse_controller_output(output: &str) -> HashMap<String, ExecutionResult> {
    let mut results = HashMap::new();
    let delimiter = format!("{BLOCK_DELIMITER}\n");
    for block in output.split(delimiter.as_str()) {
        let lines: Vec<&str> = block.split('\n').collect();
        // name, both stream markers and the exit code
        if lines.len() < 4 {
            continue;
        }
        match parse_block(&lines) {
            Some(result) => {
                results.insert(result.name.clone(), result);
            }
            None => warn!(
                "skipping controller output block without a script name: {}",
                lines[0]
            ),
        }
    }
    results
}

fn parse_block(lines: &[&str]) -> Option<ExecutionResult> {
    let name = lines[0].strip_prefix(NAME_MARKER)?;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;
    let mut section = Section::Header;

    for line in &lines[1..] {
        if section == Section::Done {
            break;
        }
        if *line == STDOUT_MARKER {
            section = Section::Stdout;
        } else if *line == STDERR_MARKER {
            section = Section::Stderr;
        } else if let Some(code) = line.strip_prefix(EXIT_CODE_MARKER) {
            exit_code = Some(code.trim());
            section = Section::Done;
        } else {
            match section {
                Section::Stdout => stdout.push(*line),
                Section::Stderr => stderr.push(*line),
                Section::Header | Section::Done => {}
            }
        }
    }

    let exit_code = match exit_code.map(str::parse::<i32>) {
        Some(Ok(code)) => code,
        Some(Err(_)) => {
            warn!(
                "malformed exit code for script '{}', using {}",
                name, INDETERMINATE_EXIT_CODE
            );
            INDETERMINATE_EXIT_CODE
        }
        None => {
            warn!(
                "missing exit code for script '{}', using {}",
                name, INDETERMINATE_EXIT_CODE
            );
            INDETERMINATE_EXIT_CODE
        }
    };

    Some(ExecutionResult {
        name: name.to_string(),
        stdout: join_lines(&stdout),
        stderr: join_lines(&stderr),
        exit_code,
    })
}

/// Join collected lines; a trailing newline is added only when something was collected
fn join_lines(lines: &[&str]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        let mut joined = lines.join("\n");
        joined.push('\n');
        joined
    }
}
