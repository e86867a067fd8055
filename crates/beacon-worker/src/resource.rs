//! The resource check protocol.
//!
//! A resource image provides `/opt/resource/check`. It reads
//! `{"source": {...}, "version": {...}}` on stdin and prints a JSON array of
//! versions, oldest first, on stdout.

use beacon_core::backend::{ProcessOutput, ProcessSpec};
use beacon_core::check::{Source, Version};
use beacon_core::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;

pub const CHECK_SCRIPT: &str = "/opt/resource/check";

/// Bytes of stderr kept in a check failure message.
const STDERR_LIMIT: usize = 4096;

#[derive(Serialize)]
struct CheckInput<'a> {
    source: &'a Source,
    version: Option<&'a Version>,
}

pub fn check_process() -> ProcessSpec {
    ProcessSpec {
        path: CHECK_SCRIPT.to_string(),
        args: Vec::new(),
        dir: None,
        env: BTreeMap::new(),
    }
}

pub fn check_input(source: &Source, from_version: Option<&Version>) -> Result<Vec<u8>> {
    serde_json::to_vec(&CheckInput {
        source,
        version: from_version,
    })
    .map_err(|e| Error::Internal(format!("encode check input: {}", e)))
}

/// Interpret the output of a finished check process.
pub fn check_output(output: &ProcessOutput) -> Result<Vec<Version>> {
    if !output.success() {
        return Err(Error::CheckFailed(format!(
            "check script exited with status {}: {}",
            output.exit_code,
            stderr_excerpt(&output.stderr)
        )));
    }

    serde_json::from_slice(&output.stdout).map_err(|e| {
        Error::CheckFailed(format!(
            "malformed check output: {}: {}",
            e,
            String::from_utf8_lossy(&output.stdout)
        ))
    })
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_LIMIT {
        return text.to_string();
    }
    let mut end = STDERR_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
