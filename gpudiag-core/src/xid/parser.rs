//! Kernel-log XID extraction.
//!
//! Prefers a direct read of the kernel ring buffer device (`/dev/kmsg`) and
//! falls back to invoking a `dmesg`-class binary when that device is not
//! accessible. Both sources are treated as a line-oriented stream; lines not
//! matching the XID grammar are ignored, never treated as a failure.
//!
//! Grounded on the dmesg-parsing shape of `get_xid_errors`, generalized to
//! prefer `/dev/kmsg` and to capture `pid=`/`name=` fragments alongside the
//! XID code and PCI bus id.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A single parsed GPU hardware exception extracted from kernel logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XidEvent {
    pub code: u32,
    /// Lowercase `domain:bus:device.function`, for case-insensitive join
    /// against device records.
    pub pci_bus_id: String,
    pub pid: Option<u32>,
    pub process_name: Option<String>,
    pub raw_line: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Why the kernel log could not be read at all. The calling tool converts
/// this into a degraded `status: error` document with a remediation hint,
/// never a protocol-level error.
#[derive(Debug, Error)]
pub enum KernelLogError {
    #[error("permission denied reading kernel log: {0}")]
    PermissionDenied(String),

    #[error("kernel log source not available: {0}")]
    NotAvailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const KMSG_DEVICE: &str = "/dev/kmsg";
/// How long to wait for another line from `/dev/kmsg` before treating the
/// buffer as drained. `/dev/kmsg` blocks between entries; a one-shot scan
/// has to bound that wait rather than tail forever.
const KMSG_IDLE_TIMEOUT: Duration = Duration::from_millis(75);
const MAX_KMSG_LINES: usize = 20_000;

/// Read the currently-buffered kernel log, preferring `/dev/kmsg` and
/// falling back to a `dmesg`-class binary in `PATH`.
pub async fn read_kernel_log(token: &CancellationToken) -> Result<Vec<String>, KernelLogError> {
    if token.is_cancelled() {
        return Err(KernelLogError::Cancelled);
    }

    match read_kmsg(token).await {
        Ok(lines) => Ok(lines),
        Err(e) => {
            debug!(error = %e, "/dev/kmsg unavailable, falling back to dmesg");
            read_dmesg(token).await
        }
    }
}

async fn read_kmsg(token: &CancellationToken) -> Result<Vec<String>, KernelLogError> {
    let file = tokio::fs::File::open(KMSG_DEVICE).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            KernelLogError::PermissionDenied(format!("{KMSG_DEVICE}: {e}"))
        } else {
            KernelLogError::NotAvailable(format!("{KMSG_DEVICE}: {e}"))
        }
    })?;

    let mut reader = BufReader::new(file);
    let mut lines = Vec::new();

    loop {
        if token.is_cancelled() {
            return Err(KernelLogError::Cancelled);
        }
        if lines.len() >= MAX_KMSG_LINES {
            break;
        }

        let mut line = String::new();
        match tokio::time::timeout(KMSG_IDLE_TIMEOUT, reader.read_line(&mut line)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => lines.push(line),
            Ok(Err(e)) => return Err(KernelLogError::Io(e)),
            // No new entry within the idle window: treat the buffer as
            // drained for this one-shot scan.
            Err(_) => break,
        }
    }

    Ok(lines)
}

async fn read_dmesg(token: &CancellationToken) -> Result<Vec<String>, KernelLogError> {
    if token.is_cancelled() {
        return Err(KernelLogError::Cancelled);
    }

    let output = tokio::process::Command::new("dmesg")
        .arg("-T")
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KernelLogError::NotAvailable("dmesg binary not found in PATH".to_string())
            } else {
                KernelLogError::Io(e)
            }
        })?;

    if !output.status.success() {
        return Err(KernelLogError::NotAvailable(format!(
            "dmesg exited with status {}",
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.to_string())
        .collect())
}

static XID_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Xid \(PCI:([0-9a-fA-F:.]+)\):\s*(\d+)").unwrap());
static PID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"pid='(\d+)'").unwrap());
static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"name=([^,\s]+)").unwrap());

/// Extract XID events from a slice of kernel log lines. Lines that don't
/// contain both `NVRM` and `Xid` (case-sensitive substrings) are skipped
/// before the regex is even attempted; unrecognized lines never fail the
/// scan, they're just ignored.
pub fn parse_xid_events(lines: &[String]) -> Vec<XidEvent> {
    let mut events = Vec::new();

    for line in lines {
        if !(line.contains("NVRM") && line.contains("Xid")) {
            continue;
        }

        let Some(caps) = XID_LINE_RE.captures(line) else {
            continue;
        };
        let Ok(code) = caps[2].parse::<u32>() else {
            continue;
        };
        let pci_bus_id = caps[1].to_ascii_lowercase();

        let pid = PID_RE
            .captures(line)
            .and_then(|c| c[1].parse::<u32>().ok());
        let process_name = NAME_RE.captures(line).map(|c| c[1].to_string());

        trace!(code, pci_bus_id = %pci_bus_id, "parsed XID event");
        events.push(XidEvent {
            code,
            pci_bus_id,
            pid,
            process_name,
            raw_line: line.clone(),
            timestamp: None,
        });
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn extracts_code_and_pci_bus_id() {
        let lines = vec![line(
            "[100.0] NVRM: Xid (PCI:0000:01:00.0): 48, pid='1234', name=python3",
        )];
        let events = parse_xid_events(&lines);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].code, 48);
        assert_eq!(events[0].pci_bus_id, "0000:01:00.0");
        assert_eq!(events[0].pid, Some(1234));
        assert_eq!(events[0].process_name.as_deref(), Some("python3"));
    }

    #[test]
    fn canonicalizes_bus_id_case() {
        let lines = vec![line("NVRM: Xid (PCI:0000:AB:00.0): 79")];
        let events = parse_xid_events(&lines);
        assert_eq!(events[0].pci_bus_id, "0000:ab:00.0");
    }

    #[test]
    fn tolerates_missing_optional_fields() {
        let lines = vec![line("NVRM: Xid (PCI:0000:02:00.0): 13")];
        let events = parse_xid_events(&lines);
        assert_eq!(events.len(), 1);
        assert!(events[0].pid.is_none());
        assert!(events[0].process_name.is_none());
    }

    #[test]
    fn ignores_unrelated_lines() {
        let lines = vec![
            line("some unrelated kernel message"),
            line("NVRM: loading NVIDIA driver"),
            line("NVRM: Xid (PCI:0000:03:00.0): 31, pid='42', name=worker"),
        ];
        let events = parse_xid_events(&lines);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].code, 31);
    }
}
