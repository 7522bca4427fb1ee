//! Static XID error catalog.
//!
//! A compile-time-known mapping from numeric XID code to a classified,
//! remediation-annotated entry. Read-only in-process table; never mutated.
//! Grounded on `get_xid_description`'s lookup table, expanded with
//! severity/category/remediation classification per entry.

use serde::{Deserialize, Serialize};

/// Severity of an XID event, worst-wins when aggregating across a fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Fatal,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
            Severity::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}

/// Rough subsystem an XID points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Hardware,
    Memory,
    Driver,
    Thermal,
    Power,
    Bus,
    Unknown,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Category::Hardware => "hardware",
            Category::Memory => "memory",
            Category::Driver => "driver",
            Category::Thermal => "thermal",
            Category::Power => "power",
            Category::Bus => "bus",
            Category::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A single catalog entry: what the XID means and what an SRE should do
/// about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XidCatalogEntry {
    pub code: u32,
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub category: Category,
    pub remediation: &'static str,
}

const CATALOG: &[XidCatalogEntry] = &[
    XidCatalogEntry {
        code: 13,
        name: "Graphics Engine Exception",
        description: "The GPU graphics/compute engine hit an exception, usually from a faulting kernel.",
        severity: Severity::Warning,
        category: Category::Driver,
        remediation: "Check the offending workload for out-of-bounds memory access; restart the pod if recurring.",
    },
    XidCatalogEntry {
        code: 31,
        name: "GPU Memory Page Fault",
        description: "A page fault occurred on the GPU, typically caused by an illegal memory access from a CUDA application.",
        severity: Severity::Critical,
        category: Category::Memory,
        remediation: "Inspect the reported process for out-of-bounds or use-after-free GPU memory access; consider draining the node if it recurs across workloads.",
    },
    XidCatalogEntry {
        code: 43,
        name: "GPU Stopped Processing",
        description: "The GPU stopped processing, generally triggered by a kernel failing to terminate.",
        severity: Severity::Critical,
        category: Category::Driver,
        remediation: "Check for a hung CUDA kernel; a node reboot may be required if the GPU does not recover.",
    },
    XidCatalogEntry {
        code: 45,
        name: "Preemptive Channel Removal",
        description: "Driver preemptively cleaned up a channel, usually as a consequence of an earlier error.",
        severity: Severity::Warning,
        category: Category::Driver,
        remediation: "Usually a follow-on effect of another XID on the same GPU; check for a concurrent fatal event.",
    },
    XidCatalogEntry {
        code: 48,
        name: "Double Bit ECC Error",
        description: "An uncorrectable double-bit ECC memory error was detected.",
        severity: Severity::Fatal,
        category: Category::Memory,
        remediation: "Drain the node and schedule a hardware inspection; double-bit ECC errors indicate a failing memory module.",
    },
    XidCatalogEntry {
        code: 61,
        name: "Internal Microcontroller Breakpoint",
        description: "An internal microcontroller hit a breakpoint or warning condition.",
        severity: Severity::Warning,
        category: Category::Hardware,
        remediation: "Monitor for recurrence; isolated occurrences are often benign firmware conditions.",
    },
    XidCatalogEntry {
        code: 62,
        name: "Internal Microcontroller Halt",
        description: "An internal microcontroller halted unexpectedly.",
        severity: Severity::Critical,
        category: Category::Hardware,
        remediation: "Reset the GPU if possible; persistent halts indicate a firmware or hardware fault requiring vendor support.",
    },
    XidCatalogEntry {
        code: 63,
        name: "ECC Page Retirement Recording Event",
        description: "A page was retired due to a multiple single-bit ECC error or a single double-bit ECC error.",
        severity: Severity::Warning,
        category: Category::Memory,
        remediation: "No immediate action required; track retired-page counts and plan replacement if they climb.",
    },
    XidCatalogEntry {
        code: 64,
        name: "ECC Page Retirement / Row Remap Recording Failure",
        description: "The driver failed to record a page retirement or row-remapping event, usually because the reserved space is exhausted.",
        severity: Severity::Critical,
        category: Category::Memory,
        remediation: "Schedule a hardware inspection; the GPU's ECC inventory is exhausted or otherwise unhealthy.",
    },
    XidCatalogEntry {
        code: 74,
        name: "NVLINK Error",
        description: "A hardware error was detected on an NVLINK interconnect link.",
        severity: Severity::Critical,
        category: Category::Bus,
        remediation: "Check NVLINK topology and cabling/board health; degraded links materially reduce multi-GPU throughput.",
    },
    XidCatalogEntry {
        code: 79,
        name: "GPU Has Fallen Off the Bus",
        description: "The GPU is no longer detected on the PCIe bus, usually indicating a severe hardware fault.",
        severity: Severity::Fatal,
        category: Category::Bus,
        remediation: "Drain and reboot the node immediately; if the GPU does not reappear, it requires physical reseating or replacement.",
    },
    XidCatalogEntry {
        code: 94,
        name: "Contained ECC Error",
        description: "An uncorrectable ECC error occurred but was contained to the application that caused it.",
        severity: Severity::Warning,
        category: Category::Memory,
        remediation: "The faulting workload was isolated; no cluster-wide action required unless it recurs.",
    },
    XidCatalogEntry {
        code: 95,
        name: "Uncontained ECC Error",
        description: "An uncorrectable ECC error occurred and could not be contained, potentially affecting other workloads on the GPU.",
        severity: Severity::Fatal,
        category: Category::Memory,
        remediation: "Drain the node; other workloads sharing the GPU may have been affected by the corruption.",
    },
];

fn unknown_entry(code: u32) -> XidCatalogEntry {
    XidCatalogEntry {
        code,
        name: "Unknown XID",
        description: "This XID code is not in the known catalog.",
        severity: Severity::Warning,
        category: Category::Unknown,
        remediation: "Consult NVIDIA's XID error reference for this code; no automated remediation is known.",
    }
}

/// Look up a catalog entry by code. A pure function: unknown codes always
/// return the same generic entry (category `unknown`, severity `warning`).
pub fn lookup(code: u32) -> XidCatalogEntry {
    CATALOG
        .iter()
        .find(|e| e.code == code)
        .cloned()
        .unwrap_or_else(|| unknown_entry(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimum_required_codes_are_present() {
        for code in [13, 31, 43, 45, 48, 61, 62, 63, 64, 74, 79, 94, 95] {
            let entry = lookup(code);
            assert_eq!(entry.code, code);
            assert_ne!(entry.category, Category::Unknown);
        }
    }

    #[test]
    fn unknown_code_is_warning_and_unknown_category() {
        let entry = lookup(999_999);
        assert_eq!(entry.severity, Severity::Warning);
        assert_eq!(entry.category, Category::Unknown);
    }

    #[test]
    fn xid_48_is_fatal_double_bit_ecc() {
        let entry = lookup(48);
        assert_eq!(entry.severity, Severity::Fatal);
        assert_eq!(entry.category, Category::Memory);
    }

    #[test]
    fn severity_ordering_supports_worst_wins() {
        assert!(Severity::Fatal > Severity::Critical);
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }
}
