//! Resident-memory probe for plugin sandbox ceilings.

use conductor_core::plugin::sandbox::MemoryProbe;

/// Reads `VmRSS` from `/proc/self/status`. Reports `None` on platforms
/// without procfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn current_usage_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

/// Extract `VmRSS` (reported in kB) from a `/proc/<pid>/status` body, in bytes.
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    let unit = fields.next().unwrap_or("kB");
    match unit {
        "kB" => Some(value * 1024),
        "mB" | "MB" => Some(value * 1024 * 1024),
        _ => None,
    }
}
