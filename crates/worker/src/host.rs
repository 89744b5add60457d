// Path: crates/worker/src/host.rs
//! Coarse host facts for registration and heartbeats.

use gantry_types::model::SystemStats;

/// Best-effort hostname: the HOSTNAME environment variable, then the
/// kernel's record, then a fixed fallback.
pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    "unknown-host".to_string()
}

/// Samples host statistics. Fields that cannot be read stay zero.
pub fn system_stats() -> SystemStats {
    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(0);

    let (memory_total_bytes, memory_available_bytes) = read_meminfo().unwrap_or((0, 0));
    let load_average = read_loadavg().unwrap_or(0.0);

    SystemStats {
        cpu_count,
        memory_total_bytes,
        memory_available_bytes,
        load_average,
    }
}

fn read_meminfo() -> Option<(u64, u64)> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        match parts.next()? {
            "MemTotal:" => total = parts.next()?.parse::<u64>().ok(),
            "MemAvailable:" => available = parts.next()?.parse::<u64>().ok(),
            _ => {}
        }
        if total.is_some() && available.is_some() {
            break;
        }
    }
    Some((total? * 1024, available? * 1024))
}

fn read_loadavg() -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/loadavg").ok()?;
    contents.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn stats_sample_does_not_panic() {
        let stats = system_stats();
        // CPU count is the one field every platform can report.
        assert!(stats.cpu_count > 0);
    }
}
