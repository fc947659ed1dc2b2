//! Tokio worker-pool sizing.
//!
//! Containers usually pin this service to a cpu quota well below the host
//! core count; sizing the pool from the quota avoids spawning a pile of
//! idle worker threads on large hosts.

/// Worker count: `GATEWAY_WORKER_THREADS` override, else the cgroup cpu
/// quota when one is imposed, else the host core count.
pub fn worker_threads() -> usize {
    env_override()
        .or_else(cgroup_quota)
        .unwrap_or_else(host_cpus)
        .max(1)
}

fn env_override() -> Option<usize> {
    std::env::var("GATEWAY_WORKER_THREADS")
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Whole cores granted by the cgroup this process runs in. Both layouts
/// boil down to a quota/period pair: cgroup v2 keeps it in one `cpu.max`
/// file, v1 in two separate files.
fn cgroup_quota() -> Option<usize> {
    let v2 = || std::fs::read_to_string("/sys/fs/cgroup/cpu.max").ok();
    let v1 = || {
        let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us").ok()?;
        let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us").ok()?;
        Some(format!("{} {}", quota.trim(), period.trim()))
    };
    let raw = v2().or_else(v1)?;
    quota_to_cores(&raw)
}

/// `"<quota> <period>"` in microseconds → whole cores. `"max"` and
/// negative quotas mean unlimited.
fn quota_to_cores(raw: &str) -> Option<usize> {
    let mut fields = raw.split_whitespace();
    let quota = fields.next()?;
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = fields.next()?.parse().ok()?;
    if quota <= 0 || period <= 0 {
        return None;
    }
    Some(((quota / period) as usize).max(1))
}

fn host_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}
