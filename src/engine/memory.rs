use std::sync::Arc;

/// Number of hostnames that still fit in memory, computed on demand.
pub type MemoryLimit = Arc<dyn Fn() -> usize + Send + Sync>;

// average hostname length * bytes per char * safety factor
const BYTES_PER_HOST: u64 = 18 * 2 * 6;

const FALLBACK_LINES: usize = 500_000;

pub fn lines_available() -> usize {
    match free_memory_bytes() {
        Some(free) => (free / BYTES_PER_HOST) as usize,
        None => FALLBACK_LINES,
    }
}

pub fn system_memory_limit() -> MemoryLimit {
    Arc::new(lines_available)
}

pub fn fixed_memory_limit(lines: usize) -> MemoryLimit {
    Arc::new(move || lines)
}

#[cfg(target_os = "linux")]
fn free_memory_bytes() -> Option<u64> {
    // SAFETY: sysinfo only writes into the zeroed struct we own.
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } != 0 {
        return None;
    }
    Some(info.freeram as u64 * info.mem_unit.max(1) as u64)
}

#[cfg(not(target_os = "linux"))]
fn free_memory_bytes() -> Option<u64> {
    None
}
