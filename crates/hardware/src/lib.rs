//! Zenith hardware profiler: a point-in-time read of host cores and RAM,
//! turned into a worker/heap plan for the build toolchain.

#![forbid(unsafe_code)]

use tracing::{info, warn};
use zenith_core::{plan_heap, plan_workers, BuildError, HardwareProfile, FALLBACK_WORKERS, MIN_HEAP_BYTES};

/// Source of raw host counts. The live implementation reads the OS; tests inject values.
pub trait HostInfo: Send + Sync {
    fn cpu_cores(&self) -> Result<usize, BuildError>;
    fn total_ram_bytes(&self) -> Result<u64, BuildError>;
}

/// Reads the running host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl HostInfo for SystemHost {
    fn cpu_cores(&self) -> Result<usize, BuildError> {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .map_err(|e| BuildError::Profiling(format!("cpu count unavailable: {}", e)))
    }

    fn total_ram_bytes(&self) -> Result<u64, BuildError> {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        match sys.total_memory() {
            0 => Err(BuildError::Profiling("total memory reported as 0".into())),
            n => Ok(n),
        }
    }
}

/// Strict profile: fails if either count cannot be read.
pub fn try_profile_with(host: &dyn HostInfo) -> Result<HardwareProfile, BuildError> {
    let cores = host.cpu_cores()?;
    let ram = host.total_ram_bytes()?;
    Ok(HardwareProfile::derive(cores, ram))
}

/// Never fails: each unreadable count falls back to the conservative plan
/// (4 workers, 4 GiB heap) with a warning.
pub fn profile_with(host: &dyn HostInfo) -> HardwareProfile {
    let mut hw = HardwareProfile::conservative();
    match host.cpu_cores() {
        Ok(cores) => {
            hw.cpu_cores = cores;
            hw.max_workers = plan_workers(cores);
        }
        Err(e) => warn!(error = %e, fallback_workers = FALLBACK_WORKERS, "hardware: core count unavailable"),
    }
    match host.total_ram_bytes() {
        Ok(ram) => {
            hw.total_ram_bytes = ram;
            hw.heap_bytes = plan_heap(ram);
        }
        Err(e) => warn!(error = %e, fallback_heap_mib = MIN_HEAP_BYTES / zenith_core::MIB, "hardware: memory size unavailable"),
    }
    info!(
        cores = hw.cpu_cores,
        ram_mib = hw.total_ram_bytes / zenith_core::MIB,
        workers = hw.max_workers,
        heap_mib = hw.heap_mib(),
        "hardware: profile ready"
    );
    hw
}

pub fn try_profile() -> Result<HardwareProfile, BuildError> { try_profile_with(&SystemHost) }

pub fn profile() -> HardwareProfile { profile_with(&SystemHost) }
