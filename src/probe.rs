// src/probe.rs
// Best-effort probing of the machine: NVIDIA GPUs through nvidia-smi, Apple
// Silicon through a wgpu Metal adapter, system memory and cores through
// sysinfo. Nothing here returns an error; every failed probe falls through to
// the next backend and finally to CPU defaults.

use crate::device::DeviceKind;
use std::process::Command;
use sysinfo::System;

/// Memory assumed when the host refuses to report it.
pub const FALLBACK_MEMORY_GB: f64 = 8.0;
/// Core count assumed when the host refuses to report it.
pub const FALLBACK_CPU_CORES: usize = 4;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// What the probe saw on this machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub kind: DeviceKind,
    pub name: String,
    pub memory_gb: f64,
    pub cpu_cores: Option<usize>,
}

pub fn observe() -> Observation {
    if let Some(observation) = probe_cuda() {
        return observation;
    }
    if let Some(observation) = probe_metal() {
        return observation;
    }
    probe_cpu()
}

fn probe_cuda() -> Option<Observation> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .map_err(|e| log::debug!("nvidia-smi not available: {}", e))
        .ok()?;
    if !output.status.success() {
        log::debug!("nvidia-smi exited with {}", output.status);
        return None;
    }

    let (name, memory_gb) = parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))?;
    Some(Observation {
        kind: DeviceKind::Cuda,
        name,
        memory_gb,
        cpu_cores: None,
    })
}

/// Parse the first GPU line of `nvidia-smi --query-gpu=name,memory.total
/// --format=csv,noheader,nounits`. Memory is reported in MiB.
pub fn parse_nvidia_smi(stdout: &str) -> Option<(String, f64)> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (name, memory_mib) = line.rsplit_once(',')?;
    let memory_mib: f64 = memory_mib.trim().parse().ok()?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), memory_mib / 1024.0))
}

fn probe_metal() -> Option<Observation> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::METAL,
        ..Default::default()
    });

    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    let adapter = match adapter {
        Some(adapter) => adapter,
        None => {
            log::debug!("No Metal adapter found");
            return None;
        }
    };

    let info = adapter.get_info();
    if info.backend != wgpu::Backend::Metal {
        return None;
    }
    log::debug!("Metal adapter: {} ({:?})", info.name, info.device_type);

    // Unified memory: the GPU shares system RAM.
    let memory_gb = system_memory_gb().unwrap_or(FALLBACK_MEMORY_GB);
    Some(Observation {
        kind: DeviceKind::Mps,
        name: "Apple Silicon (MPS)".to_string(),
        memory_gb,
        cpu_cores: None,
    })
}

fn probe_cpu() -> Observation {
    let memory_gb = system_memory_gb().unwrap_or_else(|| {
        log::warn!("Could not read system memory, assuming {} GB", FALLBACK_MEMORY_GB);
        FALLBACK_MEMORY_GB
    });
    let cores = cpu_cores();
    Observation {
        kind: DeviceKind::Cpu,
        name: format!("CPU ({} cores)", cores.unwrap_or(FALLBACK_CPU_CORES)),
        memory_gb,
        cpu_cores: cores,
    }
}

fn system_memory_gb() -> Option<f64> {
    let mut sys = System::new();
    sys.refresh_memory();
    match sys.total_memory() {
        0 => None,
        bytes => Some(bytes as f64 / BYTES_PER_GB),
    }
}

fn cpu_cores() -> Option<usize> {
    let mut sys = System::new();
    sys.refresh_cpu();
    match sys.cpus().len() {
        0 => None,
        n => Some(n),
    }
}
