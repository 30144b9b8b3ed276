use std::fmt;
use std::process::Command;

use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accelerator {
    Cuda,
    Metal,
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accelerator::Cuda => f.write_str("cuda"),
            Accelerator::Metal => f.write_str("metal"),
        }
    }
}

/// Diagnostic description of an accelerator. Metrics the runtime cannot
/// report are left as `None`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AcceleratorInfo {
    pub name: String,
    pub capability: Option<String>,
    pub free_gib: Option<f64>,
    pub total_gib: Option<f64>,
}

impl fmt::Display for AcceleratorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let capability = self.capability.as_deref().unwrap_or("unknown");
        match (self.free_gib, self.total_gib) {
            (Some(free), Some(total)) => write!(
                f,
                "{} - {} - {:.2}/{:.2} GB VRAM",
                self.name, capability, free, total
            ),
            _ => write!(f, "{} - {} - unknown VRAM", self.name, capability),
        }
    }
}

/// The compute runtime the device selector interrogates.
pub trait AcceleratorRuntime {
    /// The accelerator that should host tensors, if any is usable.
    fn available(&self) -> Option<Accelerator>;

    fn open(&self, accelerator: Accelerator, ordinal: usize) -> Result<Device>;

    fn describe(&self, accelerator: Accelerator, ordinal: usize) -> AcceleratorInfo;
}

/// Accelerator runtime backed by the candle build features.
pub struct CandleRuntime;

impl AcceleratorRuntime for CandleRuntime {
    fn available(&self) -> Option<Accelerator> {
        if cuda_is_available() {
            Some(Accelerator::Cuda)
        } else if metal_is_available() {
            Some(Accelerator::Metal)
        } else {
            None
        }
    }

    fn open(&self, accelerator: Accelerator, ordinal: usize) -> Result<Device> {
        match accelerator {
            Accelerator::Cuda => Ok(Device::new_cuda(ordinal)?),
            Accelerator::Metal => Ok(Device::new_metal(ordinal)?),
        }
    }

    fn describe(&self, accelerator: Accelerator, ordinal: usize) -> AcceleratorInfo {
        match accelerator {
            Accelerator::Cuda => query_nvidia_smi(ordinal).unwrap_or_else(|| AcceleratorInfo {
                name: format!("CUDA device {ordinal}"),
                ..Default::default()
            }),
            Accelerator::Metal => AcceleratorInfo {
                name: format!("Metal device {ordinal}"),
                ..Default::default()
            },
        }
    }
}

/// Picks the device that should host the model's tensors.
///
/// Falls back to the CPU when no accelerator is reported. An accelerator
/// that is reported but cannot be opened is an error, never a silent
/// downgrade.
pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    select_device_with(&CandleRuntime, device_map)
}

pub fn select_device_with<R>(runtime: &R, device_map: DeviceMap) -> Result<Device>
where
    R: AcceleratorRuntime + ?Sized,
{
    let ordinal = match device_map {
        DeviceMap::ForceCpu => {
            info!("CPU requested, skipping accelerator detection");
            return Ok(Device::Cpu);
        }
        DeviceMap::Ordinal(ordinal) => ordinal,
    };

    debug!("checking for the availability of an accelerator");
    let Some(accelerator) = runtime.available() else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        info!("running on CPU, to run on GPU (metal) build with `--features metal`");
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        info!("running on CPU, to run on GPU build with `--features cuda`");
        return Ok(Device::Cpu);
    };

    let device = runtime
        .open(accelerator, ordinal)
        .with_context(|| format!("failed to open {accelerator} device {ordinal}"))?;
    let details = runtime.describe(accelerator, ordinal);
    info!(%accelerator, ordinal, "accelerator available [{details}]");
    Ok(device)
}

fn query_nvidia_smi(ordinal: usize) -> Option<AcceleratorInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,compute_cap,memory.free,memory.total",
            "--format=csv,noheader,nounits",
        ])
        .arg(format!("--id={ordinal}"))
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_nvidia_smi(stdout.lines().next()?)
}

// nvidia-smi reports memory in MiB.
fn parse_nvidia_smi(line: &str) -> Option<AcceleratorInfo> {
    let mut fields = line.split(',').map(str::trim);
    let name = fields.next().filter(|name| !name.is_empty())?.to_string();
    let capability = fields.next().map(str::to_string);
    let free_gib = fields.next().and_then(|v| v.parse::<f64>().ok()).map(|mib| mib / 1024.0);
    let total_gib = fields.next().and_then(|v| v.parse::<f64>().ok()).map(|mib| mib / 1024.0);
    Some(AcceleratorInfo {
        name,
        capability,
        free_gib,
        total_gib,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct FakeRuntime {
        accelerator: Option<Accelerator>,
        fail_open: bool,
        queries: Cell<usize>,
        opens: Cell<usize>,
    }

    impl AcceleratorRuntime for FakeRuntime {
        fn available(&self) -> Option<Accelerator> {
            self.queries.set(self.queries.get() + 1);
            self.accelerator
        }

        fn open(&self, _accelerator: Accelerator, ordinal: usize) -> Result<Device> {
            self.opens.set(self.opens.get() + 1);
            if self.fail_open {
                anyhow::bail!("driver not loaded for ordinal {ordinal}");
            }
            Ok(Device::Cpu)
        }

        fn describe(&self, _accelerator: Accelerator, ordinal: usize) -> AcceleratorInfo {
            AcceleratorInfo {
                name: format!("fake {ordinal}"),
                ..Default::default()
            }
        }
    }

    #[test]
    fn no_accelerator_falls_back_to_cpu() {
        let runtime = FakeRuntime::default();
        let device = select_device_with(&runtime, DeviceMap::default()).unwrap();
        assert!(device.is_cpu());
        assert_eq!(runtime.queries.get(), 1);
        assert_eq!(runtime.opens.get(), 0);
    }

    #[test]
    fn force_cpu_skips_detection() {
        let runtime = FakeRuntime {
            accelerator: Some(Accelerator::Cuda),
            ..Default::default()
        };
        let device = select_device_with(&runtime, DeviceMap::ForceCpu).unwrap();
        assert!(device.is_cpu());
        assert_eq!(runtime.queries.get(), 0);
    }

    #[test]
    fn available_accelerator_is_opened() {
        let runtime = FakeRuntime {
            accelerator: Some(Accelerator::Metal),
            ..Default::default()
        };
        select_device_with(&runtime, DeviceMap::Ordinal(1)).unwrap();
        assert_eq!(runtime.opens.get(), 1);
    }

    #[test]
    fn open_failure_is_not_downgraded() {
        let runtime = FakeRuntime {
            accelerator: Some(Accelerator::Cuda),
            fail_open: true,
            ..Default::default()
        };
        let err = select_device_with(&runtime, DeviceMap::default()).unwrap_err();
        assert!(err.to_string().contains("cuda device 0"));
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    #[test]
    fn cpu_only_build_selects_cpu() {
        assert!(select_best_device(DeviceMap::default()).unwrap().is_cpu());
    }

    #[test]
    fn parses_nvidia_smi_line() {
        let info = parse_nvidia_smi("NVIDIA A100-SXM4-40GB, 8.0, 39936, 40960").unwrap();
        assert_eq!(info.name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(info.capability.as_deref(), Some("8.0"));
        assert_eq!(info.free_gib, Some(39.0));
        assert_eq!(info.total_gib, Some(40.0));
        assert_eq!(
            info.to_string(),
            "NVIDIA A100-SXM4-40GB - 8.0 - 39.00/40.00 GB VRAM"
        );
    }

    #[test]
    fn partial_nvidia_smi_output_keeps_name() {
        let info = parse_nvidia_smi("Tesla T4, [N/A], , ").unwrap();
        assert_eq!(info.name, "Tesla T4");
        assert_eq!(info.free_gib, None);
        assert!(parse_nvidia_smi("").is_none());
    }
}
