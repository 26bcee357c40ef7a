// A simple wrapper around File::open adding details about the
// problematic file.
use std::path::Path;
use tch::Device;

use crate::submodel::SubModelKind;

pub(crate) fn file_open<P: AsRef<Path>>(path: P) -> anyhow::Result<std::fs::File> {
    std::fs::File::open(path.as_ref()).map_err(|e| {
        let context = format!("error opening {:?}", path.as_ref().to_string_lossy());
        anyhow::Error::new(e).context(context)
    })
}

/// Decides which device each sub-model computes on. Sub-models listed in
/// `cpu` (or all of them with `all`) stay on the host.
#[derive(Debug, Clone)]
pub struct DeviceSetup {
    accelerator_device: Device,
    cpu: Vec<String>,
}

impl DeviceSetup {
    pub fn new(cpu: Vec<String>) -> Self {
        let accelerator_device =
            if tch::utils::has_mps() { Device::Mps } else { Device::cuda_if_available() };
        Self { accelerator_device, cpu }
    }

    pub fn with_accelerator(accelerator_device: Device, cpu: Vec<String>) -> Self {
        Self { accelerator_device, cpu }
    }

    pub fn accelerator(&self) -> Device {
        self.accelerator_device
    }

    pub fn get(&self, kind: SubModelKind) -> Device {
        if self.cpu.iter().any(|c| c == "all" || c == kind.name()) {
            Device::Cpu
        } else {
            self.accelerator_device
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_overrides() {
        let setup = DeviceSetup::with_accelerator(Device::Cuda(0), vec!["clip".to_string()]);
        assert_eq!(setup.get(SubModelKind::TextEncoder), Device::Cpu);
        assert_eq!(setup.get(SubModelKind::Unet), Device::Cuda(0));

        let setup = DeviceSetup::with_accelerator(Device::Cuda(0), vec!["all".to_string()]);
        for kind in SubModelKind::ALL {
            assert_eq!(setup.get(kind), Device::Cpu);
        }
    }
}
