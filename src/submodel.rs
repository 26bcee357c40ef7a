//! A sub-model of the checkpoint together with the var store holding its
//! weights, so that it can be moved between host and accelerator memory.
use std::collections::HashMap;
use std::path::Path;

use tch::{nn, Device, Kind, Tensor};

use crate::checkpoint;
use crate::residency::Resident;

/// The three parts a latent diffusion checkpoint is split into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubModelKind {
    /// The UNet denoiser.
    Unet,
    /// The CLIP text conditioner.
    TextEncoder,
    /// The variational autoencoder mapping pixels to latents and back.
    Autoencoder,
}

impl SubModelKind {
    pub const ALL: [SubModelKind; 3] =
        [SubModelKind::Unet, SubModelKind::TextEncoder, SubModelKind::Autoencoder];

    /// The name used on the command line, e.g. for `--cpu`.
    pub fn name(&self) -> &'static str {
        match self {
            SubModelKind::Unet => "unet",
            SubModelKind::TextEncoder => "clip",
            SubModelKind::Autoencoder => "vae",
        }
    }
}

impl std::fmt::Display for SubModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the weights of a single sub-model are read from.
pub enum Weights<'a> {
    /// A weight file in a format `VarStore::load` understands.
    File(&'a Path),
    /// Tensors already split out of a combined checkpoint.
    Tensors(HashMap<String, Tensor>),
}

/// A model and the var store it was built on.
///
/// The model holds shallow copies of the var store variables, moving the var
/// store moves the model.
pub struct SubModel<M> {
    kind: SubModelKind,
    vs: nn::VarStore,
    model: M,
    target: Device,
    storage: Kind,
}

impl<M> std::fmt::Debug for SubModel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubModel")
            .field("kind", &self.kind)
            .field("device", &self.vs.device())
            .field("target", &self.target)
            .field("storage", &self.storage)
            .finish()
    }
}

impl<M> SubModel<M> {
    /// Builds the model on its compute device, loads its weights and parks it
    /// in host memory. With a `Half` storage kind the weights are converted
    /// once loaded.
    ///
    /// Models keep tensors that are not variables (position ids, timestep
    /// frequencies) on the device their var store had at construction, so
    /// they have to be built against `target`.
    pub fn build<F>(
        kind: SubModelKind,
        target: Device,
        storage: Kind,
        weights: Weights<'_>,
        f: F,
    ) -> anyhow::Result<Self>
    where
        F: FnOnce(nn::Path) -> M,
    {
        let mut vs = nn::VarStore::new(target);
        let model = f(vs.root());
        match weights {
            Weights::File(path) => {
                tracing::info!("loading {kind} weights from {path:?}");
                vs.load(path).map_err(|e| {
                    anyhow::Error::new(e).context(format!("error loading {kind} weights"))
                })?;
            }
            Weights::Tensors(tensors) => checkpoint::copy_into(kind, &vs, tensors)?,
        }
        if storage == Kind::Half {
            vs.half();
        }
        if target != Device::Cpu {
            vs.set_device(Device::Cpu);
        }
        Ok(Self { kind, vs, model, target, storage })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn kind(&self) -> SubModelKind {
        self.kind
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    /// The kind inputs have to be converted to before being fed to the model.
    pub fn storage(&self) -> Kind {
        self.storage
    }

    /// Whether forward passes run under autocast, i.e. with half precision
    /// weights.
    pub fn autocast(&self) -> bool {
        self.storage == Kind::Half
    }

    /// Runs a forward pass, under autocast for half precision weights so
    /// that the single precision tensors the model creates internally mix
    /// with them.
    pub fn forward_with<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&M) -> T,
    {
        if self.autocast() {
            tch::autocast(true, || f(&self.model))
        } else {
            f(&self.model)
        }
    }

    /// Converts an input tensor to the device and kind of this sub-model.
    pub fn input(&self, xs: &Tensor) -> Tensor {
        let xs = xs.to_device(self.device());
        if xs.is_floating_point() {
            xs.to_kind(self.storage)
        } else {
            xs
        }
    }
}

impl<M> Resident for SubModel<M> {
    fn footprint_bytes(&self) -> u64 {
        self.vs
            .variables()
            .values()
            .map(|v| (v.numel() * v.kind().elt_size_in_bytes()) as u64)
            .sum()
    }

    fn target_device(&self) -> Device {
        self.target
    }

    fn current_device(&self) -> Device {
        self.vs.device()
    }

    fn move_to(&mut self, device: Device) -> anyhow::Result<()> {
        let previous = self.vs.device();
        if previous == device {
            return Ok(());
        }
        tracing::debug!("moving {} from {previous:?} to {device:?}", self.kind);
        self.vs.set_device(device);
        for d in [previous, device] {
            if let Device::Cuda(index) = d {
                tch::Cuda::synchronize(index as i64);
            }
        }
        Ok(())
    }
}
