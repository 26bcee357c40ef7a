// Checks that need an accelerator, they return early when cuda is not
// available.
use std::collections::HashMap;

use img2img::residency::Resident;
use img2img::submodel::{SubModel, SubModelKind, Weights};
use tch::{nn, nn::Module, Device, Kind, Tensor};

fn cuda() -> Option<Device> {
    tch::Cuda::is_available().then_some(Device::Cuda(0))
}

// A linear layer followed by a constant that is not a variable, the way
// position ids or timestep frequencies are kept by the diffusion models.
#[derive(Debug)]
struct Shifted {
    proj: nn::Linear,
    shift: Tensor,
}

impl Module for Shifted {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.proj) + &self.shift
    }
}

fn shifted(p: nn::Path) -> Shifted {
    let proj = nn::linear(&p / "proj", 3, 2, Default::default());
    let shift = Tensor::ones([2], (Kind::Float, p.device()));
    Shifted { proj, shift }
}

fn weights() -> HashMap<String, Tensor> {
    let cpu = (Kind::Float, Device::Cpu);
    HashMap::from([
        ("proj.weight".to_string(), Tensor::ones([2, 3], cpu)),
        ("proj.bias".to_string(), Tensor::zeros([2], cpu)),
    ])
}

fn build(gpu: Device, storage: Kind) -> anyhow::Result<SubModel<Shifted>> {
    SubModel::build(SubModelKind::Unet, gpu, storage, Weights::Tensors(weights()), shifted)
}

#[test]
fn moved_model_runs_on_the_accelerator() -> anyhow::Result<()> {
    let Some(gpu) = cuda() else { return Ok(()) };
    let mut model = build(gpu, Kind::Float)?;
    assert_eq!(model.current_device(), Device::Cpu);
    model.move_to(gpu)?;
    let xs = model.input(&Tensor::ones([1, 3], (Kind::Float, Device::Cpu)));
    let ys = model.forward_with(|m| m.forward(&xs));
    assert_eq!(ys.device(), gpu);
    assert_eq!(ys.double_value(&[0, 0]), 4.0);
    model.move_to(Device::Cpu)?;
    assert_eq!(model.current_device(), Device::Cpu);
    Ok(())
}

#[test]
fn half_weights_mix_with_single_precision_tensors() -> anyhow::Result<()> {
    let Some(gpu) = cuda() else { return Ok(()) };
    let mut model = build(gpu, Kind::Half)?;
    model.move_to(gpu)?;
    // Deliberately not converted to half.
    let xs = Tensor::ones([1, 3], (Kind::Float, gpu));
    let ys = model.forward_with(|m| m.forward(&xs));
    assert_eq!(ys.size(), [1, 2]);
    assert_eq!(ys.to_kind(Kind::Float).double_value(&[0, 1]), 4.0);
    Ok(())
}
