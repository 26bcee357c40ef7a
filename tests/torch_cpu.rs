// Checks of the libtorch backed pieces, run on the CPU with tiny models.
use std::collections::HashMap;

use img2img::checkpoint::{self, KeyRemapper};
use img2img::image_io;
use img2img::residency::Resident;
use img2img::submodel::{SubModel, SubModelKind, Weights};
use img2img::Error;
use tch::{nn, nn::Module, Device, Kind, Tensor};

const CPU_F32: (Kind, Device) = (Kind::Float, Device::Cpu);

fn tiny_model(p: nn::Path) -> nn::Linear {
    nn::linear(&p / "proj", 3, 2, Default::default())
}

fn tiny_weights() -> HashMap<String, Tensor> {
    HashMap::from([
        ("proj.weight".to_string(), Tensor::ones([2, 3], CPU_F32)),
        ("proj.bias".to_string(), Tensor::zeros([2], CPU_F32)),
    ])
}

#[test]
fn remapped_checkpoint_is_copied() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("combined.ot");
    let weight = Tensor::ones([2, 3], CPU_F32);
    let bias = Tensor::zeros([2], CPU_F32);
    let other = Tensor::ones([1], CPU_F32);
    Tensor::save_multi(
        &[("vae.proj.weight", &weight), ("vae.proj.bias", &bias), ("model_ema.decay", &other)],
        &path,
    )?;

    let tensors = checkpoint::read_tensors(&path)?;
    let mut parts = KeyRemapper::default().partition(tensors);
    assert_eq!(parts.ignored, vec!["model_ema.decay".to_string()]);

    let vs = nn::VarStore::new(Device::Cpu);
    let _linear = tiny_model(vs.root());
    checkpoint::copy_into(SubModelKind::Autoencoder, &vs, parts.take(SubModelKind::Autoencoder))?;
    let variables = vs.variables();
    assert_eq!(variables["proj.weight"].sum(Kind::Float).double_value(&[]), 6.0);
    assert_eq!(variables["proj.bias"].sum(Kind::Float).double_value(&[]), 0.0);
    Ok(())
}

#[test]
fn missing_weights_are_reported() {
    let vs = nn::VarStore::new(Device::Cpu);
    let _linear = tiny_model(vs.root());
    let mut weights = tiny_weights();
    weights.remove("proj.bias");
    match checkpoint::copy_into(SubModelKind::Unet, &vs, weights) {
        Err(Error::MissingWeights { kind, count, examples }) => {
            assert_eq!(kind, SubModelKind::Unet);
            assert_eq!(count, 1);
            assert_eq!(examples, vec!["proj.bias".to_string()]);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn shape_mismatch_is_reported() {
    let vs = nn::VarStore::new(Device::Cpu);
    let _linear = tiny_model(vs.root());
    let mut weights = tiny_weights();
    weights.insert("proj.weight".to_string(), Tensor::ones([3, 2], CPU_F32));
    let err = checkpoint::copy_into(SubModelKind::TextEncoder, &vs, weights).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { ref name, .. } if name == "proj.weight"));
}

#[test]
fn footprint_follows_storage_kind() -> anyhow::Result<()> {
    let full = SubModel::build(
        SubModelKind::Unet,
        Device::Cpu,
        Kind::Float,
        Weights::Tensors(tiny_weights()),
        tiny_model,
    )?;
    assert_eq!(full.footprint_bytes(), 8 * 4);

    let half = SubModel::build(
        SubModelKind::Unet,
        Device::Cpu,
        Kind::Half,
        Weights::Tensors(tiny_weights()),
        tiny_model,
    )?;
    assert_eq!(half.footprint_bytes(), 8 * 2);
    assert_eq!(half.input(&Tensor::ones([1, 3], CPU_F32)).kind(), Kind::Half);
    assert_eq!(half.current_device(), Device::Cpu);
    assert!(half.autocast());

    assert!(!full.autocast());
    let ys = full.forward_with(|m| m.forward(&full.input(&Tensor::ones([1, 3], CPU_F32))));
    assert_eq!(ys.double_value(&[0, 1]), 3.0);
    Ok(())
}

#[test]
fn models_are_built_against_their_target_device() -> anyhow::Result<()> {
    // No variables are created, so this does not need an actual accelerator.
    let gpu = Device::Cuda(0);
    let model = SubModel::build(
        SubModelKind::TextEncoder,
        gpu,
        Kind::Float,
        Weights::Tensors(HashMap::new()),
        |p| p.device(),
    )?;
    assert_eq!(*model.model(), gpu);
    assert_eq!(model.target_device(), gpu);
    assert_eq!(model.current_device(), Device::Cpu);
    Ok(())
}

#[test]
fn pixels_to_tensor_and_back() -> anyhow::Result<()> {
    let mut image = image::RgbImage::new(4, 2);
    image.put_pixel(1, 0, image::Rgb([255, 0, 255]));
    let xs = image_io::rgb_to_tensor(&image);
    assert_eq!(xs.size(), [3, 2, 4]);
    assert_eq!(xs.double_value(&[0, 0, 1]), 1.0);
    assert_eq!(xs.double_value(&[1, 0, 1]), -1.0);
    assert_eq!(xs.double_value(&[0, 1, 1]), -1.0);

    let back = image_io::tensor_to_rgb(&xs.unsqueeze(0))?;
    assert_eq!(back, image);

    // Out of range values are clamped.
    let bright = Tensor::full([3, 1, 1], 3.0, CPU_F32);
    let pixel = image_io::tensor_to_rgb(&bright)?;
    assert_eq!(pixel.get_pixel(0, 0), &image::Rgb([255, 255, 255]));
    Ok(())
}

#[test]
fn init_image_is_resized() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("input.png");
    image::RgbImage::new(130, 100).save(&path)?;
    let xs = image_io::load_init_image(&path, None)?;
    assert_eq!(xs.size(), [1, 3, 64, 128]);
    let xs = image_io::load_init_image(&path, Some((200, 70)))?;
    assert_eq!(xs.size(), [1, 3, 64, 192]);
    Ok(())
}
