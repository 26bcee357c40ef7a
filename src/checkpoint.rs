//! # Checkpoint loading and key remapping
//!
//! A combined checkpoint stores the weights of the UNet, the text encoder and
//! the autoencoder side by side, each under its own key prefix. The tensors
//! are split per sub-model and the prefixes are removed so that the remaining
//! names match the variables of the corresponding var store.
use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use tch::{nn, Tensor};

use crate::error::Error;
use crate::submodel::SubModelKind;

/// Reads all the named tensors of a checkpoint file. The format is picked
/// from the file extension, `.ot` archives being the default.
pub fn read_tensors<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<(String, Tensor)>> {
    let path = path.as_ref();
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let tensors = match extension {
        "safetensors" => Tensor::read_safetensors(path),
        "npz" => Tensor::read_npz(path),
        _ => Tensor::load_multi(path),
    };
    tensors.with_context(|| format!("error reading checkpoint {:?}", path.to_string_lossy()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapRule {
    pub prefix: String,
    pub kind: SubModelKind,
}

/// The result of splitting a checkpoint.
#[derive(Debug)]
pub struct Partitioned<T> {
    per_kind: HashMap<SubModelKind, HashMap<String, T>>,
    /// Keys that matched no rule.
    pub ignored: Vec<String>,
}

impl<T> Partitioned<T> {
    /// Removes and returns the tensors of a sub-model, empty if there are none.
    pub fn take(&mut self, kind: SubModelKind) -> HashMap<String, T> {
        self.per_kind.remove(&kind).unwrap_or_default()
    }

    pub fn len(&self, kind: SubModelKind) -> usize {
        self.per_kind.get(&kind).map_or(0, |m| m.len())
    }
}

/// Routes checkpoint keys to sub-models by prefix, the first matching rule
/// wins.
#[derive(Debug, Clone)]
pub struct KeyRemapper {
    rules: Vec<RemapRule>,
}

impl Default for KeyRemapper {
    fn default() -> Self {
        Self::new("unet.", "text_encoder.", "vae.")
    }
}

impl KeyRemapper {
    pub fn new(unet_prefix: &str, clip_prefix: &str, vae_prefix: &str) -> Self {
        let rule = |prefix: &str, kind| RemapRule { prefix: prefix.to_string(), kind };
        Self {
            rules: vec![
                rule(unet_prefix, SubModelKind::Unet),
                rule(clip_prefix, SubModelKind::TextEncoder),
                rule(vae_prefix, SubModelKind::Autoencoder),
            ],
        }
    }

    pub fn from_rules(rules: Vec<RemapRule>) -> Self {
        Self { rules }
    }

    /// The sub-model a key belongs to and the key with its prefix removed.
    pub fn route<'a>(&self, key: &'a str) -> Option<(SubModelKind, &'a str)> {
        self.rules
            .iter()
            .find_map(|r| key.strip_prefix(r.prefix.as_str()).map(|rest| (r.kind, rest)))
    }

    pub fn partition<T>(&self, named: Vec<(String, T)>) -> Partitioned<T> {
        let mut per_kind: HashMap<SubModelKind, HashMap<String, T>> = HashMap::new();
        let mut ignored = vec![];
        for (key, value) in named {
            match self.route(&key) {
                Some((kind, name)) => {
                    per_kind.entry(kind).or_default().insert(name.to_string(), value);
                }
                None => ignored.push(key),
            }
        }
        if !ignored.is_empty() {
            tracing::warn!("{} checkpoint keys match no sub-model and are ignored", ignored.len());
            tracing::debug!("ignored keys: {ignored:?}");
        }
        Partitioned { per_kind, ignored }
    }
}

/// Copies remapped tensors into the variables of a var store.
///
/// Every variable must be present with the right shape, tensors without a
/// matching variable are ignored.
pub fn copy_into(
    kind: SubModelKind,
    vs: &nn::VarStore,
    mut tensors: HashMap<String, Tensor>,
) -> crate::error::Result<()> {
    let mut variables = vs.variables();
    let mut missing = vec![];
    tch::no_grad(|| -> crate::error::Result<()> {
        for (name, var) in variables.iter_mut() {
            let Some(src) = tensors.remove(name) else {
                missing.push(name.clone());
                continue;
            };
            if var.size() != src.size() {
                return Err(Error::ShapeMismatch {
                    kind,
                    name: name.clone(),
                    expected: var.size(),
                    actual: src.size(),
                });
            }
            var.f_copy_(&src)?;
        }
        Ok(())
    })?;
    if !missing.is_empty() {
        missing.sort();
        let count = missing.len();
        missing.truncate(5);
        return Err(Error::MissingWeights { kind, count, examples: missing });
    }
    if !tensors.is_empty() {
        tracing::warn!("{kind}: {} checkpoint tensors have no matching variable", tensors.len());
    }
    Ok(())
}
