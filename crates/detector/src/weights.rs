//! Importing externally trained weights into the detector's `VarMap`
//!
//! Checkpoints of image-only detectors name their modules differently from
//! the fused detector. A [`KeyRemapTable`] rewrites (or drops) checkpoint
//! keys by prefix before the tensors are copied into matching variables.

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tracing::{info, warn};
use voxel_det3d_common::{DetectionError, Result};

/// One prefix rewrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapRule {
    /// Key prefix the rule applies to
    pub from: String,
    /// Replacement prefix; `None` drops matching keys
    pub to: Option<String>,
    /// When non-empty, matching keys containing none of these are dropped
    #[serde(default)]
    pub keep_if_contains: Vec<String>,
    /// Leave the key untouched when the rewritten key already exists
    #[serde(default)]
    pub only_if_absent: bool,
}

impl RemapRule {
    pub fn rename(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: Some(to.to_string()),
            keep_if_contains: Vec::new(),
            only_if_absent: false,
        }
    }

    pub fn drop(from: &str) -> Self {
        Self {
            from: from.to_string(),
            to: None,
            keep_if_contains: Vec::new(),
            only_if_absent: false,
        }
    }
}

/// What happens to a single checkpoint key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    Keep,
    Rename(String),
    Drop,
}

/// Ordered prefix rules; the first matching rule decides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRemapTable {
    pub rules: Vec<RemapRule>,
}

impl KeyRemapTable {
    pub const PRESETS: [&'static str; 2] = ["image_detector_transfer", "image_encoder_transfer"];

    /// Keys used as-is
    pub fn identity() -> Self {
        Self::default()
    }

    /// 2D detector checkpoint into the image branch: `backbone*` and
    /// `neck*` gain an `img_` prefix unless that key is already present.
    pub fn image_detector_transfer() -> Self {
        let guarded = |from: &str| RemapRule {
            only_if_absent: true,
            ..RemapRule::rename(from, &format!("img_{from}"))
        };
        Self {
            rules: vec![guarded("backbone"), guarded("neck")],
        }
    }

    /// Transformer image detector checkpoint: encoder weights and level
    /// embeddings move under `img_encoder`, the rest of the image head is
    /// discarded.
    pub fn image_encoder_transfer() -> Self {
        Self {
            rules: vec![
                RemapRule {
                    keep_if_contains: vec!["encoder".to_string(), "level_embeds".to_string()],
                    ..RemapRule::rename("img_bbox_head.transformer", "img_encoder")
                },
                RemapRule::drop("img_bbox_head"),
            ],
        }
    }

    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "identity" => Ok(Self::identity()),
            "image_detector_transfer" => Ok(Self::image_detector_transfer()),
            "image_encoder_transfer" => Ok(Self::image_encoder_transfer()),
            other => Err(DetectionError::InvalidConfig(format!(
                "unknown remap preset '{other}', expected one of {:?}",
                Self::PRESETS
            ))),
        }
    }

    /// Action for `key` given every key of the checkpoint
    pub fn action(&self, key: &str, all_keys: &BTreeSet<&str>) -> KeyAction {
        let Some(rule) = self.rules.iter().find(|r| key.starts_with(r.from.as_str())) else {
            return KeyAction::Keep;
        };
        let wanted = rule.keep_if_contains.is_empty()
            || rule.keep_if_contains.iter().any(|s| key.contains(s.as_str()));
        match &rule.to {
            Some(to) if wanted => {
                let renamed = format!("{to}{}", &key[rule.from.len()..]);
                if rule.only_if_absent && all_keys.contains(renamed.as_str()) {
                    KeyAction::Keep
                } else {
                    KeyAction::Rename(renamed)
                }
            }
            _ => KeyAction::Drop,
        }
    }

    /// Actions for every key, in key order
    pub fn plan<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Vec<(String, KeyAction)> {
        let all: BTreeSet<&str> = keys.into_iter().collect();
        all.iter()
            .map(|&k| (k.to_string(), self.action(k, &all)))
            .collect()
    }

    /// Rewrite a checkpoint; returns the remapped tensors and dropped keys
    pub fn apply(&self, tensors: HashMap<String, Tensor>) -> (HashMap<String, Tensor>, Vec<String>) {
        let plan = self.plan(tensors.keys().map(String::as_str));
        let mut tensors = tensors;
        let mut out = HashMap::with_capacity(tensors.len());
        let mut dropped = Vec::new();
        for (key, action) in plan {
            let Some(tensor) = tensors.remove(&key) else {
                continue;
            };
            match action {
                KeyAction::Keep => {
                    out.insert(key, tensor);
                }
                KeyAction::Rename(new_key) => {
                    out.insert(new_key, tensor);
                }
                KeyAction::Drop => dropped.push(key),
            }
        }
        (out, dropped)
    }
}

/// Outcome of an import, every list sorted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Detector variables overwritten from the checkpoint
    pub loaded: Vec<String>,
    /// Detector variables the checkpoint does not provide
    pub missing: Vec<String>,
    /// Checkpoint keys with no detector variable
    pub unexpected: Vec<String>,
    /// Checkpoint keys discarded by the remap table
    pub dropped: Vec<String>,
}

/// Load a safetensors checkpoint, remap its keys and copy every matching
/// tensor into `varmap`. A shape mismatch on a matching key aborts the
/// import before any variable is written.
pub fn import_external_weights<P: AsRef<Path>>(
    varmap: &VarMap,
    path: P,
    table: &KeyRemapTable,
) -> Result<ImportReport> {
    let path = path.as_ref();
    info!("Importing weights from {:?}", path);
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
    let (tensors, mut dropped) = table.apply(tensors);
    for key in &dropped {
        warn!("Dropping checkpoint key {}", key);
    }

    let data = varmap
        .data()
        .lock()
        .map_err(|_| DetectionError::WeightImport("parameter registry lock poisoned".to_string()))?;

    let mut report = ImportReport::default();
    let mut updates = Vec::new();
    for (name, var) in data.iter() {
        match tensors.get(name) {
            Some(tensor) => {
                if tensor.dims() != var.dims() {
                    return Err(DetectionError::WeightImport(format!(
                        "{name}: checkpoint shape {:?}, detector shape {:?}",
                        tensor.dims(),
                        var.dims()
                    )));
                }
                updates.push((name, var, tensor));
            }
            None => report.missing.push(name.clone()),
        }
    }
    for (name, var, tensor) in updates {
        var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
        report.loaded.push(name.clone());
    }
    report.unexpected = tensors
        .keys()
        .filter(|k| !data.contains_key(k.as_str()))
        .cloned()
        .collect();

    report.loaded.sort();
    report.missing.sort();
    report.unexpected.sort();
    dropped.sort();
    report.dropped = dropped;
    info!(
        "Imported {} tensors ({} missing, {} unexpected, {} dropped)",
        report.loaded.len(),
        report.missing.len(),
        report.unexpected.len(),
        report.dropped.len()
    );
    Ok(report)
}
