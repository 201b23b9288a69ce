//! Parameter persistence
//!
//! Parameters are written as a flat safetensors bundle keyed by stable names
//! (see [`MolKgnnNet::named_vars`]), so a bundle does not depend on batch size
//! or on the order parameters were created in:
//!
//! ```text
//! edge_norm.gamma
//! edge_norm.running_mean
//! layers.0.norm.gamma
//! layers.0.1hop.deg2.neighbor_weight
//! layers.0.nhop.deg1.bias
//! head.lin1.weight
//! ```
//!
//! `save_with_metadata` adds a `.meta.json` sidecar holding the config, its
//! fingerprint, the parameter count and an RFC 3339 timestamp.

use crate::config::KgnnConfig;
use crate::net::MolKgnnNet;
use crate::predictor::PropertyModel;
use crate::{KgnnError, Result};
use candle_core::{Device, Tensor, Var};
use chrono::{DateTime, Utc};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// File names used by [`save_graph_embedding`].
pub const GRAPH_EMBEDDING_FILE: &str = "graph_embedding.safetensors";
pub const SMILES_FILE: &str = "smiles_for_graph_embedding.txt";

const GRAPH_EMBEDDING_KEY: &str = "graph_embedding";

/// Sidecar written next to a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub name: String,
    pub config: KgnnConfig,
    pub config_fingerprint: String,
    pub param_count: usize,
    pub saved_at: DateTime<Utc>,
}

/// Name, shape and dtype of one stored tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: String,
}

// ============================================================================
// Named bundles
// ============================================================================

/// Write `vars` to a safetensors file under their names.
pub fn save_vars(vars: &[(String, Var)], path: impl AsRef<Path>) -> Result<()> {
    if vars.is_empty() {
        return Err(KgnnError::Serialization("no parameters to save".into()));
    }
    let tensors: HashMap<String, Tensor> = vars
        .iter()
        .map(|(name, v)| (name.clone(), v.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path.as_ref())
        .map_err(|e| KgnnError::Serialization(format!("Failed to save: {}", e)))
}

/// Overwrite `vars` with the tensors stored under their names.
///
/// A missing name is a `Serialization` error, a stored shape that differs from
/// the parameter's is a `Configuration` error. Nothing is written unless every
/// parameter checks out.
pub fn load_vars(vars: &[(String, Var)], path: impl AsRef<Path>, device: &Device) -> Result<()> {
    let data = std::fs::read(path.as_ref())?;
    let tensors = candle_core::safetensors::load_buffer(&data, device)
        .map_err(|e| KgnnError::Serialization(format!("Failed to deserialize: {}", e)))?;

    let mut updates = Vec::with_capacity(vars.len());
    for (name, var) in vars {
        let stored = tensors
            .get(name)
            .ok_or_else(|| KgnnError::Serialization(format!("Missing parameter '{}'", name)))?;
        if stored.dims() != var.as_tensor().dims() {
            return Err(KgnnError::Configuration(format!(
                "parameter '{}' has shape {:?} in checkpoint, model expects {:?}",
                name,
                stored.dims(),
                var.as_tensor().dims()
            )));
        }
        updates.push((var, stored));
    }
    for (var, stored) in updates {
        var.set(stored)
            .map_err(|e| KgnnError::Tensor(format!("Failed to set var: {}", e)))?;
    }
    Ok(())
}

/// Names, shapes and dtypes in a checkpoint, sorted by name, without a device.
pub fn inspect_checkpoint(path: impl AsRef<Path>) -> Result<Vec<TensorInfo>> {
    let data = std::fs::read(path.as_ref())?;
    let tensors = SafeTensors::deserialize(&data).map_err(|e| KgnnError::Serialization(e.to_string()))?;

    let mut infos: Vec<TensorInfo> = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| TensorInfo {
            name,
            shape: view.shape().to_vec(),
            dtype: format!("{:?}", view.dtype()),
        })
        .collect();
    infos.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(infos)
}

fn meta_path(path: &Path) -> PathBuf {
    path.with_extension("meta.json")
}

// ============================================================================
// Network checkpoints
// ============================================================================

impl MolKgnnNet {
    /// Save every parameter to one safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_vars(&self.named_vars(), path.as_ref())?;
        info!(path = %path.as_ref().display(), params = self.num_parameters(), "checkpoint saved");
        Ok(())
    }

    /// Load parameters saved by [`save`](Self::save) from a network of the same shape.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        load_vars(&self.named_vars(), path.as_ref(), self.device())?;
        info!(path = %path.as_ref().display(), "checkpoint loaded");
        Ok(())
    }

    /// Save parameters plus a `.meta.json` sidecar.
    pub fn save_with_metadata(&self, path: impl AsRef<Path>, name: &str) -> Result<CheckpointMetadata> {
        self.save(path.as_ref())?;

        let metadata = CheckpointMetadata {
            name: name.to_string(),
            config: self.config().clone(),
            config_fingerprint: self.config().fingerprint()?,
            param_count: self.num_parameters(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| KgnnError::Serialization(format!("Failed to encode metadata: {}", e)))?;
        std::fs::write(meta_path(path.as_ref()), json)?;
        Ok(metadata)
    }

    /// Read the sidecar written by [`save_with_metadata`](Self::save_with_metadata).
    pub fn load_metadata(path: impl AsRef<Path>) -> Result<CheckpointMetadata> {
        let meta_path = meta_path(path.as_ref());
        let json = std::fs::read_to_string(&meta_path).map_err(|e| {
            KgnnError::Serialization(format!(
                "Failed to read metadata file '{}': {}",
                meta_path.display(),
                e
            ))
        })?;
        serde_json::from_str(&json).map_err(|e| KgnnError::Serialization(format!("Invalid metadata JSON: {}", e)))
    }

    /// Build a network from a checkpoint's sidecar config and load its parameters.
    pub fn from_checkpoint(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let metadata = Self::load_metadata(path.as_ref())?;
        if metadata.config.fingerprint()? != metadata.config_fingerprint {
            return Err(KgnnError::Configuration(format!(
                "checkpoint '{}' config does not match its fingerprint",
                metadata.name
            )));
        }
        let net = Self::new(metadata.config, device)?;
        net.load(path)?;
        Ok(net)
    }

    /// One file per encoder layer, `{dir}/{stem}_layer{i}.safetensors`.
    pub fn save_layers(&self, dir: impl AsRef<Path>, stem: &str) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir.as_ref())?;
        let mut paths = Vec::with_capacity(self.encoder().num_layers());
        for i in 0..self.encoder().num_layers() {
            let path = dir.as_ref().join(format!("{}_layer{}.safetensors", stem, i));
            save_vars(&self.encoder().layer_named_vars(i)?, &path)?;
            paths.push(path);
        }
        info!(dir = %dir.as_ref().display(), layers = paths.len(), "layer checkpoints saved");
        Ok(paths)
    }
}

impl PropertyModel {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_vars(&self.named_vars(), path)
    }

    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        load_vars(&self.named_vars(), path, self.net().device())
    }
}

// ============================================================================
// Graph embeddings
// ============================================================================

/// Write embeddings and the matching SMILES (one per line) into `dir`.
pub fn save_graph_embedding(dir: impl AsRef<Path>, embedding: &Tensor, smiles: &[String]) -> Result<(PathBuf, PathBuf)> {
    let rows = embedding
        .dims2()
        .map_err(|e| KgnnError::Tensor(format!("embedding dims failed: {}", e)))?
        .0;
    if rows != smiles.len() {
        return Err(KgnnError::dims("SMILES per embedding row", rows, smiles.len()));
    }
    std::fs::create_dir_all(dir.as_ref())?;

    let tensor_path = dir.as_ref().join(GRAPH_EMBEDDING_FILE);
    let tensors: HashMap<String, Tensor> = [(GRAPH_EMBEDDING_KEY.to_string(), embedding.clone())].into();
    candle_core::safetensors::save(&tensors, &tensor_path)
        .map_err(|e| KgnnError::Serialization(format!("Failed to save embedding: {}", e)))?;

    let smiles_path = dir.as_ref().join(SMILES_FILE);
    let mut text = String::new();
    for s in smiles {
        text.push_str(s);
        text.push('\n');
    }
    std::fs::write(&smiles_path, text)?;

    info!(dir = %dir.as_ref().display(), molecules = rows, "graph embeddings saved");
    Ok((tensor_path, smiles_path))
}

/// Read back what [`save_graph_embedding`] wrote.
pub fn load_graph_embedding(dir: impl AsRef<Path>, device: &Device) -> Result<(Tensor, Vec<String>)> {
    let data = std::fs::read(dir.as_ref().join(GRAPH_EMBEDDING_FILE))?;
    let mut tensors = candle_core::safetensors::load_buffer(&data, device)
        .map_err(|e| KgnnError::Serialization(format!("Failed to deserialize: {}", e)))?;
    let embedding = tensors
        .remove(GRAPH_EMBEDDING_KEY)
        .ok_or_else(|| KgnnError::Serialization(format!("Missing tensor '{}'", GRAPH_EMBEDDING_KEY)))?;
    let smiles = std::fs::read_to_string(dir.as_ref().join(SMILES_FILE))?
        .lines()
        .map(str::to_string)
        .collect();
    Ok((embedding, smiles))
}
