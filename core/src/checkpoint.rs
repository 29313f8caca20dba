//! Model-parallel checkpoints in the `safetensors` format.
//!
//! Every rank writes its own shard to `mp_rank_XX.safetensors` inside a shared directory. The
//! header metadata records the rank and world size so a shard is never loaded into a model split
//! a different number of ways. Tensors are stored as little-endian `f32` under their fully
//! qualified parameter names.

use crate::distributed::backend::CollectiveBackend;
use crate::nn::module::{Module, named_parameters, visit_parameters_mut};
use crate::tensor::{Result, TensorElem, TensorError};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CHECKPOINT_FORMAT: &str = "gpt2-tp";

/// File name of `rank`'s shard.
pub fn checkpoint_file_name(rank: usize) -> String {
    format!("mp_rank_{rank:02}.safetensors")
}

fn checkpoint_err(what: impl std::fmt::Display) -> TensorError {
    TensorError::Checkpoint(what.to_string())
}

/// Writes this rank's parameters to `dir` and returns the file path.
///
/// # Errors
///
/// `Checkpoint` on I/O or serialisation failure, `Unsupported` if a value has no `f32`
/// representation.
pub fn save_model_parallel_checkpoint<T: TensorElem, P: AsRef<Path>>(
    model: &dyn Module<T>,
    backend: &dyn CollectiveBackend,
    dir: P,
) -> Result<PathBuf> {
    let path = dir.as_ref().join(checkpoint_file_name(backend.rank()));

    let mut encoded = Vec::new();
    for (name, p) in named_parameters(model) {
        let mut bytes = Vec::with_capacity(p.data.len() * 4);
        for v in p.data {
            let v = v.to_f32().ok_or_else(|| {
                TensorError::Unsupported(format!("{name}: value {v:?} has no f32 form"))
            })?;
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        encoded.push((name, p.shape, bytes));
    }

    let views = encoded
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.clone(), view))
                .map_err(|e| checkpoint_err(format!("{name}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let metadata = HashMap::from([
        ("rank".to_string(), backend.rank().to_string()),
        ("world_size".to_string(), backend.world_size().to_string()),
        ("format".to_string(), CHECKPOINT_FORMAT.to_string()),
    ]);
    safetensors::serialize_to_file(views, Some(metadata), &path)
        .map_err(|e| checkpoint_err(format!("{}: {e}", path.display())))?;

    info!(
        rank = backend.rank(),
        tensors = encoded.len(),
        path = %path.display(),
        "saved model-parallel checkpoint"
    );
    Ok(path)
}

/// Reads this rank's shard from `dir` into `model`, matching tensors by name.
///
/// # Errors
///
/// `Checkpoint` if the file is missing or unreadable, was written by a different world size, or
/// lacks one of the model's parameters. `ShapeMismatch` if a stored shape differs.
pub fn load_model_parallel_checkpoint<T: TensorElem, P: AsRef<Path>>(
    model: &mut dyn Module<T>,
    backend: &dyn CollectiveBackend,
    dir: P,
) -> Result<()> {
    let path = dir.as_ref().join(checkpoint_file_name(backend.rank()));
    let buffer =
        std::fs::read(&path).map_err(|e| checkpoint_err(format!("{}: {e}", path.display())))?;

    let (_, header) = SafeTensors::read_metadata(&buffer)
        .map_err(|e| checkpoint_err(format!("{}: {e}", path.display())))?;
    let stored_world = header
        .metadata()
        .as_ref()
        .and_then(|m| m.get("world_size"))
        .and_then(|w| w.parse::<usize>().ok())
        .ok_or_else(|| checkpoint_err(format!("{}: no world_size metadata", path.display())))?;
    if stored_world != backend.world_size() {
        return Err(checkpoint_err(format!(
            "{} was written with world size {stored_world}, model has {}",
            path.display(),
            backend.world_size()
        )));
    }

    let tensors = SafeTensors::deserialize(&buffer)
        .map_err(|e| checkpoint_err(format!("{}: {e}", path.display())))?;

    // Decode everything before touching the model so a bad shard leaves it unchanged.
    let decoded = named_parameters(&*model)
        .into_iter()
        .map(|(name, p)| decode(&tensors, &name, &p.shape).map(|values| (name, values)))
        .collect::<Result<HashMap<String, Vec<T>>>>()?;

    let mut loaded = 0usize;
    visit_parameters_mut(model, &mut |name, param| {
        if let Some(values) = decoded.get(name) {
            param.data.copy_from_slice(values);
            loaded += 1;
        }
    });

    info!(
        rank = backend.rank(),
        tensors = loaded,
        path = %path.display(),
        "loaded model-parallel checkpoint"
    );
    Ok(())
}

fn decode<T: TensorElem>(
    tensors: &SafeTensors<'_>,
    name: &str,
    shape: &[usize],
) -> Result<Vec<T>> {
    let view = tensors
        .tensor(name)
        .map_err(|_| checkpoint_err(format!("missing tensor {name}")))?;
    if view.dtype() != Dtype::F32 {
        return Err(checkpoint_err(format!(
            "{name}: expected F32, found {:?}",
            view.dtype()
        )));
    }
    if view.shape() != shape {
        return Err(TensorError::ShapeMismatch {
            expected: shape.to_vec(),
            got: view.shape().to_vec(),
        });
    }
    view.data()
        .chunks_exact(4)
        .map(|chunk| {
            let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            T::from_f32(v)
                .ok_or_else(|| TensorError::Unsupported(format!("{name}: {v} not representable")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::backend::SerialBackend;
    use crate::nn::linear::Linear;
    use crate::nn::norm::LayerNorm;
    use crate::tensor::Tensor;

    fn linear(fill: f32) -> Linear<f32> {
        Linear::new(
            Tensor::from_fn([2, 3], |i| fill + i as f32),
            Some(Tensor::full([2], fill)),
        )
        .unwrap()
    }

    #[test]
    fn test_file_name() {
        assert_eq!(checkpoint_file_name(0), "mp_rank_00.safetensors");
        assert_eq!(checkpoint_file_name(12), "mp_rank_12.safetensors");
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let saved = linear(1.5);
        let path = save_model_parallel_checkpoint(&saved, &SerialBackend, dir.path()).unwrap();
        assert!(path.ends_with("mp_rank_00.safetensors"));

        let mut restored = linear(0.0);
        load_model_parallel_checkpoint(&mut restored, &SerialBackend, dir.path()).unwrap();
        assert_eq!(restored.weight.data(), saved.weight.data());
        assert_eq!(
            restored.bias.unwrap().data(),
            saved.bias.as_ref().unwrap().data()
        );
    }

    #[test]
    fn test_metadata_written() {
        let dir = tempfile::tempdir().unwrap();
        let path =
            save_model_parallel_checkpoint(&linear(1.0), &SerialBackend, dir.path()).unwrap();
        let buffer = std::fs::read(path).unwrap();
        let (_, header) = SafeTensors::read_metadata(&buffer).unwrap();
        let meta = header.metadata().as_ref().unwrap();
        assert_eq!(meta["rank"], "0");
        assert_eq!(meta["world_size"], "1");
        assert_eq!(meta["format"], CHECKPOINT_FORMAT);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = linear(0.0);
        assert!(matches!(
            load_model_parallel_checkpoint(&mut model, &SerialBackend, dir.path()),
            Err(TensorError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        save_model_parallel_checkpoint(&linear(1.0), &SerialBackend, dir.path()).unwrap();
        let mut other =
            Linear::<f32>::new(Tensor::zeros([3, 3]), Some(Tensor::zeros([3]))).unwrap();
        assert!(matches!(
            load_model_parallel_checkpoint(&mut other, &SerialBackend, dir.path()),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let no_bias = Linear::<f32>::new(Tensor::zeros([2, 3]), None).unwrap();
        save_model_parallel_checkpoint(&no_bias, &SerialBackend, dir.path()).unwrap();

        let mut with_bias = linear(0.0);
        let err = load_model_parallel_checkpoint(&mut with_bias, &SerialBackend, dir.path());
        assert!(matches!(err, Err(TensorError::Checkpoint(msg)) if msg.contains("bias")));

        let mut norm = LayerNorm::<f32>::with_features(3, 1e-5);
        assert!(load_model_parallel_checkpoint(&mut norm, &SerialBackend, dir.path()).is_err());
    }

    #[test]
    fn test_failed_load_leaves_model_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let no_bias = Linear::<f32>::new(Tensor::full([2, 3], 7.0), None).unwrap();
        save_model_parallel_checkpoint(&no_bias, &SerialBackend, dir.path()).unwrap();

        // "weight" matches, "bias" is absent from the shard.
        let mut target = linear(0.0);
        let before = target.clone();
        assert!(load_model_parallel_checkpoint(&mut target, &SerialBackend, dir.path()).is_err());
        assert_eq!(target.weight.data(), before.weight.data());
        assert_eq!(
            target.bias.as_ref().unwrap().data(),
            before.bias.as_ref().unwrap().data()
        );
    }
}
