//! Optimizer support: weight-decay parameter groups and AdamW.

pub mod adamw;
pub use adamw::AdamW;

use crate::nn::module::{Module, ModuleKind, named_modules};
use crate::tensor::TensorElem;
use tracing::info;

/// A set of parameters, by fully qualified name, sharing optimizer overrides.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParamGroup {
    pub names: Vec<String>,
    /// `None` uses the optimizer's own weight decay.
    pub weight_decay: Option<f64>,
}

impl ParamGroup {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Splits the parameters of `module` into `(decay, no_decay)` groups.
///
/// Layer-norm parameters and biases are not decayed. The no-decay group pins
/// `weight_decay` to `0.0`; the decay group leaves it to the optimizer.
///
/// ```rust
/// use std::sync::Arc;
/// use gpt2_tp::distributed::SerialBackend;
/// use gpt2_tp::models::gpt2::{GPT2Config, GPT2Model};
/// use gpt2_tp::optim::get_params_for_weight_decay_optimization;
///
/// let model = GPT2Model::<f32>::new(&GPT2Config::tiny(), Arc::new(SerialBackend)).unwrap();
/// let (decay, no_decay) = get_params_for_weight_decay_optimization(&model);
/// assert!(decay.contains("word_embeddings.weight"));
/// assert!(no_decay.contains("transformer.final_layernorm.weight"));
/// ```
pub fn get_params_for_weight_decay_optimization<T: TensorElem>(
    module: &dyn Module<T>,
) -> (ParamGroup, ParamGroup) {
    let mut decay = ParamGroup::default();
    let mut no_decay = ParamGroup {
        names: Vec::new(),
        weight_decay: Some(0.0),
    };

    for (path, m) in named_modules(module) {
        let is_norm = m.kind() == ModuleKind::LayerNorm;
        for p in m.parameters() {
            let name = if path.is_empty() {
                p.name.to_string()
            } else {
                format!("{path}.{}", p.name)
            };
            if is_norm || p.name == "bias" {
                no_decay.names.push(name);
            } else {
                decay.names.push(name);
            }
        }
    }

    info!(
        weight_decay_params = decay.len(),
        no_weight_decay_params = no_decay.len(),
        "built optimizer parameter groups"
    );
    (decay, no_decay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::backend::SerialBackend;
    use crate::models::gpt2::{GPT2Config, GPT2Model};
    use crate::nn::module::named_parameters;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_groups_partition_all_parameters() {
        let model = GPT2Model::<f32>::new(&GPT2Config::tiny(), Arc::new(SerialBackend)).unwrap();
        let (decay, no_decay) = get_params_for_weight_decay_optimization(&model);

        let all: HashSet<String> = named_parameters(&model)
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        let grouped: HashSet<String> = decay
            .names
            .iter()
            .chain(no_decay.names.iter())
            .cloned()
            .collect();
        assert_eq!(all, grouped);
        assert_eq!(all.len(), decay.len() + no_decay.len());
    }

    #[test]
    fn test_group_membership() {
        let model = GPT2Model::<f32>::new(&GPT2Config::tiny(), Arc::new(SerialBackend)).unwrap();
        let (decay, no_decay) = get_params_for_weight_decay_optimization(&model);

        assert_eq!(decay.weight_decay, None);
        assert_eq!(no_decay.weight_decay, Some(0.0));

        assert!(decay.contains("transformer.layers.0.attention.query_key_value.weight"));
        assert!(no_decay.contains("transformer.layers.0.attention.query_key_value.bias"));
        assert!(no_decay.contains("transformer.layers.1.input_layernorm.weight"));
        assert!(no_decay.contains("transformer.layers.1.input_layernorm.bias"));
        assert!(decay.contains("position_embeddings.weight"));
        assert!(decay.names.iter().all(|n| !n.ends_with(".bias")));
    }

    #[test]
    fn test_group_sizes_for_tiny_model() {
        let model = GPT2Model::<f32>::new(&GPT2Config::tiny(), Arc::new(SerialBackend)).unwrap();
        let (decay, no_decay) = get_params_for_weight_decay_optimization(&model);
        // Per layer: 4 linear weights decayed; 4 biases and 2 norms x 2 not.
        // Plus two embeddings decayed and the final norm not.
        assert_eq!(decay.len(), 2 * 4 + 2);
        assert_eq!(no_decay.len(), 2 * 8 + 2);
    }
}
