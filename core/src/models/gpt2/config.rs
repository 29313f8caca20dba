use crate::distributed::transformer::ParallelTransformerConfig;
use crate::tensor::{Result, TensorError};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_dropout() -> f64 {
    0.1
}

fn default_checkpoint_num_layers() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_layernorm_epsilon() -> f64 {
    1e-5
}

fn default_init_method_std() -> f64 {
    0.02
}

fn default_seed() -> u64 {
    1234
}

/// Hyper-parameters of the GPT-2 language model.
///
/// Missing optional fields take their defaults when deserialising:
///
/// ```rust
/// use gpt2_tp::models::gpt2::GPT2Config;
///
/// let config = GPT2Config::from_json_str(
///     r#"{"num_layers": 2, "vocab_size": 64, "hidden_size": 16,
///         "num_attention_heads": 4, "max_sequence_length": 32}"#,
/// ).unwrap();
/// assert!(config.parallel_output);
/// assert_eq!(config.checkpoint_num_layers, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GPT2Config {
    pub num_layers: usize,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    #[serde(default = "default_dropout")]
    pub embedding_dropout_prob: f64,
    #[serde(default = "default_dropout")]
    pub attention_dropout_prob: f64,
    #[serde(default = "default_dropout")]
    pub output_dropout_prob: f64,
    pub max_sequence_length: usize,
    #[serde(default)]
    pub checkpoint_activations: bool,
    #[serde(default = "default_checkpoint_num_layers")]
    pub checkpoint_num_layers: usize,
    /// Return vocabulary-sharded logits instead of gathering them.
    #[serde(default = "default_true")]
    pub parallel_output: bool,
    #[serde(default = "default_layernorm_epsilon")]
    pub layernorm_epsilon: f64,
    #[serde(default = "default_init_method_std")]
    pub init_method_std: f64,
    /// Seed for the master weights. Must be the same on every rank.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl GPT2Config {
    /// The 117M-parameter GPT-2.
    pub fn gpt2_small() -> Self {
        Self {
            num_layers: 12,
            vocab_size: 50257,
            hidden_size: 768,
            num_attention_heads: 12,
            embedding_dropout_prob: default_dropout(),
            attention_dropout_prob: default_dropout(),
            output_dropout_prob: default_dropout(),
            max_sequence_length: 1024,
            checkpoint_activations: false,
            checkpoint_num_layers: default_checkpoint_num_layers(),
            parallel_output: true,
            layernorm_epsilon: default_layernorm_epsilon(),
            init_method_std: default_init_method_std(),
            seed: default_seed(),
        }
    }

    /// A model small enough for unit tests. Shards up to four ways.
    pub fn tiny() -> Self {
        Self {
            num_layers: 2,
            vocab_size: 37,
            hidden_size: 16,
            num_attention_heads: 4,
            max_sequence_length: 16,
            ..Self::gpt2_small()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TensorError::InvalidConfig(format!("GPT2Config: {e}")))
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| TensorError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Checks that the model can be split `world_size` ways.
    ///
    /// The vocabulary is padded to a multiple of the world size, so it need not divide.
    pub fn validate(&self, world_size: usize) -> Result<()> {
        let sizes = [
            ("num_layers", self.num_layers),
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("num_attention_heads", self.num_attention_heads),
            ("max_sequence_length", self.max_sequence_length),
            ("world_size", world_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(TensorError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(TensorError::InvalidConfig(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.num_attention_heads % world_size != 0 {
            return Err(TensorError::InvalidConfig(format!(
                "num_attention_heads {} is not divisible by world_size {world_size}",
                self.num_attention_heads
            )));
        }
        if self.hidden_size % world_size != 0 {
            return Err(TensorError::InvalidConfig(format!(
                "hidden_size {} is not divisible by world_size {world_size}",
                self.hidden_size
            )));
        }
        for (name, p) in [
            ("embedding_dropout_prob", self.embedding_dropout_prob),
            ("attention_dropout_prob", self.attention_dropout_prob),
            ("output_dropout_prob", self.output_dropout_prob),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(TensorError::InvalidConfig(format!(
                    "{name} {p} outside [0, 1)"
                )));
            }
        }
        if !self.init_method_std.is_finite() || self.init_method_std < 0.0 {
            return Err(TensorError::InvalidConfig(format!(
                "init_method_std {} must be finite and non-negative",
                self.init_method_std
            )));
        }
        if !self.layernorm_epsilon.is_finite() || self.layernorm_epsilon <= 0.0 {
            return Err(TensorError::InvalidConfig(format!(
                "layernorm_epsilon {} must be finite and positive",
                self.layernorm_epsilon
            )));
        }
        if self.checkpoint_num_layers == 0 {
            return Err(TensorError::InvalidConfig(
                "checkpoint_num_layers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn transformer_config(&self) -> ParallelTransformerConfig {
        ParallelTransformerConfig {
            num_layers: self.num_layers,
            hidden_size: self.hidden_size,
            num_attention_heads: self.num_attention_heads,
            attention_dropout_prob: self.attention_dropout_prob,
            output_dropout_prob: self.output_dropout_prob,
            layernorm_epsilon: self.layernorm_epsilon,
            init_method_std: self.init_method_std,
            checkpoint_activations: self.checkpoint_activations,
            checkpoint_num_layers: self.checkpoint_num_layers,
        }
    }
}

/// [`GPT2Config`] plus the size of the classification head.
///
/// The head is replicated on every rank, so `model.parallel_output` has no effect on a
/// [`GPT2Classifier`](super::GPT2Classifier): its logits are always full width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GPT2ClassifierConfig {
    #[serde(flatten)]
    pub model: GPT2Config,
    pub num_labels: usize,
}

impl GPT2ClassifierConfig {
    pub fn new(model: GPT2Config, num_labels: usize) -> Self {
        Self { model, num_labels }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TensorError::InvalidConfig(format!("GPT2ClassifierConfig: {e}")))
    }

    pub fn validate(&self, world_size: usize) -> Result<()> {
        if self.num_labels == 0 {
            return Err(TensorError::InvalidConfig(
                "num_labels must be non-zero".to_string(),
            ));
        }
        self.model.validate(world_size)
    }
}
