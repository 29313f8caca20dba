//! Model-parallel transformer stack.
//!
//! Each block is pre-LayerNorm:
//!
//! ```text
//! h = x + Attention(LN1(x))
//! y = h + MLP(LN2(h))
//! ```
//!
//! Attention heads and the MLP's inner dimension are split across ranks. Each sub-block is a
//! column-parallel projection followed by a row-parallel one, so the only communication per
//! sub-block is the all-reduce inside the row-parallel layer.

use super::backend::CollectiveBackend;
use super::layers::{ColumnParallelLinear, RowParallelLinear};
use super::random::{RngStream, RngTracker};
use super::utils::divide;
use crate::nn::activation::Activation;
use crate::nn::dropout::Dropout;
use crate::nn::init::{Init, normal, scaled_normal};
use crate::nn::module::Module;
use crate::nn::norm::LayerNorm;
use crate::tensor::{Result, Tensor, TensorElem, TensorError};
use num_traits::Float;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

/// Added to masked attention scores (after zeroing them) before the softmax.
const MASKED_SCORE: f64 = -10000.0;

/// Hyper-parameters of the transformer stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelTransformerConfig {
    pub num_layers: usize,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub attention_dropout_prob: f64,
    pub output_dropout_prob: f64,
    pub layernorm_epsilon: f64,
    pub init_method_std: f64,
    pub checkpoint_activations: bool,
    pub checkpoint_num_layers: usize,
}

impl ParallelTransformerConfig {
    /// Init for the input projections.
    pub fn init_method(&self) -> Init {
        normal(self.init_method_std)
    }

    /// Init for the projections that feed the residual stream.
    pub fn output_init_method(&self) -> Init {
        scaled_normal(self.init_method_std, self.num_layers)
    }
}

fn epsilon<T: TensorElem + Float>(eps: f64) -> Result<T> {
    T::from_f64(eps)
        .ok_or_else(|| TensorError::InvalidConfig(format!("epsilon {eps} not representable")))
}

/// Self-attention with heads split across ranks.
#[derive(Debug)]
pub struct ParallelSelfAttention<T: TensorElem> {
    hidden_size_per_partition: usize,
    heads_per_partition: usize,
    head_dim: usize,
    /// Fused `[3h, h]` projection. Each rank keeps the query, key and value rows of its heads.
    pub query_key_value: ColumnParallelLinear<T>,
    pub dense: RowParallelLinear<T>,
    attention_dropout: Dropout,
    output_dropout: Dropout,
}

impl<T: TensorElem + Float> ParallelSelfAttention<T> {
    pub fn new(
        config: &ParallelTransformerConfig,
        rng: &mut StdRng,
        backend: Arc<dyn CollectiveBackend>,
    ) -> Result<Self> {
        let h = config.hidden_size;
        let world = backend.world_size();
        let head_dim = divide(h, config.num_attention_heads)?;
        let heads_per_partition = divide(config.num_attention_heads, world)?;

        let qkv_master: Tensor<T, 2> = config.init_method().sample([3 * h, h], rng)?;
        let query_key_value =
            ColumnParallelLinear::from_master(&qkv_master, true, false, 3, backend.clone())?;
        let dense = RowParallelLinear::new(
            h,
            h,
            true,
            true,
            config.output_init_method(),
            rng,
            backend,
        )?;

        Ok(Self {
            hidden_size_per_partition: heads_per_partition * head_dim,
            heads_per_partition,
            head_dim,
            query_key_value,
            dense,
            attention_dropout: Dropout::new(config.attention_dropout_prob)?,
            output_dropout: Dropout::new(config.output_dropout_prob)?,
        })
    }

    /// `[b, s, h] -> [b, np, s, hn]` for this rank's heads.
    fn split_heads(&self, x: Tensor<T, 3>) -> Result<Tensor<T, 4>> {
        let [b, s, _] = *x.shape();
        x.reshape([b, s, self.heads_per_partition, self.head_dim])?
            .transpose_axes(1, 2)
    }

    /// `hidden [b, s, h]`, `ltor_mask [1 or b, s, s]` with 1 = visible.
    pub fn forward(
        &self,
        hidden: &Tensor<T, 3>,
        ltor_mask: &Tensor<T, 3>,
        mut rng: Option<&mut RngTracker>,
    ) -> Result<Tensor<T, 3>> {
        let [b, s, _] = *hidden.shape();

        let mixed = self.query_key_value.forward(hidden)?;
        let mut qkv = mixed.split_last(3)?.into_iter();
        let (Some(q), Some(k), Some(v)) = (qkv.next(), qkv.next(), qkv.next()) else {
            return Err(TensorError::Unsupported("fused qkv split".to_string()));
        };
        let q = self.split_heads(q)?;
        let k = self.split_heads(k)?;
        let v = self.split_heads(v)?;

        let scale = T::from_f64(1.0 / (self.head_dim as f64).sqrt())
            .ok_or_else(|| TensorError::Unsupported("attention scale".to_string()))?;
        let mut scores = q.matmul(&k.transpose()?)?.map(|x| x * scale);
        apply_ltor_mask(&mut scores, ltor_mask)?;

        let probs = scores.softmax_last()?;
        let probs = self.attention_dropout.forward(
            probs,
            rng.as_deref_mut().map(|t| t.get(RngStream::ModelParallel)),
        )?;

        let context = probs
            .matmul(&v)?
            .transpose_axes(1, 2)?
            .reshape([b, s, self.hidden_size_per_partition])?;

        let out = self.dense.forward(&context)?;
        self.output_dropout
            .forward(out, rng.map(|t| t.get(RngStream::Default)))
    }
}

/// `scores * mask - 10000 * (1 - mask)`, broadcasting the mask over heads (and batch when its
/// leading dimension is 1).
fn apply_ltor_mask<T: TensorElem + Float>(
    scores: &mut Tensor<T, 4>,
    mask: &Tensor<T, 3>,
) -> Result<()> {
    let [b, np, s, sk] = *scores.shape();
    let [mb, ms, mk] = *mask.shape();
    if (mb != 1 && mb != b) || ms != s || mk != sk {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, s, sk],
            got: mask.shape().to_vec(),
        });
    }
    if scores.size() == 0 {
        return Ok(());
    }

    let masked = T::from_f64(MASKED_SCORE)
        .ok_or_else(|| TensorError::Unsupported("masked score".to_string()))?;
    let plane = s * sk;
    let mask_data = mask.data();
    scores
        .data_mut()
        .par_chunks_mut(np * plane)
        .enumerate()
        .for_each(|(bi, batch)| {
            let mi = if mb == 1 { 0 } else { bi };
            let m = &mask_data[mi * plane..(mi + 1) * plane];
            for head in batch.chunks_mut(plane) {
                for (x, &keep) in head.iter_mut().zip(m) {
                    *x = *x * keep + masked * (T::one() - keep);
                }
            }
        });
    Ok(())
}

impl<T: TensorElem> Module<T> for ParallelSelfAttention<T> {
    fn children(&self) -> Vec<(String, &dyn Module<T>)> {
        vec![
            ("query_key_value".to_string(), &self.query_key_value as &dyn Module<T>),
            ("dense".to_string(), &self.dense as &dyn Module<T>),
        ]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module<T>)> {
        vec![
            ("query_key_value".to_string(), &mut self.query_key_value as &mut dyn Module<T>),
            ("dense".to_string(), &mut self.dense as &mut dyn Module<T>),
        ]
    }
}

/// `h -> 4h -> GELU -> h` with the inner dimension split across ranks.
#[derive(Debug)]
pub struct ParallelMLP<T: TensorElem> {
    pub dense_h_to_4h: ColumnParallelLinear<T>,
    pub dense_4h_to_h: RowParallelLinear<T>,
    dropout: Dropout,
}

impl<T: TensorElem + Float> ParallelMLP<T> {
    pub fn new(
        config: &ParallelTransformerConfig,
        rng: &mut StdRng,
        backend: Arc<dyn CollectiveBackend>,
    ) -> Result<Self> {
        let h = config.hidden_size;
        let dense_h_to_4h = ColumnParallelLinear::new(
            h,
            4 * h,
            true,
            false,
            config.init_method(),
            rng,
            backend.clone(),
        )?;
        let dense_4h_to_h = RowParallelLinear::new(
            4 * h,
            h,
            true,
            true,
            config.output_init_method(),
            rng,
            backend,
        )?;
        Ok(Self {
            dense_h_to_4h,
            dense_4h_to_h,
            dropout: Dropout::new(config.output_dropout_prob)?,
        })
    }

    pub fn forward(
        &self,
        hidden: &Tensor<T, 3>,
        rng: Option<&mut RngTracker>,
    ) -> Result<Tensor<T, 3>> {
        let intermediate = Activation::gelu(&self.dense_h_to_4h.forward(hidden)?);
        let out = self.dense_4h_to_h.forward(&intermediate)?;
        self.dropout
            .forward(out, rng.map(|t| t.get(RngStream::Default)))
    }
}

impl<T: TensorElem> Module<T> for ParallelMLP<T> {
    fn children(&self) -> Vec<(String, &dyn Module<T>)> {
        vec![
            ("dense_h_to_4h".to_string(), &self.dense_h_to_4h as &dyn Module<T>),
            ("dense_4h_to_h".to_string(), &self.dense_4h_to_h as &dyn Module<T>),
        ]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module<T>)> {
        vec![
            ("dense_h_to_4h".to_string(), &mut self.dense_h_to_4h as &mut dyn Module<T>),
            ("dense_4h_to_h".to_string(), &mut self.dense_4h_to_h as &mut dyn Module<T>),
        ]
    }
}

/// One pre-LayerNorm transformer block.
#[derive(Debug)]
pub struct ParallelTransformerLayer<T: TensorElem> {
    pub input_layernorm: LayerNorm<T>,
    pub attention: ParallelSelfAttention<T>,
    pub post_attention_layernorm: LayerNorm<T>,
    pub mlp: ParallelMLP<T>,
}

impl<T: TensorElem + Float> ParallelTransformerLayer<T> {
    pub fn new(
        config: &ParallelTransformerConfig,
        rng: &mut StdRng,
        backend: Arc<dyn CollectiveBackend>,
    ) -> Result<Self> {
        let eps = epsilon(config.layernorm_epsilon)?;
        Ok(Self {
            input_layernorm: LayerNorm::with_features(config.hidden_size, eps),
            attention: ParallelSelfAttention::new(config, rng, backend.clone())?,
            post_attention_layernorm: LayerNorm::with_features(config.hidden_size, eps),
            mlp: ParallelMLP::new(config, rng, backend)?,
        })
    }

    pub fn forward(
        &self,
        hidden: &Tensor<T, 3>,
        ltor_mask: &Tensor<T, 3>,
        mut rng: Option<&mut RngTracker>,
    ) -> Result<Tensor<T, 3>> {
        let attention_input = self.input_layernorm.forward(hidden)?;
        let attention_output =
            self.attention
                .forward(&attention_input, ltor_mask, rng.as_deref_mut())?;
        let layernorm_input = (hidden + &attention_output)?;

        let mlp_input = self.post_attention_layernorm.forward(&layernorm_input)?;
        let mlp_output = self.mlp.forward(&mlp_input, rng)?;
        &layernorm_input + &mlp_output
    }
}

impl<T: TensorElem> Module<T> for ParallelTransformerLayer<T> {
    fn children(&self) -> Vec<(String, &dyn Module<T>)> {
        vec![
            ("input_layernorm".to_string(), &self.input_layernorm as &dyn Module<T>),
            ("attention".to_string(), &self.attention as &dyn Module<T>),
            (
                "post_attention_layernorm".to_string(),
                &self.post_attention_layernorm as &dyn Module<T>,
            ),
            ("mlp".to_string(), &self.mlp as &dyn Module<T>),
        ]
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module<T>)> {
        vec![
            ("input_layernorm".to_string(), &mut self.input_layernorm as &mut dyn Module<T>),
            ("attention".to_string(), &mut self.attention as &mut dyn Module<T>),
            (
                "post_attention_layernorm".to_string(),
                &mut self.post_attention_layernorm as &mut dyn Module<T>,
            ),
            ("mlp".to_string(), &mut self.mlp as &mut dyn Module<T>),
        ]
    }
}

/// `num_layers` blocks followed by a final LayerNorm.
#[derive(Debug)]
pub struct ParallelTransformer<T: TensorElem> {
    pub layers: Vec<ParallelTransformerLayer<T>>,
    pub final_layernorm: LayerNorm<T>,
    checkpoint_activations: bool,
    checkpoint_num_layers: usize,
}

impl<T: TensorElem + Float> ParallelTransformer<T> {
    pub fn new(
        config: &ParallelTransformerConfig,
        rng: &mut StdRng,
        backend: Arc<dyn CollectiveBackend>,
    ) -> Result<Self> {
        if config.checkpoint_num_layers == 0 {
            return Err(TensorError::InvalidConfig(
                "checkpoint_num_layers must be at least 1".to_string(),
            ));
        }
        let layers = (0..config.num_layers)
            .map(|_| ParallelTransformerLayer::new(config, rng, backend.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            final_layernorm: LayerNorm::with_features(
                config.hidden_size,
                epsilon(config.layernorm_epsilon)?,
            ),
            checkpoint_activations: config.checkpoint_activations,
            checkpoint_num_layers: config.checkpoint_num_layers,
        })
    }

    /// Layer index ranges run as one unit. A single segment unless activation checkpointing is on.
    pub fn segments(&self) -> Vec<std::ops::Range<usize>> {
        let n = self.layers.len();
        let chunk = if self.checkpoint_activations {
            self.checkpoint_num_layers
        } else {
            n.max(1)
        };
        (0..n)
            .step_by(chunk)
            .map(|start| start..(start + chunk).min(n))
            .collect()
    }

    pub fn forward(
        &self,
        hidden: &Tensor<T, 3>,
        ltor_mask: &Tensor<T, 3>,
        mut rng: Option<&mut RngTracker>,
    ) -> Result<Tensor<T, 3>> {
        let mut hidden = hidden.clone();
        for segment in self.segments() {
            if self.checkpoint_activations {
                debug!(start = segment.start, end = segment.end, "transformer segment");
            }
            for layer in &self.layers[segment] {
                hidden = layer.forward(&hidden, ltor_mask, rng.as_deref_mut())?;
            }
        }
        self.final_layernorm.forward(&hidden)
    }
}

impl<T: TensorElem> Module<T> for ParallelTransformer<T> {
    fn children(&self) -> Vec<(String, &dyn Module<T>)> {
        let mut children: Vec<(String, &dyn Module<T>)> = self
            .layers
            .iter()
            .enumerate()
            .map(|(i, l)| (format!("layers.{i}"), l as &dyn Module<T>))
            .collect();
        children.push(("final_layernorm".to_string(), &self.final_layernorm as &dyn Module<T>));
        children
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module<T>)> {
        let mut children: Vec<(String, &mut dyn Module<T>)> = self
            .layers
            .iter_mut()
            .enumerate()
            .map(|(i, l)| (format!("layers.{i}"), l as &mut dyn Module<T>))
            .collect();
        children.push((
            "final_layernorm".to_string(),
            &mut self.final_layernorm as &mut dyn Module<T>,
        ));
        children
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::backend::SerialBackend;
    use crate::nn::module::named_parameters;
    use rand::SeedableRng;

    fn config(num_layers: usize) -> ParallelTransformerConfig {
        ParallelTransformerConfig {
            num_layers,
            hidden_size: 8,
            num_attention_heads: 2,
            attention_dropout_prob: 0.1,
            output_dropout_prob: 0.1,
            layernorm_epsilon: 1e-5,
            init_method_std: 0.02,
            checkpoint_activations: false,
            checkpoint_num_layers: 1,
        }
    }

    fn causal_mask(s: usize) -> Tensor<f32, 3> {
        Tensor::from_fn([1, s, s], |i| if i % s <= i / s { 1.0 } else { 0.0 })
    }

    #[test]
    fn test_apply_ltor_mask() {
        let mut scores = Tensor::<f32, 4>::ones([1, 2, 2, 2]);
        apply_ltor_mask(&mut scores, &causal_mask(2)).unwrap();
        assert_eq!(
            scores.data(),
            &[1.0, -10000.0, 1.0, 1.0, 1.0, -10000.0, 1.0, 1.0]
        );
    }

    #[test]
    fn test_apply_ltor_mask_shape_mismatch() {
        let mut scores = Tensor::<f32, 4>::ones([2, 1, 3, 3]);
        let mask = Tensor::<f32, 3>::ones([3, 3, 3]);
        assert!(apply_ltor_mask(&mut scores, &mask).is_err());
    }

    #[test]
    fn test_attention_is_causal() {
        let cfg = config(1);
        let mut rng = StdRng::seed_from_u64(0);
        let attn =
            ParallelSelfAttention::<f32>::new(&cfg, &mut rng, Arc::new(SerialBackend)).unwrap();

        let x = Tensor::<f32, 3>::from_fn([1, 3, 8], |i| (i as f32 * 0.7).cos());
        let mut y = x.clone();
        // Changing the last token must not affect earlier positions.
        for v in &mut y.data_mut()[16..] {
            *v += 1.0;
        }
        let mask = causal_mask(3);
        let ox = attn.forward(&x, &mask, None).unwrap();
        let oy = attn.forward(&y, &mask, None).unwrap();
        for i in 0..16 {
            assert!((ox.data()[i] - oy.data()[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_layer_parameter_names() {
        let cfg = config(2);
        let mut rng = StdRng::seed_from_u64(0);
        let t = ParallelTransformer::<f32>::new(&cfg, &mut rng, Arc::new(SerialBackend)).unwrap();
        let names: Vec<_> = named_parameters(&t).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names.len(), 2 * 12 + 2);
        assert_eq!(names[0], "layers.0.input_layernorm.weight");
        assert!(names.contains(&"layers.1.attention.query_key_value.weight".to_string()));
        assert!(names.contains(&"layers.1.mlp.dense_4h_to_h.bias".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("final_layernorm.bias"));
    }

    #[test]
    fn test_segments() {
        let mut cfg = config(5);
        let mut rng = StdRng::seed_from_u64(0);
        let t = ParallelTransformer::<f32>::new(&cfg, &mut rng, Arc::new(SerialBackend)).unwrap();
        assert_eq!(t.segments(), vec![0..5]);

        cfg.checkpoint_activations = true;
        cfg.checkpoint_num_layers = 2;
        let t = ParallelTransformer::<f32>::new(&cfg, &mut rng, Arc::new(SerialBackend)).unwrap();
        assert_eq!(t.segments(), vec![0..2, 2..4, 4..5]);
    }

    #[test]
    fn test_checkpointing_does_not_change_output() {
        let mut cfg = config(3);
        let x = Tensor::<f32, 3>::from_fn([2, 4, 8], |i| (i as f32 * 0.11).sin());
        let mask = causal_mask(4);

        let plain = ParallelTransformer::<f32>::new(
            &cfg,
            &mut StdRng::seed_from_u64(5),
            Arc::new(SerialBackend),
        )
        .unwrap();
        cfg.checkpoint_activations = true;
        let chunked = ParallelTransformer::<f32>::new(
            &cfg,
            &mut StdRng::seed_from_u64(5),
            Arc::new(SerialBackend),
        )
        .unwrap();

        let a = plain.forward(&x, &mask, None).unwrap();
        let b = chunked.forward(&x, &mask, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_checkpoint_layers_rejected() {
        let mut cfg = config(1);
        cfg.checkpoint_num_layers = 0;
        let r = ParallelTransformer::<f32>::new(
            &cfg,
            &mut StdRng::seed_from_u64(0),
            Arc::new(SerialBackend),
        );
        assert!(matches!(r, Err(TensorError::InvalidConfig(_))));
    }

    #[test]
    fn test_train_mode_dropout_changes_output() {
        let cfg = config(1);
        let mut rng = StdRng::seed_from_u64(0);
        let t = ParallelTransformer::<f32>::new(&cfg, &mut rng, Arc::new(SerialBackend)).unwrap();
        let x = Tensor::<f32, 3>::from_fn([1, 4, 8], |i| (i as f32 * 0.3).sin());
        let mask = causal_mask(4);
        let eval = t.forward(&x, &mask, None).unwrap();
        let mut tracker = RngTracker::new(1, 0);
        let train = t.forward(&x, &mask, Some(&mut tracker)).unwrap();
        assert!(eval.max_abs_diff(&train).unwrap() > 0.0);
    }
}
