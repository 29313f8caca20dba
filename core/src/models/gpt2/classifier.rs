use super::config::GPT2ClassifierConfig;
use super::GPT2Trunk;
use crate::distributed::backend::CollectiveBackend;
use crate::distributed::mappings::copy_to_model_parallel_region;
use crate::distributed::random::RngTracker;
use crate::nn::init::normal;
use crate::nn::linear::Linear;
use crate::nn::module::{Module, num_parameters};
use crate::tensor::{Result, Tensor, TensorElem};
use num_traits::Float;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use tracing::{debug, info};

/// GPT-2 trunk with a per-position classification head.
///
/// The head (`pooler`, then `classifier`) is replicated on every rank, so its output is already
/// complete and is never gathered, whatever `parallel_output` says.
#[derive(Debug)]
pub struct GPT2Classifier<T: TensorElem> {
    config: GPT2ClassifierConfig,
    trunk: GPT2Trunk<T>,
    pub pooler: Linear<T>,
    pub classifier: Linear<T>,
    backend: Arc<dyn CollectiveBackend>,
}

impl<T: TensorElem + Float> GPT2Classifier<T> {
    pub fn new(config: &GPT2ClassifierConfig, backend: Arc<dyn CollectiveBackend>) -> Result<Self> {
        config.validate(backend.world_size())?;
        let model = &config.model;
        let mut rng = StdRng::seed_from_u64(model.seed);
        let trunk = GPT2Trunk::new(model, &mut rng, backend.clone())?;

        let init = normal(model.init_method_std);
        let h = model.hidden_size;
        let pooler = Linear::new(init.sample([h, h], &mut rng)?, Some(Tensor::zeros([h])))?;
        let classifier = Linear::new(
            init.sample([config.num_labels, h], &mut rng)?,
            Some(Tensor::zeros([config.num_labels])),
        )?;

        let out = Self {
            config: config.clone(),
            trunk,
            pooler,
            classifier,
            backend,
        };
        info!(
            rank = out.backend.rank(),
            world_size = out.backend.world_size(),
            num_labels = out.config.num_labels,
            parameters = num_parameters(&out),
            "built GPT-2 classifier shard"
        );
        Ok(out)
    }

    pub fn config(&self) -> &GPT2ClassifierConfig {
        &self.config
    }

    /// Per-position label logits, `[b, s, num_labels]`.
    pub fn forward(
        &self,
        input_ids: &Tensor<usize, 2>,
        position_ids: &Tensor<usize, 2>,
        attention_mask: &Tensor<T, 3>,
        rng: Option<&mut RngTracker>,
    ) -> Result<Tensor<T, 3>> {
        let output = self
            .trunk
            .forward(input_ids, position_ids, attention_mask, rng)?;
        let output_parallel = copy_to_model_parallel_region(self.backend.as_ref(), &output)?;
        let pooled = self.pooler.forward(&output_parallel)?;
        let logits = self.classifier.forward(&pooled)?;
        debug!(rank = self.backend.rank(), shape = ?logits.shape(), "classifier logits");
        Ok(logits)
    }
}

impl<T: TensorElem> Module<T> for GPT2Classifier<T> {
    fn children(&self) -> Vec<(String, &dyn Module<T>)> {
        let mut children = self.trunk.children();
        children.push(("pooler".to_string(), &self.pooler as &dyn Module<T>));
        children.push(("classifier".to_string(), &self.classifier as &dyn Module<T>));
        children
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module<T>)> {
        let mut children = self.trunk.children_mut();
        children.push(("pooler".to_string(), &mut self.pooler as &mut dyn Module<T>));
        children.push((
            "classifier".to_string(),
            &mut self.classifier as &mut dyn Module<T>,
        ));
        children
    }
}
