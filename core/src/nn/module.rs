//! The [`Module`] trait and the walkers built on it.
//!
//! A module exposes its own parameters under local names (`weight`, `bias`) and its children
//! under field names (`transformer`, `layers.0`). The free functions here walk that tree and
//! produce dotted paths such as `transformer.layers.0.attention.dense.weight`, which the
//! optimizer grouping and the checkpoint code key on.

use crate::tensor::{Tensor, TensorElem};
use std::fmt::Debug;

/// Coarse classification of a module, used to decide weight-decay membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    LayerNorm,
    Other,
}

/// Read-only view of one parameter.
#[derive(Debug)]
pub struct Parameter<'a, T> {
    pub name: &'static str,
    pub shape: Vec<usize>,
    pub data: &'a [T],
}

/// Mutable view of one parameter.
#[derive(Debug)]
pub struct ParameterMut<'a, T> {
    pub name: &'static str,
    pub shape: Vec<usize>,
    pub data: &'a mut [T],
}

impl<'a, T: TensorElem> Parameter<'a, T> {
    pub fn from_tensor<const RANK: usize>(name: &'static str, tensor: &'a Tensor<T, RANK>) -> Self {
        Self {
            name,
            shape: tensor.shape().to_vec(),
            data: tensor.data(),
        }
    }
}

impl<'a, T: TensorElem> ParameterMut<'a, T> {
    pub fn from_tensor<const RANK: usize>(
        name: &'static str,
        tensor: &'a mut Tensor<T, RANK>,
    ) -> Self {
        Self {
            name,
            shape: tensor.shape().to_vec(),
            data: tensor.data_mut(),
        }
    }
}

/// A neural network component that owns parameters and/or sub-modules.
///
/// `Send + Sync` lets one model instance live on each rank thread; `Debug` keeps any model
/// inspectable.
pub trait Module<T: TensorElem>: Debug + Send + Sync {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Other
    }

    /// Parameters owned directly by this module.
    fn parameters(&self) -> Vec<Parameter<'_, T>> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<ParameterMut<'_, T>> {
        Vec::new()
    }

    /// Direct sub-modules with their field names.
    fn children(&self) -> Vec<(String, &dyn Module<T>)> {
        Vec::new()
    }

    fn children_mut(&mut self) -> Vec<(String, &mut dyn Module<T>)> {
        Vec::new()
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Every module in the tree, pre-order. The root is reported under the empty path.
pub fn named_modules<T: TensorElem>(root: &dyn Module<T>) -> Vec<(String, &dyn Module<T>)> {
    let mut out = Vec::new();
    collect_modules(String::new(), root, &mut out);
    out
}

fn collect_modules<'a, T: TensorElem>(
    path: String,
    module: &'a dyn Module<T>,
    out: &mut Vec<(String, &'a dyn Module<T>)>,
) {
    let children = module.children();
    out.push((path.clone(), module));
    for (name, child) in children {
        collect_modules(join(&path, &name), child, out);
    }
}

/// Every parameter in the tree with its fully qualified name.
pub fn named_parameters<T: TensorElem>(root: &dyn Module<T>) -> Vec<(String, Parameter<'_, T>)> {
    named_modules(root)
        .into_iter()
        .flat_map(|(path, module)| {
            module
                .parameters()
                .into_iter()
                .map(move |p| (join(&path, p.name), p))
        })
        .collect()
}

/// Calls `f` with the fully qualified name and a mutable view of every parameter.
pub fn visit_parameters_mut<T: TensorElem>(
    root: &mut dyn Module<T>,
    f: &mut dyn FnMut(&str, ParameterMut<'_, T>),
) {
    visit_mut(String::new(), root, f);
}

fn visit_mut<T: TensorElem>(
    path: String,
    module: &mut dyn Module<T>,
    f: &mut dyn FnMut(&str, ParameterMut<'_, T>),
) {
    for p in module.parameters_mut() {
        let name = join(&path, p.name);
        f(&name, p);
    }
    for (name, child) in module.children_mut() {
        visit_mut(join(&path, &name), child, f);
    }
}

/// Number of scalar parameters held by this rank.
pub fn num_parameters<T: TensorElem>(root: &dyn Module<T>) -> usize {
    named_parameters(root)
        .iter()
        .map(|(_, p)| p.data.len())
        .sum()
}
