pub mod activation;
pub mod dropout;
pub mod embedding;
pub mod init;
pub mod linear;
pub mod module;
pub mod norm;

pub use activation::Activation;
pub use dropout::Dropout;
pub use embedding::Embedding;
pub use init::Init;
pub use linear::Linear;
pub use module::{Module, ModuleKind, named_modules, named_parameters, num_parameters};
pub use norm::LayerNorm;
