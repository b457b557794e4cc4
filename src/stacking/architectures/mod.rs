pub mod base_model;
pub mod shapes;
pub mod stack_model;

pub use base_model::{load_fold_models, ConvClassifier, ImageClassifier};
pub use shapes::{ensure_same_shapes, ParameterShapes};
pub use stack_model::{StackModel, StackModelConfig};
