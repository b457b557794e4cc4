//! Second-level stacking over the out-of-fold logits of image classifiers.
//!
//! The run has three phases: score held-out folds with the base models and
//! cache the logits, train one stacking network per fold on those logits, and
//! optionally predict the submission table by averaging the fold models.

pub mod architectures;
pub mod builder;
pub mod cache;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod loss_utils;
pub mod metrics;
pub mod mixing;
pub mod pipeline;
pub mod scorer;
pub mod settings;
pub mod train;
pub mod tta;

pub use error::{Result, StackError};
pub use pipeline::{Phase, Pipeline, RunSummary};
pub use settings::{DeviceKind, Settings};
