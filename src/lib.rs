//! logit-stack: a convolutional stacking ensemble trained on the cached
//! test-time-augmented logits of several image classifiers.

pub mod logging;
pub mod stacking;

/// Tensor and fixture builders shared by unit and integration tests.
pub mod test_utils;

pub use stacking::{Phase, Pipeline, Result, RunSummary, Settings, StackError};
