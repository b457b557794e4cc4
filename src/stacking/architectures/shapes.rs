//! Parameter shape listing and comparison.
//!
//! burn loads a record into any module of the same structure without checking
//! tensor shapes, so loaders compare the freshly built module against the
//! loaded one and fail on the first difference.

use burn::nn::conv::Conv2d;
use burn::nn::Linear;
use burn::tensor::backend::Backend;

use crate::stacking::error::{Result, StackError};

/// Named parameter shapes of a module, in a fixed order.
pub trait ParameterShapes {
    fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)>;
}

pub fn conv2d_shapes<B: Backend>(prefix: &str, conv: &Conv2d<B>, out: &mut Vec<(String, Vec<usize>)>) {
    out.push((format!("{prefix}.weight"), conv.weight.val().dims().to_vec()));
    if let Some(bias) = &conv.bias {
        out.push((format!("{prefix}.bias"), bias.val().dims().to_vec()));
    }
}

pub fn linear_shapes<B: Backend>(prefix: &str, linear: &Linear<B>, out: &mut Vec<(String, Vec<usize>)>) {
    out.push((format!("{prefix}.weight"), linear.weight.val().dims().to_vec()));
    if let Some(bias) = &linear.bias {
        out.push((format!("{prefix}.bias"), bias.val().dims().to_vec()));
    }
}

/// Compare the shapes of `found` against `expected`.
///
/// # Errors
/// `StackError::ShapeMismatch` naming the first differing parameter, or a
/// parameter present on only one side.
pub fn ensure_same_shapes(
    context: &str,
    expected: &impl ParameterShapes,
    found: &impl ParameterShapes,
) -> Result<()> {
    let expected = expected.parameter_shapes();
    let found = found.parameter_shapes();
    for (idx, (name, shape)) in expected.iter().enumerate() {
        match found.get(idx) {
            Some((found_name, found_shape)) if found_name == name && found_shape == shape => {}
            Some((_, found_shape)) => {
                return Err(StackError::ShapeMismatch {
                    context: context.to_string(),
                    parameter: name.clone(),
                    expected: shape.clone(),
                    found: found_shape.clone(),
                })
            }
            None => {
                return Err(StackError::ShapeMismatch {
                    context: context.to_string(),
                    parameter: name.clone(),
                    expected: shape.clone(),
                    found: Vec::new(),
                })
            }
        }
    }
    if let Some((name, shape)) = found.get(expected.len()) {
        return Err(StackError::ShapeMismatch {
            context: context.to_string(),
            parameter: name.clone(),
            expected: Vec::new(),
            found: shape.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Listed(Vec<(String, Vec<usize>)>);

    impl ParameterShapes for Listed {
        fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
            self.0.clone()
        }
    }

    fn listed(entries: &[(&str, &[usize])]) -> Listed {
        Listed(entries.iter().map(|(n, s)| (n.to_string(), s.to_vec())).collect())
    }

    #[test]
    fn test_identical_shapes_pass() {
        let a = listed(&[("fc.weight", &[4, 2]), ("fc.bias", &[2])]);
        let b = listed(&[("fc.weight", &[4, 2]), ("fc.bias", &[2])]);
        assert!(ensure_same_shapes("test", &a, &b).is_ok());
    }

    #[test]
    fn test_reports_first_mismatch() {
        let a = listed(&[("conv.weight", &[8, 3, 3, 3]), ("fc.weight", &[8, 5])]);
        let b = listed(&[("conv.weight", &[8, 3, 3, 3]), ("fc.weight", &[8, 4])]);
        match ensure_same_shapes("model", &a, &b) {
            Err(StackError::ShapeMismatch { parameter, expected, found, .. }) => {
                assert_eq!(parameter, "fc.weight");
                assert_eq!(expected, vec![8, 5]);
                assert_eq!(found, vec![8, 4]);
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_extra_parameter_is_a_mismatch() {
        let a = listed(&[("fc.weight", &[4, 2])]);
        let b = listed(&[("fc.weight", &[4, 2]), ("fc.bias", &[2])]);
        assert!(ensure_same_shapes("model", &a, &b).is_err());
    }
}
