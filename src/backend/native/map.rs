use super::Tensor;
use crate::ir::{ActivationFunction, BinaryFunction, ElementWiseFunction};
use rayon::prelude::*;

pub(super) fn unary<F>(x: &Tensor, f: F) -> Vec<f64>
where
    F: Fn(f64) -> f64 + Send + Sync,
{
    x.data.par_iter().map(|&v| f(v)).collect()
}

fn zip_map<F>(tensors: &[&Tensor], f: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    let len = tensors.first().map_or(0, |t| t.data.len());
    (0..len)
        .into_par_iter()
        .map_init(
            || Vec::with_capacity(tensors.len()),
            |args, i| {
                args.clear();
                args.extend(tensors.iter().map(|t| t.data[i]));
                f(args)
            },
        )
        .collect()
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Abramowitz and Stegun 7.1.26, accurate to about 1.5e-7.
pub(super) fn erf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let y = 1.0 - poly * (-x * x).exp();
    y.copysign(x)
}

pub(super) fn element_wise(function: ElementWiseFunction, v: f64) -> f64 {
    match function {
        ElementWiseFunction::Abs => v.abs(),
        ElementWiseFunction::Ceil => v.ceil(),
        ElementWiseFunction::Cos => v.cos(),
        ElementWiseFunction::Erf => erf(v),
        ElementWiseFunction::Exp => v.exp(),
        ElementWiseFunction::Floor => v.floor(),
        ElementWiseFunction::Log => v.ln(),
        ElementWiseFunction::LogicalNot => bool_value(v == 0.0),
        ElementWiseFunction::Negate => -v,
        ElementWiseFunction::Reciprocal => 1.0 / v,
        ElementWiseFunction::Sin => v.sin(),
        ElementWiseFunction::Sqrt => v.sqrt(),
        ElementWiseFunction::Tan => v.tan(),
    }
}

pub(super) fn activation(function: ActivationFunction, v: f64) -> f64 {
    match function {
        ActivationFunction::Elu { alpha } => {
            if v > 0.0 {
                v
            } else {
                alpha as f64 * (v.exp() - 1.0)
            }
        }
        ActivationFunction::HardSigmoid { alpha, beta } => (alpha as f64 * v + beta as f64).clamp(0.0, 1.0),
        ActivationFunction::HardSwish => v * (v / 6.0 + 0.5).clamp(0.0, 1.0),
        ActivationFunction::LeakyRelu { alpha } => {
            if v >= 0.0 {
                v
            } else {
                alpha as f64 * v
            }
        }
        ActivationFunction::Linear { alpha, beta } => alpha as f64 * v + beta as f64,
        ActivationFunction::Relu => v.max(0.0),
        ActivationFunction::Sigmoid => 1.0 / (1.0 + (-v).exp()),
        ActivationFunction::Softplus { steepness } => {
            let steepness = steepness as f64;
            (1.0 + (steepness * v).exp()).ln() / steepness
        }
        ActivationFunction::Softsign => v / (1.0 + v.abs()),
        ActivationFunction::Tanh => v.tanh(),
        // normalizes across elements; evaluated by reduce::softmax
        ActivationFunction::Softmax => v,
    }
}

pub(super) fn fuse(fused: Option<ActivationFunction>, v: f64) -> f64 {
    match fused {
        Some(function) => activation(function, v),
        None => v,
    }
}

pub(super) fn binary(function: BinaryFunction, a: &Tensor, b: &Tensor) -> Vec<f64> {
    zip_map(&[a, b], |args| {
        let (a, b) = (args[0], args[1]);
        match function {
            BinaryFunction::Add => a + b,
            BinaryFunction::Subtract => a - b,
            BinaryFunction::Multiply => a * b,
            BinaryFunction::Divide => a / b,
            BinaryFunction::Max => a.max(b),
            BinaryFunction::Min => a.min(b),
            BinaryFunction::Pow => a.powf(b),
            BinaryFunction::Equals => bool_value(a == b),
            BinaryFunction::GreaterThan => bool_value(a > b),
            BinaryFunction::GreaterThanOrEqual => bool_value(a >= b),
            BinaryFunction::LessThan => bool_value(a < b),
            BinaryFunction::LessThanOrEqual => bool_value(a <= b),
        }
    })
}

pub(super) fn prelu(x: &Tensor, slope: &Tensor) -> Vec<f64> {
    zip_map(&[x, slope], |args| if args[0] >= 0.0 { args[0] } else { args[0] * args[1] })
}

pub(super) fn select(condition: &Tensor, a: &Tensor, b: &Tensor) -> Vec<f64> {
    zip_map(&[condition, a, b], |args| if args[0] != 0.0 { args[1] } else { args[2] })
}

/// Inputs are the tensor, mean, variance, scale and bias, all at one shape.
pub(super) fn batch_normalization(inputs: [&Tensor; 5], epsilon: f64, fused: Option<ActivationFunction>) -> Vec<f64> {
    zip_map(&inputs, |args| {
        let [x, mean, variance, scale, bias] = [args[0], args[1], args[2], args[3], args[4]];
        fuse(fused, scale * (x - mean) / (variance + epsilon).sqrt() + bias)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Array;

    fn tensor(data: &[f64]) -> Tensor {
        Tensor {
            dims: Array::from_slice(&[data.len() as u32]),
            data: data.to_vec(),
        }
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6, "{:?} != {:?}", actual, expected);
        }
    }

    #[test]
    fn test_binary() {
        let a = tensor(&[1.0, 5.0, -2.0]);
        let b = tensor(&[2.0, 5.0, -3.0]);
        assert_eq!(binary(BinaryFunction::Add, &a, &b), vec![3.0, 10.0, -5.0]);
        assert_eq!(binary(BinaryFunction::Max, &a, &b), vec![2.0, 5.0, -2.0]);
        assert_eq!(binary(BinaryFunction::GreaterThanOrEqual, &a, &b), vec![0.0, 1.0, 1.0]);
        assert_eq!(binary(BinaryFunction::Pow, &a, &tensor(&[3.0, 0.0, 2.0])), vec![1.0, 1.0, 4.0]);
    }

    #[test]
    fn test_activations() {
        let x = tensor(&[-3.0, -1.0, 0.0, 2.0, 4.0]);
        assert_close(
            &unary(&x, |v| activation(ActivationFunction::HardSwish, v)),
            &[0.0, -1.0 / 3.0, 0.0, 5.0 / 3.0, 4.0],
        );
        assert_close(
            &unary(&x, |v| activation(ActivationFunction::LeakyRelu { alpha: 0.5 }, v)),
            &[-1.5, -0.5, 0.0, 2.0, 4.0],
        );
        assert_close(
            &unary(&x, |v| activation(ActivationFunction::HardSigmoid { alpha: 0.2, beta: 0.5 }, v)),
            &[0.0, 0.3, 0.5, 0.9, 1.0],
        );
        assert_close(
            &unary(&tensor(&[0.0]), |v| activation(ActivationFunction::Softplus { steepness: 1.0 }, v)),
            &[std::f64::consts::LN_2],
        );
    }

    #[test]
    fn test_erf() {
        assert_close(
            &[erf(0.0), erf(0.5), erf(-1.0), erf(3.0)],
            &[0.0, 0.5204998778, -0.8427007929, 0.9999779095],
        );
    }

    #[test]
    fn test_select_and_prelu() {
        let condition = tensor(&[1.0, 0.0, 2.0]);
        let a = tensor(&[1.0, 2.0, 3.0]);
        let b = tensor(&[-1.0, -2.0, -3.0]);
        assert_eq!(select(&condition, &a, &b), vec![1.0, -2.0, 3.0]);
        assert_eq!(prelu(&b, &tensor(&[0.5, 0.5, 2.0])), vec![-0.5, -1.0, -6.0]);
    }

    #[test]
    fn test_batch_normalization() {
        let x = tensor(&[1.0, 3.0]);
        let mean = tensor(&[1.0, 1.0]);
        let variance = tensor(&[4.0, 4.0]);
        let scale = tensor(&[2.0, 2.0]);
        let bias = tensor(&[-3.0, -3.0]);
        let y = batch_normalization([&x, &mean, &variance, &scale, &bias], 0.0, Some(ActivationFunction::Relu));
        assert_close(&y, &[0.0, 0.0]);
        let y = batch_normalization([&x, &mean, &variance, &scale, &bias], 0.0, None);
        assert_close(&y, &[-3.0, -1.0]);
    }
}
