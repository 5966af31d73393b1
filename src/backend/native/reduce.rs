use super::{element_count, row_major_strides, unravel, Tensor};
use crate::ir::{AxisDirection, ReduceFunction};
use rayon::prelude::*;

/// Index of the reduction group each element belongs to, with the reduced
/// axes collapsed to size 1. Elements of a group keep row-major order.
fn group_indices(dims: &[u32], axes: &[u32]) -> (usize, Vec<usize>) {
    let reduced: Vec<u32> = dims
        .iter()
        .enumerate()
        .map(|(axis, &d)| if axes.contains(&(axis as u32)) { 1 } else { d })
        .collect();
    let strides = row_major_strides(&reduced);
    let indices = (0..element_count(dims))
        .map(|index| {
            unravel(index, dims)
                .iter()
                .enumerate()
                .map(|(axis, &c)| if reduced[axis] == 1 { 0 } else { c as usize * strides[axis] })
                .sum()
        })
        .collect();
    (element_count(&reduced), indices)
}

fn groups(x: &Tensor, axes: &[u32]) -> Vec<Vec<f64>> {
    let (count, indices) = group_indices(&x.dims, axes);
    let mut groups = vec![Vec::new(); count];
    for (&group, &value) in indices.iter().zip(&x.data) {
        groups[group].push(value);
    }
    groups
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max.is_infinite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

pub(super) fn reduce(x: &Tensor, function: ReduceFunction, axes: &[u32]) -> Vec<f64> {
    groups(x, axes)
        .par_iter()
        .map(|values| match function {
            ReduceFunction::L1 => values.iter().map(|v| v.abs()).sum(),
            ReduceFunction::L2 => values.iter().map(|v| v * v).sum::<f64>().sqrt(),
            ReduceFunction::LogSum => values.iter().sum::<f64>().ln(),
            ReduceFunction::LogSumExp => log_sum_exp(values),
            ReduceFunction::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            ReduceFunction::Average => values.iter().sum::<f64>() / values.len().max(1) as f64,
            ReduceFunction::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            ReduceFunction::Multiply => values.iter().product(),
            ReduceFunction::Sum => values.iter().sum(),
            ReduceFunction::SumSquare => values.iter().map(|v| v * v).sum(),
        })
        .collect()
}

/// Position of the extreme value within each group, counted row-major over
/// the reduced axes.
pub(super) fn arg_reduce(x: &Tensor, axes: &[u32], max: bool, direction: AxisDirection) -> Vec<f64> {
    groups(x, axes)
        .par_iter()
        .map(|values| {
            let mut best = 0;
            for (i, &v) in values.iter().enumerate().skip(1) {
                let current = values[best];
                let better = if max { v > current } else { v < current };
                let tie = v == current && direction == AxisDirection::Decreasing;
                if better || tie {
                    best = i;
                }
            }
            best as f64
        })
        .collect()
}

/// Softmax over the last axis.
pub(super) fn softmax(x: &Tensor) -> Vec<f64> {
    let width = x.dims.last().map_or(1, |&d| d as usize);
    x.data
        .par_chunks(width)
        .flat_map_iter(|row| {
            let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let exps: Vec<f64> = row.iter().map(|v| (v - max).exp()).collect();
            let sum: f64 = exps.iter().sum();
            exps.into_iter().map(move |e| e / sum)
        })
        .collect()
}

/// `(x - mean) / sqrt(variance + epsilon) * scale + bias` with statistics over
/// `axes`; scale and bias are already at the input shape.
pub(super) fn mean_variance_normalization(
    x: &Tensor,
    scale: Option<&Tensor>,
    bias: Option<&Tensor>,
    axes: &[u32],
    epsilon: f64,
) -> Vec<f64> {
    let (count, indices) = group_indices(&x.dims, axes);
    let mut sums = vec![(0.0, 0.0, 0usize); count];
    for (&group, &v) in indices.iter().zip(&x.data) {
        let (sum, squares, n) = &mut sums[group];
        *sum += v;
        *squares += v * v;
        *n += 1;
    }
    let stats: Vec<(f64, f64)> = sums
        .into_iter()
        .map(|(sum, squares, n)| {
            let n = n.max(1) as f64;
            let mean = sum / n;
            (mean, (squares / n - mean * mean).max(0.0))
        })
        .collect();

    (0..x.data.len())
        .into_par_iter()
        .map(|i| {
            let (mean, variance) = stats[indices[i]];
            let normalized = (x.data[i] - mean) / (variance + epsilon).sqrt();
            normalized * scale.map_or(1.0, |s| s.data[i]) + bias.map_or(0.0, |b| b.data[i])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Array;

    fn tensor(dims: &[u32], data: &[f64]) -> Tensor {
        Tensor {
            dims: Array::from_slice(dims),
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
    fn test_reduce() {
        let x = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(reduce(&x, ReduceFunction::Sum, &[1]), vec![6.0, 15.0]);
        assert_eq!(reduce(&x, ReduceFunction::Sum, &[0]), vec![5.0, 7.0, 9.0]);
        assert_eq!(reduce(&x, ReduceFunction::Max, &[0, 1]), vec![6.0]);
        assert_eq!(reduce(&x, ReduceFunction::Average, &[1]), vec![2.0, 5.0]);
        assert_eq!(reduce(&x, ReduceFunction::Multiply, &[0]), vec![4.0, 10.0, 18.0]);
        assert_eq!(reduce(&x, ReduceFunction::SumSquare, &[1]), vec![14.0, 77.0]);
        assert_close(
            &reduce(&x, ReduceFunction::LogSumExp, &[1]),
            &[(1f64.exp() + 2f64.exp() + 3f64.exp()).ln(), (4f64.exp() + 5f64.exp() + 6f64.exp()).ln()],
        );
    }

    #[test]
    fn test_arg_reduce() {
        let x = tensor(&[2, 3], &[1.0, 7.0, 7.0, 4.0, 0.0, 4.0]);
        assert_eq!(arg_reduce(&x, &[1], true, AxisDirection::Increasing), vec![1.0, 0.0]);
        assert_eq!(arg_reduce(&x, &[1], true, AxisDirection::Decreasing), vec![2.0, 2.0]);
        assert_eq!(arg_reduce(&x, &[1], false, AxisDirection::Increasing), vec![0.0, 1.0]);
        assert_eq!(arg_reduce(&x, &[0, 1], true, AxisDirection::Increasing), vec![1.0]);
    }

    #[test]
    fn test_softmax() {
        let x = tensor(&[2, 2], &[0.0, 0.0, 1.0, 3.0]);
        let y = softmax(&x);
        let e = 1.0 / (1.0 + 2f64.exp());
        assert_close(&y, &[0.5, 0.5, e, 1.0 - e]);
    }

    #[test]
    fn test_mean_variance_normalization() {
        let x = tensor(&[2, 2], &[1.0, 3.0, 10.0, 10.0]);
        let y = mean_variance_normalization(&x, None, None, &[1], 0.0);
        assert_close(&y[..2], &[-1.0, 1.0]);

        let scale = tensor(&[2, 2], &[2.0, 2.0, 2.0, 2.0]);
        let bias = tensor(&[2, 2], &[1.0, 1.0, 1.0, 1.0]);
        let y = mean_variance_normalization(&x, Some(&scale), Some(&bias), &[1], 1e-12);
        assert_close(&y, &[-1.0, 3.0, 1.0, 1.0]);
    }
}
