use super::{element_count, row_major_strides, unravel, Tensor};
use crate::ir::PaddingMode;
use crate::shape::TensorDescriptor;
use rayon::prelude::*;

/// Sizes of the axes before and after `axis`, flattened.
fn outer_inner(dims: &[u32], axis: usize) -> (usize, usize) {
    (element_count(&dims[..axis]), element_count(&dims[axis + 1..]))
}

pub(super) fn join(inputs: &[&Tensor], axis: usize, output: &[u32]) -> Vec<f64> {
    debug_assert!(inputs.iter().all(|x| x.dims.len() == output.len()));
    debug_assert_eq!(inputs.iter().map(|x| x.dims[axis]).sum::<u32>(), output[axis]);
    let (outer, inner) = outer_inner(output, axis);
    let mut out = Vec::with_capacity(element_count(output));
    for o in 0..outer {
        for input in inputs {
            let slab = input.dims[axis] as usize * inner;
            out.extend_from_slice(&input.data[o * slab..(o + 1) * slab]);
        }
    }
    out
}

pub(super) fn split(x: &Tensor, axis: usize, outputs: &[TensorDescriptor]) -> Vec<Vec<f64>> {
    debug_assert_eq!(outputs.iter().map(|o| o.dims()[axis]).sum::<u32>(), x.dims[axis]);
    let (outer, inner) = outer_inner(&x.dims, axis);
    let row = x.dims[axis] as usize * inner;
    let mut start = 0;
    outputs
        .iter()
        .map(|desc| {
            let slab = desc.dims()[axis] as usize * inner;
            let mut out = Vec::with_capacity(outer * slab);
            for o in 0..outer {
                out.extend_from_slice(&x.data[o * row + start..o * row + start + slab]);
            }
            start += slab;
            out
        })
        .collect()
}

pub(super) fn slice(x: &Tensor, offsets: &[u32], sizes: &[u32], strides: &[u32]) -> Vec<f64> {
    debug_assert!(offsets.len() == x.dims.len() && sizes.len() == x.dims.len() && strides.len() == x.dims.len());
    debug_assert!((0..x.dims.len())
        .all(|i| sizes[i] == 0 || offsets[i] as u64 + (sizes[i] as u64 - 1) * (strides[i] as u64) < x.dims[i] as u64));
    let x_strides = row_major_strides(&x.dims);
    (0..element_count(sizes))
        .into_par_iter()
        .map(|index| {
            let source: usize = unravel(index, sizes)
                .iter()
                .enumerate()
                .map(|(axis, &c)| (offsets[axis] + c * strides[axis]) as usize * x_strides[axis])
                .sum();
            x.data[source]
        })
        .collect()
}

fn reflect(i: i64, n: i64) -> i64 {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let m = i.rem_euclid(period);
    if m < n {
        m
    } else {
        period - m
    }
}

fn symmetric(i: i64, n: i64) -> i64 {
    let period = 2 * n;
    let m = i.rem_euclid(period);
    if m < n {
        m
    } else {
        period - 1 - m
    }
}

pub(super) fn pad(x: &Tensor, mode: PaddingMode, start: &[u32], output: &[u32]) -> Vec<f64> {
    debug_assert!(start.len() == x.dims.len() && output.len() == x.dims.len());
    debug_assert!((0..output.len()).all(|i| start[i] as u64 + x.dims[i] as u64 <= output[i] as u64));
    let x_strides = row_major_strides(&x.dims);
    (0..element_count(output))
        .into_par_iter()
        .map(|index| {
            let mut source = 0;
            for (axis, &c) in unravel(index, output).iter().enumerate() {
                let n = x.dims[axis] as i64;
                let i = c as i64 - start[axis] as i64;
                let i = if (0..n).contains(&i) {
                    i
                } else {
                    match mode {
                        PaddingMode::Constant(value) => return value as f64,
                        PaddingMode::Edge => i.clamp(0, n - 1),
                        PaddingMode::Reflection => reflect(i, n),
                        PaddingMode::Symmetric => symmetric(i, n),
                    }
                };
                source += i as usize * x_strides[axis];
            }
            x.data[source]
        })
        .collect()
}

/// Output dims are `x[..axis] ++ indices ++ x[axis + 1..]`; indices are
/// clamped into the axis.
pub(super) fn gather(x: &Tensor, indices: &Tensor, axis: usize) -> Vec<f64> {
    debug_assert!(axis < x.dims.len() && x.dims[axis] > 0);
    let (outer, inner) = outer_inner(&x.dims, axis);
    let n = x.dims[axis] as i64;
    let mut out = Vec::with_capacity(outer * indices.data.len() * inner);
    for o in 0..outer {
        for &index in &indices.data {
            let i = (index as i64).clamp(0, n - 1) as usize;
            let start = (o * n as usize + i) * inner;
            out.extend_from_slice(&x.data[start..start + inner]);
        }
    }
    out
}
