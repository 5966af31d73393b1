use super::map::fuse;
use super::{element_count, row_major_strides, unravel, Tensor};
use crate::ir::{ActivationFunction, ConvolutionDirection, ResampleMode, Window2d};
use rayon::prelude::*;
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug)]
pub(super) struct ConvParams {
    pub direction: ConvolutionDirection,
    pub window: Window2d,
    pub groups: u32,
    pub fused: Option<ActivationFunction>,
}

/// Input row (or column) a window tap reads, if it falls inside the input.
fn source_position(out: usize, tap: usize, axis: usize, window: &Window2d, size: usize) -> Option<usize> {
    let position = (out * window.strides[axis] as usize + tap * window.dilations[axis] as usize) as i64
        - window.start_padding[axis] as i64;
    (0..size as i64).contains(&position).then_some(position as usize)
}

/// Input position that reaches `out` through `tap` in a transposed convolution.
fn transposed_source(out: usize, tap: usize, axis: usize, window: &Window2d, size: usize) -> Option<usize> {
    let shifted = out as i64 + window.start_padding[axis] as i64 - (tap * window.dilations[axis] as usize) as i64;
    let stride = window.strides[axis] as i64;
    if shifted < 0 || shifted % stride != 0 {
        return None;
    }
    let position = shifted / stride;
    (position < size as i64).then_some(position as usize)
}

/// NCHW convolution. The forward filter is OIHW with `C / groups` input
/// channels; the backward (transposed) filter is IOHW with `M / groups`
/// output channels.
pub(super) fn convolution(
    x: &Tensor,
    filter: &Tensor,
    bias: Option<&Tensor>,
    output: &[u32],
    params: ConvParams,
) -> Vec<f64> {
    let [channels, height, width] = [x.dims[1], x.dims[2], x.dims[3]].map(|d| d as usize);
    let [kernel_h, kernel_w] = [filter.dims[2], filter.dims[3]].map(|d| d as usize);
    let out_channels = output[1] as usize;
    let groups = params.groups.max(1) as usize;
    let (group_in, group_out) = (channels / groups, out_channels / groups);
    let x_strides = row_major_strides(&x.dims);
    let f_strides = row_major_strides(&filter.dims);
    let window = &params.window;

    (0..element_count(output))
        .into_par_iter()
        .map(|index| {
            let coords = unravel(index, output);
            let [n, m, y, xo] = [coords[0], coords[1], coords[2], coords[3]].map(|c| c as usize);
            let group = m / group_out;
            let mut sum = bias.map_or(0.0, |b| b.data[m]);
            for ci in 0..group_in {
                let c = group * group_in + ci;
                for ky in 0..kernel_h {
                    for kx in 0..kernel_w {
                        let (iy, ix, f) = match params.direction {
                            ConvolutionDirection::Forward => (
                                source_position(y, ky, 0, window, height),
                                source_position(xo, kx, 1, window, width),
                                m * f_strides[0] + ci * f_strides[1],
                            ),
                            ConvolutionDirection::Backward => (
                                transposed_source(y, ky, 0, window, height),
                                transposed_source(xo, kx, 1, window, width),
                                c * f_strides[0] + (m % group_out) * f_strides[1],
                            ),
                        };
                        if let (Some(iy), Some(ix)) = (iy, ix) {
                            let value = x.data[n * x_strides[0] + c * x_strides[1] + iy * x_strides[2] + ix];
                            sum += value * filter.data[f + ky * f_strides[2] + kx];
                        }
                    }
                }
            }
            fuse(params.fused, sum)
        })
        .collect()
}

#[derive(Clone, Copy, Debug)]
pub(super) enum PoolFunction {
    Average { include_padding: bool },
    Lp(u32),
    Max,
}

pub(super) fn pool(x: &Tensor, window: &Window2d, function: PoolFunction, output: &[u32]) -> Vec<f64> {
    let [height, width] = [x.dims[2], x.dims[3]].map(|d| d as usize);
    let x_strides = row_major_strides(&x.dims);
    let [window_h, window_w] = window.size.map(|d| d as usize);

    (0..element_count(output))
        .into_par_iter()
        .map(|index| {
            let coords = unravel(index, output);
            let [n, c, y, xo] = [coords[0], coords[1], coords[2], coords[3]].map(|c| c as usize);
            let base = n * x_strides[0] + c * x_strides[1];
            let row = x_strides[2];
            let values = (0..window_h)
                .filter_map(|ky| source_position(y, ky, 0, window, height))
                .flat_map(|iy| {
                    (0..window_w)
                        .filter_map(move |kx| source_position(xo, kx, 1, window, width))
                        .map(move |ix| x.data[base + iy * row + ix])
                });
            match function {
                PoolFunction::Average { include_padding } => {
                    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
                    let count = if include_padding { window_h * window_w } else { count };
                    sum / count.max(1) as f64
                }
                PoolFunction::Lp(p) => {
                    let p = p as f64;
                    values.map(|v| v.abs().powf(p)).sum::<f64>().powf(1.0 / p)
                }
                PoolFunction::Max => values.fold(f64::NEG_INFINITY, f64::max),
            }
        })
        .collect()
}

/// Half-pixel resampling of every axis by `scales`.
pub(super) fn resample(x: &Tensor, mode: ResampleMode, scales: &[f32], output: &[u32]) -> Vec<f64> {
    let x_strides = row_major_strides(&x.dims);
    (0..element_count(output))
        .into_par_iter()
        .map(|index| {
            let coords = unravel(index, output);
            // per axis: (source offset, weight) taps
            let taps: SmallVec<[SmallVec<[(usize, f64); 2]>; 8]> = coords
                .iter()
                .enumerate()
                .map(|(axis, &c)| {
                    let size = x.dims[axis] as usize;
                    let scale = scales[axis] as f64;
                    let stride = x_strides[axis];
                    match mode {
                        ResampleMode::NearestNeighbor => {
                            let i = (((c as f64 + 0.5) / scale).floor() as usize).min(size - 1);
                            SmallVec::from_slice(&[(i * stride, 1.0)])
                        }
                        ResampleMode::Linear => {
                            let position = ((c as f64 + 0.5) / scale - 0.5).clamp(0.0, (size - 1) as f64);
                            let i0 = position.floor() as usize;
                            let i1 = (i0 + 1).min(size - 1);
                            let t = position - i0 as f64;
                            if i0 == i1 || t == 0.0 {
                                SmallVec::from_slice(&[(i0 * stride, 1.0)])
                            } else {
                                SmallVec::from_slice(&[(i0 * stride, 1.0 - t), (i1 * stride, t)])
                            }
                        }
                    }
                })
                .collect();

            // sum over every combination of taps
            let mut counter: SmallVec<[usize; 8]> = SmallVec::from_elem(0, taps.len());
            let mut value = 0.0;
            loop {
                let (offset, weight) = counter
                    .iter()
                    .zip(&taps)
                    .fold((0, 1.0), |(o, w), (&k, axis)| (o + axis[k].0, w * axis[k].1));
                value += x.data[offset] * weight;

                let mut axis = taps.len();
                loop {
                    if axis == 0 {
                        return value;
                    }
                    axis -= 1;
                    counter[axis] += 1;
                    if counter[axis] < taps[axis].len() {
                        break;
                    }
                    counter[axis] = 0;
                }
            }
        })
        .collect()
}
