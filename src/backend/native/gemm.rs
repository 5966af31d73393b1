use super::map::fuse;
use super::Tensor;
use crate::ir::ActivationFunction;
use rayon::prelude::*;

#[derive(Clone, Copy, Debug)]
pub(super) struct GemmParams {
    pub trans_a: bool,
    pub trans_b: bool,
    pub alpha: f64,
    pub beta: f64,
    pub fused: Option<ActivationFunction>,
}

/// `alpha * A x B + beta * C` over rank-4 tensors whose two leading axes are
/// batch axes already matching the output.
pub(super) fn gemm(a: &Tensor, b: &Tensor, c: Option<&Tensor>, output: &[u32], params: GemmParams) -> Vec<f64> {
    let (m, n) = (output[2] as usize, output[3] as usize);
    let batches = output[0] as usize * output[1] as usize;
    let k = (if params.trans_a { a.dims[2] } else { a.dims[3] }) as usize;
    let (a_rows, a_cols) = (a.dims[2] as usize, a.dims[3] as usize);
    let (b_rows, b_cols) = (b.dims[2] as usize, b.dims[3] as usize);

    (0..batches * m)
        .into_par_iter()
        .flat_map_iter(|row| {
            let batch = row / m;
            let i = row % m;
            let a = &a.data[batch * a_rows * a_cols..(batch + 1) * a_rows * a_cols];
            let b = &b.data[batch * b_rows * b_cols..(batch + 1) * b_rows * b_cols];
            (0..n).map(move |j| {
                let dot: f64 = (0..k)
                    .map(|p| {
                        let lhs = if params.trans_a { a[p * a_cols + i] } else { a[i * a_cols + p] };
                        let rhs = if params.trans_b { b[j * b_cols + p] } else { b[p * b_cols + j] };
                        lhs * rhs
                    })
                    .sum();
                let bias = c.map_or(0.0, |c| c.data[row * n + j]);
                fuse(params.fused, params.alpha * dot + params.beta * bias)
            })
        })
        .collect()
}
