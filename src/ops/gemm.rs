use crate::graph::ops::{Gemm, Matmul};
use crate::ir::Operator;
use crate::ops::{LoweringContext, LoweringError};
use crate::shape::{display_comma, Alignment, TensorDescriptor};

/// Rank of every tensor the native gemm reads and writes.
const GEMM_RANK: usize = 4;

fn padded(dims: &[u32]) -> Vec<u32> {
    let mut out = vec![1; GEMM_RANK.saturating_sub(dims.len())];
    out.extend_from_slice(dims);
    out
}

fn gemm_operator(alpha: f32, beta: f32, trans_a: bool, trans_b: bool) -> Operator {
    Operator::Gemm {
        trans_a,
        trans_b,
        alpha,
        beta,
        fused: None,
    }
}

pub fn gemm(ctx: &mut LoweringContext, op: &Gemm) -> Result<(), LoweringError> {
    let (a, mut a_desc) = ctx.input(op.a)?;
    let (b, mut b_desc) = ctx.input(op.b)?;
    let output = ctx.operand_desc(op.output)?;
    if a_desc.rank() != 2 || b_desc.rank() != 2 || output.rank() != 2 {
        return Err(ctx.invalid("gemm takes 2-D operands"));
    }

    let [m, k] = match op.a_transpose {
        false => [a_desc.dims()[0], a_desc.dims()[1]],
        true => [a_desc.dims()[1], a_desc.dims()[0]],
    };
    let [kb, n] = match op.b_transpose {
        false => [b_desc.dims()[0], b_desc.dims()[1]],
        true => [b_desc.dims()[1], b_desc.dims()[0]],
    };
    if k != kb || output.dims() != [m, n] {
        return Err(ctx.invalid(format!(
            "cannot multiply [{}] by [{}] into [{}]",
            display_comma(a_desc.dims()),
            display_comma(b_desc.dims()),
            display_comma(output.dims())
        )));
    }

    let out4 = padded(output.dims());
    a_desc.ensure_minimum_rank(GEMM_RANK, Alignment::Trailing);
    b_desc.ensure_minimum_rank(GEMM_RANK, Alignment::Trailing);
    let c = match op.c {
        Some(id) => {
            let (c, mut desc) = ctx.input(id)?;
            if !desc.is_broadcastable_to(&out4) {
                return Err(ctx.invalid(format!(
                    "C of shape [{}] cannot be broadcast to [{}]",
                    display_comma(desc.dims()),
                    display_comma(output.dims())
                )));
            }
            desc.broadcast_to(&out4);
            Some((c, desc))
        }
        None => None,
    };

    let node_output = TensorDescriptor::new(output.data_type(), &out4);
    let operator = gemm_operator(op.alpha, op.beta, op.a_transpose, op.b_transpose);
    let bound = ctx.add_node(
        operator,
        vec![Some((a, a_desc)), Some((b, b_desc)), c],
        node_output,
        Some(output),
    )?;
    ctx.bind(op.output, bound);
    Ok(())
}

/// Batched matrix product; the batch axes of both operands broadcast to the
/// batch axes of the output.
pub fn matmul(ctx: &mut LoweringContext, op: &Matmul) -> Result<(), LoweringError> {
    let (a, mut a_desc) = ctx.input(op.a)?;
    let (b, mut b_desc) = ctx.input(op.b)?;
    let output = ctx.operand_desc(op.output)?;
    if a_desc.rank() < 2 || b_desc.rank() < 2 {
        return Err(ctx.invalid("1-D matmul operands are not supported"));
    }
    if output.rank() < 2 || output.rank() > GEMM_RANK {
        return Err(ctx.invalid(format!("the output rank must be between 2 and {}", GEMM_RANK)));
    }

    let (ad, bd, od) = (a_desc.dims(), b_desc.dims(), output.dims());
    let [m, k] = [ad[ad.len() - 2], ad[ad.len() - 1]];
    let [kb, n] = [bd[bd.len() - 2], bd[bd.len() - 1]];
    if k != kb || od[od.len() - 2..] != [m, n] {
        return Err(ctx.invalid(format!(
            "cannot multiply [{}] by [{}] into [{}]",
            display_comma(ad),
            display_comma(bd),
            display_comma(od)
        )));
    }

    let out4 = padded(od);
    for desc in [&a_desc, &b_desc] {
        if !desc.is_broadcastable_to_ignoring(&out4, 2) {
            return Err(ctx.invalid(format!(
                "the batch axes of [{}] cannot be broadcast to [{}]",
                display_comma(desc.dims()),
                display_comma(od)
            )));
        }
    }
    a_desc.broadcast_to_ignoring(&out4, 2);
    b_desc.broadcast_to_ignoring(&out4, 2);

    let node_output = TensorDescriptor::new(output.data_type(), &out4);
    let bound = ctx.add_node(
        gemm_operator(1.0, 0.0, false, false),
        vec![Some((a, a_desc)), Some((b, b_desc)), None],
        node_output,
        Some(output),
    )?;
    ctx.bind(op.output, bound);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendCapabilities;
    use crate::graph::ops::Operation;
    use crate::graph::GraphInfo;
    use crate::ops::{lower_graph, LoweredGraph, LoweringErrorKind};
    use crate::shape::DataType;

    fn lower(graph: &GraphInfo) -> Result<LoweredGraph, LoweringError> {
        lower_graph(graph, &BackendCapabilities::default())
    }

    #[test]
    fn test_gemm_broadcasts_c() {
        let mut graph = GraphInfo::new();
        let a = graph.add_input("a", DataType::Float32, &[3, 2]);
        let b = graph.add_input("b", DataType::Float32, &[3, 4]);
        let c = graph.add_input("c", DataType::Float32, &[4]);
        let y = graph.add_output("y", DataType::Float32, &[2, 4]);
        graph.push(Operation::Gemm(Gemm {
            a,
            b,
            c: Some(c),
            output: y,
            alpha: 1.0,
            beta: 1.0,
            a_transpose: true,
            b_transpose: false,
        }));

        let lowered = lower(&graph).unwrap();
        let node = &lowered.desc.nodes[0];
        assert_eq!(node.inputs[0].as_ref().unwrap().dims(), &[1, 1, 3, 2]);
        let c = node.inputs[2].as_ref().unwrap();
        assert_eq!((c.dims(), c.strides()), (&[1, 1, 2, 4][..], &[0, 0, 0, 1][..]));
        assert_eq!(node.outputs[0].dims(), &[1, 1, 2, 4]);
    }

    #[test]
    fn test_gemm_shape_mismatch() {
        let mut graph = GraphInfo::new();
        let a = graph.add_input("a", DataType::Float32, &[2, 3]);
        let b = graph.add_input("b", DataType::Float32, &[2, 4]);
        let y = graph.add_output("y", DataType::Float32, &[2, 4]);
        graph.push(Operation::Gemm(Gemm {
            a,
            b,
            c: None,
            output: y,
            alpha: 1.0,
            beta: 0.0,
            a_transpose: false,
            b_transpose: false,
        }));
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);
    }

    #[test]
    fn test_matmul_broadcasts_batches() {
        let mut graph = GraphInfo::new();
        let a = graph.add_input("a", DataType::Float32, &[2, 1, 3, 4]);
        let b = graph.add_input("b", DataType::Float32, &[4, 5]);
        let y = graph.add_output("y", DataType::Float32, &[2, 1, 3, 5]);
        graph.push(Operation::Matmul(Matmul { a, b, output: y }));

        let lowered = lower(&graph).unwrap();
        let node = &lowered.desc.nodes[0];
        let b = node.inputs[1].as_ref().unwrap();
        assert_eq!((b.dims(), b.strides()), (&[2, 1, 4, 5][..], &[0, 0, 5, 1][..]));
        assert!(node.inputs[2].is_none());
    }

    #[test]
    fn test_matmul_rejects_vectors() {
        let mut graph = GraphInfo::new();
        let a = graph.add_input("a", DataType::Float32, &[4]);
        let b = graph.add_input("b", DataType::Float32, &[4, 5]);
        let y = graph.add_output("y", DataType::Float32, &[5]);
        graph.push(Operation::Matmul(Matmul { a, b, output: y }));
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);
    }
}
