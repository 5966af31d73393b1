//! Layout operations: views, copies and index selection.

use crate::graph::ops::{Concat, Gather, Pad, PaddingMode, Slice, Split, Transpose, Unary};
use crate::ir::{self, Operator};
use crate::ops::map::broadcast_input;
use crate::ops::{LoweringContext, LoweringError};
use crate::shape::{display_comma, validate_permutation, Array, TensorDescriptor};

fn check_axis(ctx: &LoweringContext, axis: u32, rank: usize) -> Result<(), LoweringError> {
    if axis as usize >= rank {
        return Err(ctx.invalid(format!("The axis {} is out of range for rank {}.", axis, rank)));
    }
    Ok(())
}

pub fn concat(ctx: &mut LoweringContext, op: &Concat) -> Result<(), LoweringError> {
    let output = ctx.operand_desc(op.output)?;
    check_axis(ctx, op.axis, output.rank())?;
    let inputs = op
        .inputs
        .iter()
        .map(|&id| ctx.input(id))
        .collect::<Result<Vec<_>, _>>()?;
    if inputs.is_empty() {
        return Err(ctx.invalid("concat needs at least one input"));
    }

    let axis = op.axis as usize;
    let mut total = 0;
    for (_, desc) in &inputs {
        let same_outside = desc.rank() == output.rank()
            && (0..desc.rank()).all(|i| i == axis || desc.dims()[i] == output.dims()[i]);
        if !same_outside {
            return Err(ctx.invalid(format!(
                "input shape [{}] does not match output shape [{}] outside axis {}",
                display_comma(desc.dims()),
                display_comma(output.dims()),
                axis
            )));
        }
        total += desc.dims()[axis];
    }
    if total != output.dims()[axis] {
        return Err(ctx.invalid(format!(
            "the inputs have {} elements along axis {} but the output has {}",
            total,
            axis,
            output.dims()[axis]
        )));
    }
    ctx.add_simple(Operator::Join { axis: op.axis }, inputs, op.output)
}

/// An identity over a broadcast view of the input.
pub fn expand(ctx: &mut LoweringContext, op: &Unary) -> Result<(), LoweringError> {
    let output = ctx.operand_desc(op.output)?;
    let input = broadcast_input(ctx, op.input, output.dims())?;
    ctx.add_simple(Operator::Identity { scale_bias: None }, vec![input], op.output)
}

pub fn gather(ctx: &mut LoweringContext, op: &Gather) -> Result<(), LoweringError> {
    let input = ctx.input(op.input)?;
    let indices = ctx.input(op.indices)?;
    let output = ctx.operand_desc(op.output)?;
    check_axis(ctx, op.axis, input.1.rank())?;
    let expected = input.1.rank() - 1 + indices.1.rank();
    if output.rank() != expected {
        return Err(ctx.invalid(format!(
            "The output rank {} of gather must be {}.",
            output.rank(),
            expected
        )));
    }
    let axis = op.axis as usize;
    let dims = input.1.dims();
    let gathered: Array = dims[..axis]
        .iter()
        .chain(indices.1.dims())
        .chain(&dims[axis + 1..])
        .copied()
        .collect();
    ctx.expect_output_dims(op.output, &gathered)?;
    ctx.add_simple(Operator::Gather { axis: op.axis }, vec![input, indices], op.output)
}

pub fn pad(ctx: &mut LoweringContext, op: &Pad) -> Result<(), LoweringError> {
    let input = ctx.input(op.input)?;
    let rank = input.1.rank();
    if op.beginning_padding.len() != rank || op.ending_padding.len() != rank {
        return Err(ctx.invalid(format!("The padding must have {} entries on each side.", rank)));
    }
    let padded = input
        .1
        .dims()
        .iter()
        .zip(&op.beginning_padding)
        .zip(&op.ending_padding)
        .map(|((&d, &start), &end)| d.checked_add(start)?.checked_add(end))
        .collect::<Option<Array>>()
        .ok_or_else(|| ctx.invalid("The padded shape overflows."))?;
    ctx.expect_output_dims(op.output, &padded)?;
    let mode = match op.mode {
        PaddingMode::Constant { value } => ir::PaddingMode::Constant(value),
        PaddingMode::Edge => ir::PaddingMode::Edge,
        PaddingMode::Reflection => ir::PaddingMode::Reflection,
        PaddingMode::Symmetric => ir::PaddingMode::Symmetric,
    };
    let operator = Operator::Padding {
        mode,
        start: Array::from_slice(&op.beginning_padding),
        end: Array::from_slice(&op.ending_padding),
    };
    ctx.add_simple(operator, vec![input], op.output)
}

/// Binds the output to the input's node output under a new shape; no node
/// is created.
pub fn reshape(ctx: &mut LoweringContext, op: &Unary) -> Result<(), LoweringError> {
    let node_output = ctx.node_output_id(op.input)?;
    let (_, input) = ctx.input(op.input)?;
    let output = ctx.operand(op.output)?;
    let desc = TensorDescriptor::with_flags(output.data_type, input.flags(), &output.dimensions);
    if desc.element_count() != input.element_count() {
        return Err(ctx.invalid(format!(
            "cannot reshape [{}] to [{}]",
            display_comma(input.dims()),
            display_comma(&output.dimensions)
        )));
    }
    let source = ctx.builder.node_output(node_output).clone();
    let reshaped = ctx.create_node_output(source.node, source.output_index, desc);
    ctx.bind(op.output, reshaped);
    Ok(())
}

pub fn slice(ctx: &mut LoweringContext, op: &Slice) -> Result<(), LoweringError> {
    let input = ctx.input(op.input)?;
    let dims = input.1.dims();
    if op.starts_and_sizes.len() != dims.len() {
        return Err(ctx.invalid(format!("The slice must have {} starts and sizes.", dims.len())));
    }
    for (axis, (range, &dim)) in op.starts_and_sizes.iter().zip(dims).enumerate() {
        if range.size == 0 || range.start.checked_add(range.size).map_or(true, |end| end > dim) {
            return Err(ctx.invalid(format!(
                "The slice {}..+{} is out of range for axis {} of size {}.",
                range.start, range.size, axis, dim
            )));
        }
    }
    let sizes: Array = op.starts_and_sizes.iter().map(|r| r.size).collect();
    ctx.expect_output_dims(op.output, &sizes)?;
    let operator = Operator::Slice {
        offsets: op.starts_and_sizes.iter().map(|r| r.start).collect(),
        strides: Array::from_elem(1, sizes.len()),
        sizes,
    };
    ctx.add_simple(operator, vec![input], op.output)
}

pub fn split(ctx: &mut LoweringContext, op: &Split) -> Result<(), LoweringError> {
    let (input, desc) = ctx.input(op.input)?;
    check_axis(ctx, op.axis, desc.rank())?;
    let outputs = op
        .outputs
        .iter()
        .map(|&id| ctx.operand_desc(id))
        .collect::<Result<Vec<_>, _>>()?;
    let axis = op.axis as usize;
    for output in &outputs {
        let same_outside = output.rank() == desc.rank()
            && (0..desc.rank()).all(|i| i == axis || output.dims()[i] == desc.dims()[i]);
        if !same_outside {
            return Err(ctx.invalid(format!(
                "output shape [{}] does not match input shape [{}] outside axis {}",
                display_comma(output.dims()),
                display_comma(desc.dims()),
                axis
            )));
        }
    }
    let total: u32 = outputs.iter().map(|o| o.dims()[axis]).sum();
    if total != desc.dims()[axis] {
        return Err(ctx.invalid(format!(
            "the outputs have {} elements along axis {} but the input has {}",
            total,
            op.axis,
            desc.dims()[op.axis as usize]
        )));
    }

    let node = ctx.create_node(
        ir::OperatorDesc::new(Operator::Split { axis: op.axis }, vec![Some(desc)], outputs.clone()),
        &[input],
    )?;
    for (index, (&id, output)) in op.outputs.iter().zip(outputs).enumerate() {
        let node_output = ctx.create_node_output(node, index as u32, output);
        ctx.bind(id, node_output);
    }
    Ok(())
}

/// An identity over a transposed view of the input.
pub fn transpose(ctx: &mut LoweringContext, op: &Transpose) -> Result<(), LoweringError> {
    let (input, mut desc) = ctx.input(op.input)?;
    validate_permutation(&op.permutation, desc.rank()).map_err(|e| ctx.invalid(e.to_string()))?;
    desc.transpose(&op.permutation);
    ctx.expect_output_dims(op.output, desc.dims())?;
    ctx.add_simple(Operator::Identity { scale_bias: None }, vec![(input, desc)], op.output)
}

#[cfg(test)]
mod tests {
    use crate::backend::BackendCapabilities;
    use crate::graph::ops::*;
    use crate::graph::GraphInfo;
    use crate::ir::Operator;
    use crate::ops::{lower_graph, LoweredGraph, LoweringError, LoweringErrorKind};
    use crate::shape::DataType;

    fn lower(graph: &GraphInfo) -> Result<LoweredGraph, LoweringError> {
        lower_graph(graph, &BackendCapabilities::default())
    }

    #[test]
    fn test_transpose_is_a_strided_identity() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[2, 3]);
        let y = graph.add_output("y", DataType::Float32, &[3, 2]);
        graph.push(Operation::Transpose(Transpose {
            input: x,
            output: y,
            permutation: vec![1, 0],
        }));

        let lowered = lower(&graph).unwrap();
        let node = &lowered.desc.nodes[0];
        assert_eq!(node.operator, Operator::Identity { scale_bias: None });
        let input = node.inputs[0].as_ref().unwrap();
        assert_eq!((input.dims(), input.strides()), (&[3, 2][..], &[1, 3][..]));
        assert!(node.outputs[0].is_default_strided());
    }

    #[test]
    fn test_split_binds_every_output() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[2, 5]);
        let a = graph.add_output("a", DataType::Float32, &[2, 2]);
        let b = graph.add_output("b", DataType::Float32, &[2, 3]);
        graph.push(Operation::Split(Split {
            input: x,
            outputs: vec![a, b],
            axis: 1,
        }));

        let lowered = lower(&graph).unwrap();
        assert_eq!(lowered.desc.nodes.len(), 1);
        assert_eq!(lowered.desc.output_edges.len(), 2);
        assert_eq!(lowered.desc.output_edges[1].from_node_output_index, 1);

        graph.operations.clear();
        graph.push(Operation::Split(Split {
            input: x,
            outputs: vec![a, b],
            axis: 0,
        }));
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);
    }

    #[test]
    fn test_slice_bounds() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[4]);
        let y = graph.add_output("y", DataType::Float32, &[2]);
        graph.push(Operation::Slice(Slice {
            input: x,
            output: y,
            starts_and_sizes: vec![StartAndSize { start: 3, size: 2 }],
        }));
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);
    }

    #[test]
    fn test_gather_output_rank() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[3, 4]);
        let i = graph.add_input("i", DataType::Int32, &[2, 2]);
        let y = graph.add_output("y", DataType::Float32, &[2, 2, 4]);
        graph.push(Operation::Gather(Gather {
            input: x,
            indices: i,
            output: y,
            axis: 0,
        }));
        assert!(lower(&graph).is_ok());

        graph.operands.get_mut(&y).unwrap().dimensions = vec![4, 4];
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);

        // right rank, wrong sizes
        graph.operands.get_mut(&y).unwrap().dimensions = vec![2, 2, 3];
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);
    }

    fn pad_graph(input: &[u32], output: &[u32], begin: Vec<u32>, end: Vec<u32>) -> GraphInfo {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, input);
        let y = graph.add_output("y", DataType::Float32, output);
        graph.push(Operation::Pad(Pad {
            input: x,
            output: y,
            beginning_padding: begin,
            ending_padding: end,
            mode: PaddingMode::Edge,
        }));
        graph
    }

    #[test]
    fn test_pad_output_shape() {
        assert!(lower(&pad_graph(&[2, 3], &[3, 6], vec![1, 2], vec![0, 1])).is_ok());

        let err = lower(&pad_graph(&[2], &[2, 2], vec![0], vec![0])).unwrap_err();
        assert_eq!(err.kind, LoweringErrorKind::InvalidAttribute);
        assert_eq!(err.to_string(), "The output shape [2, 2] does not match the computed shape [2].");

        let err = lower(&pad_graph(&[2], &[5], vec![1], vec![1])).unwrap_err();
        assert_eq!(err.kind, LoweringErrorKind::InvalidAttribute);

        let err = lower(&pad_graph(&[2], &[2], vec![u32::MAX], vec![1])).unwrap_err();
        assert_eq!(err.kind, LoweringErrorKind::InvalidAttribute);
    }

    #[test]
    fn test_slice_output_shape() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[4, 4]);
        let y = graph.add_output("y", DataType::Float32, &[2, 3]);
        graph.push(Operation::Slice(Slice {
            input: x,
            output: y,
            starts_and_sizes: vec![StartAndSize { start: 1, size: 2 }, StartAndSize { start: 0, size: 3 }],
        }));
        assert!(lower(&graph).is_ok());

        graph.operands.get_mut(&y).unwrap().dimensions = vec![2, 4];
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);
    }

    #[test]
    fn test_transpose_output_shape() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[2, 3]);
        let y = graph.add_output("y", DataType::Float32, &[2, 3]);
        graph.push(Operation::Transpose(Transpose {
            input: x,
            output: y,
            permutation: vec![1, 0],
        }));
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);
    }

    #[test]
    fn test_split_output_shape() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[2, 5]);
        let a = graph.add_output("a", DataType::Float32, &[2, 2]);
        let b = graph.add_output("b", DataType::Float32, &[1, 3]);
        graph.push(Operation::Split(Split {
            input: x,
            outputs: vec![a, b],
            axis: 1,
        }));
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);
    }

    #[test]
    fn test_concat() {
        let mut graph = GraphInfo::new();
        let a = graph.add_input("a", DataType::Float32, &[2, 1]);
        let b = graph.add_input("b", DataType::Float32, &[2, 2]);
        let y = graph.add_output("y", DataType::Float32, &[2, 3]);
        graph.push(Operation::Concat(Concat {
            inputs: vec![a, b],
            output: y,
            axis: 1,
        }));
        let lowered = lower(&graph).unwrap();
        assert_eq!(lowered.desc.nodes[0].operator, Operator::Join { axis: 1 });
        assert_eq!(lowered.desc.input_edges.len(), 2);
    }
}
