use crate::graph::ops::{ArgMinMax, ArgMinMaxKind, Reduce, ReduceKind, Unary};
use crate::ir::{ActivationFunction, AxisDirection, Operator, ReduceFunction};
use crate::ops::{LoweringContext, LoweringError};
use crate::shape::{display_comma, Array, TensorDescriptor};

/// Reduced axes of an input of rank `rank`; an empty list means every axis.
fn reduction_axes(ctx: &LoweringContext, axes: &[u32], rank: usize) -> Result<Array, LoweringError> {
    if axes.is_empty() {
        return Ok((0..rank as u32).collect());
    }
    let mut seen = Array::from_elem(0, rank);
    for &axis in axes {
        let slot = seen
            .get_mut(axis as usize)
            .ok_or_else(|| ctx.invalid(format!("The axis {} is out of range for rank {}.", axis, rank)))?;
        if *slot != 0 {
            return Err(ctx.invalid(format!("The axis {} is reduced twice.", axis)));
        }
        *slot = 1;
    }
    Ok(Array::from_slice(axes))
}

/// Creates a node whose native output keeps the input rank, with size 1 on
/// the reduced axes, and binds the declared output to it.
fn add_reduction(
    ctx: &mut LoweringContext,
    operator: Operator,
    input: u64,
    axes: &[u32],
    output: u64,
) -> Result<(), LoweringError> {
    let (node_input, desc) = ctx.input(input)?;
    let declared = ctx.operand_desc(output)?;
    let mut dims = Array::from_slice(desc.dims());
    for &axis in axes {
        dims[axis as usize] = 1;
    }
    let node_output = TensorDescriptor::new(declared.data_type(), &dims);
    if node_output.element_count() != declared.element_count() {
        return Err(ctx.invalid(format!(
            "reducing [{}] gives [{}], which does not match the output [{}]",
            display_comma(desc.dims()),
            display_comma(&dims),
            display_comma(declared.dims())
        )));
    }
    let bound = ctx.add_node(operator, vec![Some((node_input, desc))], node_output, Some(declared))?;
    ctx.bind(output, bound);
    Ok(())
}

pub fn reduce(ctx: &mut LoweringContext, op: &Reduce) -> Result<(), LoweringError> {
    let rank = ctx.operand_desc(op.input)?.rank();
    let axes = reduction_axes(ctx, &op.axes, rank)?;
    let function = match op.kind {
        ReduceKind::L1 => ReduceFunction::L1,
        ReduceKind::L2 => ReduceFunction::L2,
        ReduceKind::LogSum => ReduceFunction::LogSum,
        ReduceKind::LogSumExp => ReduceFunction::LogSumExp,
        ReduceKind::Max => ReduceFunction::Max,
        ReduceKind::Mean => ReduceFunction::Average,
        ReduceKind::Min => ReduceFunction::Min,
        ReduceKind::Product => ReduceFunction::Multiply,
        ReduceKind::Sum => ReduceFunction::Sum,
        ReduceKind::SumSquare => ReduceFunction::SumSquare,
    };
    let operator = Operator::Reduce {
        function,
        axes: axes.clone(),
    };
    add_reduction(ctx, operator, op.input, &axes, op.output)
}

pub fn arg_min_max(ctx: &mut LoweringContext, op: &ArgMinMax) -> Result<(), LoweringError> {
    let rank = ctx.operand_desc(op.input)?.rank();
    let axes = reduction_axes(ctx, &op.axes, rank)?;
    let direction = if op.select_last_index {
        AxisDirection::Decreasing
    } else {
        AxisDirection::Increasing
    };
    let operator = match op.kind {
        ArgMinMaxKind::Min => Operator::ArgMin {
            axes: axes.clone(),
            direction,
        },
        ArgMinMaxKind::Max => Operator::ArgMax {
            axes: axes.clone(),
            direction,
        },
    };
    add_reduction(ctx, operator, op.input, &axes, op.output)
}

/// Softmax over the last axis.
pub fn softmax(ctx: &mut LoweringContext, op: &Unary) -> Result<(), LoweringError> {
    let input = ctx.input(op.input)?;
    if input.1.rank() == 0 {
        return Err(ctx.invalid("softmax needs at least one axis"));
    }
    ctx.expect_output_dims(op.output, input.1.dims())?;
    ctx.add_simple(Operator::Activation(ActivationFunction::Softmax), vec![input], op.output)
}
