//! Element-wise operations.

use crate::graph::ops::{
    BinaryKind, Clamp, ElementWiseBinary, ElementWiseUnary, Elu, HardSigmoid, LeakyRelu, Linear, Prelu, Softplus,
    UnaryKind, Unary, Where,
};
use crate::graph::OperandId;
use crate::ir::builder::NodeOutputId;
use crate::ir::{ActivationFunction, BinaryFunction, ElementWiseFunction, Operator, ScaleBias};
use crate::ops::{LoweringContext, LoweringError};
use crate::shape::TensorDescriptor;

/// Reads operand `id` broadcast to the shape of `output`.
pub(crate) fn broadcast_input(
    ctx: &LoweringContext,
    id: OperandId,
    output: &[u32],
) -> Result<(NodeOutputId, TensorDescriptor), LoweringError> {
    let (node_output, mut desc) = ctx.input(id)?;
    if !desc.is_broadcastable_to(output) {
        return Err(ctx.invalid(format!(
            "operand {} with shape [{}] cannot be broadcast to [{}]",
            id,
            crate::shape::display_comma(desc.dims()),
            crate::shape::display_comma(output)
        )));
    }
    desc.broadcast_to(output);
    Ok((node_output, desc))
}

fn binary_function(kind: BinaryKind) -> BinaryFunction {
    match kind {
        BinaryKind::Add => BinaryFunction::Add,
        BinaryKind::Sub => BinaryFunction::Subtract,
        BinaryKind::Mul => BinaryFunction::Multiply,
        BinaryKind::Div => BinaryFunction::Divide,
        BinaryKind::Max => BinaryFunction::Max,
        BinaryKind::Min => BinaryFunction::Min,
        BinaryKind::Pow => BinaryFunction::Pow,
        BinaryKind::Equal => BinaryFunction::Equals,
        BinaryKind::Greater => BinaryFunction::GreaterThan,
        BinaryKind::GreaterOrEqual => BinaryFunction::GreaterThanOrEqual,
        BinaryKind::Lesser => BinaryFunction::LessThan,
        BinaryKind::LesserOrEqual => BinaryFunction::LessThanOrEqual,
    }
}

pub fn element_wise_binary(ctx: &mut LoweringContext, op: &ElementWiseBinary) -> Result<(), LoweringError> {
    let output = ctx.operand_desc(op.output)?;
    let lhs = broadcast_input(ctx, op.lhs, output.dims())?;
    let rhs = broadcast_input(ctx, op.rhs, output.dims())?;
    ctx.add_simple(Operator::Binary(binary_function(op.kind)), vec![lhs, rhs], op.output)
}

pub fn element_wise_unary(ctx: &mut LoweringContext, op: &ElementWiseUnary) -> Result<(), LoweringError> {
    let function = match op.kind {
        UnaryKind::Abs => ElementWiseFunction::Abs,
        UnaryKind::Ceil => ElementWiseFunction::Ceil,
        UnaryKind::Cos => ElementWiseFunction::Cos,
        UnaryKind::Exp => ElementWiseFunction::Exp,
        UnaryKind::Floor => ElementWiseFunction::Floor,
        UnaryKind::Log => ElementWiseFunction::Log,
        UnaryKind::Sin => ElementWiseFunction::Sin,
        UnaryKind::Tan => ElementWiseFunction::Tan,
        UnaryKind::LogicalNot => ElementWiseFunction::LogicalNot,
        UnaryKind::Sqrt => ElementWiseFunction::Sqrt,
        UnaryKind::Erf => ElementWiseFunction::Erf,
        UnaryKind::Reciprocal => ElementWiseFunction::Reciprocal,
        UnaryKind::Neg if ctx.feature_level().has_native_negate() => ElementWiseFunction::Negate,
        UnaryKind::Neg => {
            let scale_bias = Some(ScaleBias { scale: -1.0, bias: 0.0 });
            return unary(ctx, op.input, op.output, Operator::Identity { scale_bias });
        }
        UnaryKind::Identity => return unary(ctx, op.input, op.output, Operator::Identity { scale_bias: None }),
        UnaryKind::Cast => return unary(ctx, op.input, op.output, Operator::Cast),
    };
    unary(ctx, op.input, op.output, Operator::ElementWise(function))
}

fn unary(ctx: &mut LoweringContext, input: OperandId, output: OperandId, operator: Operator) -> Result<(), LoweringError> {
    let input = ctx.input(input)?;
    ctx.expect_output_dims(output, input.1.dims())?;
    ctx.add_simple(operator, vec![input], output)
}

pub fn activation(ctx: &mut LoweringContext, op: &Unary, function: ActivationFunction) -> Result<(), LoweringError> {
    unary(ctx, op.input, op.output, Operator::Activation(function))
}

pub fn clamp(ctx: &mut LoweringContext, op: &Clamp) -> Result<(), LoweringError> {
    if op.min_value > op.max_value {
        return Err(ctx.invalid(format!(
            "The minimum value {} is greater than the maximum value {}.",
            op.min_value, op.max_value
        )));
    }
    let operator = Operator::Clip {
        min: op.min_value,
        max: op.max_value,
    };
    unary(ctx, op.input, op.output, operator)
}

pub fn elu(ctx: &mut LoweringContext, op: &Elu) -> Result<(), LoweringError> {
    let function = ActivationFunction::Elu { alpha: op.alpha };
    unary(ctx, op.input, op.output, Operator::Activation(function))
}

pub fn hard_sigmoid(ctx: &mut LoweringContext, op: &HardSigmoid) -> Result<(), LoweringError> {
    let function = ActivationFunction::HardSigmoid {
        alpha: op.alpha,
        beta: op.beta,
    };
    unary(ctx, op.input, op.output, Operator::Activation(function))
}

/// `x * clip(x / 6 + 0.5, 0, 1)`, composed from three nodes when the backend
/// has no native hard-swish.
pub fn hard_swish(ctx: &mut LoweringContext, op: &Unary) -> Result<(), LoweringError> {
    if ctx.feature_level().has_native_hard_swish() {
        return activation(ctx, op, ActivationFunction::HardSwish);
    }

    let (x, x_desc) = ctx.input(op.input)?;
    ctx.expect_output_dims(op.output, x_desc.dims())?;
    let output = ctx.operand_desc(op.output)?;
    let intermediate = TensorDescriptor::new(output.data_type(), output.dims());

    let scaled = ctx.add_node(
        Operator::Identity {
            scale_bias: Some(ScaleBias {
                scale: 1.0 / 6.0,
                bias: 0.5,
            }),
        },
        vec![Some((x, x_desc.clone()))],
        intermediate.clone(),
        None,
    )?;
    let clipped = ctx.add_node(
        Operator::Clip { min: 0.0, max: 1.0 },
        vec![Some((scaled, intermediate.clone()))],
        intermediate.clone(),
        None,
    )?;
    ctx.add_simple(
        Operator::Binary(BinaryFunction::Multiply),
        vec![(clipped, intermediate), (x, x_desc)],
        op.output,
    )
}

pub fn leaky_relu(ctx: &mut LoweringContext, op: &LeakyRelu) -> Result<(), LoweringError> {
    let function = ActivationFunction::LeakyRelu { alpha: op.alpha };
    unary(ctx, op.input, op.output, Operator::Activation(function))
}

pub fn linear(ctx: &mut LoweringContext, op: &Linear) -> Result<(), LoweringError> {
    let function = ActivationFunction::Linear {
        alpha: op.alpha,
        beta: op.beta,
    };
    unary(ctx, op.input, op.output, Operator::Activation(function))
}

pub fn softplus(ctx: &mut LoweringContext, op: &Softplus) -> Result<(), LoweringError> {
    let function = ctx.softplus(op.steepness)?;
    unary(ctx, op.input, op.output, Operator::Activation(function))
}

pub fn prelu(ctx: &mut LoweringContext, op: &Prelu) -> Result<(), LoweringError> {
    let output = ctx.operand_desc(op.output)?;
    let input = broadcast_input(ctx, op.input, output.dims())?;
    let slope = broadcast_input(ctx, op.slope, output.dims())?;
    ctx.add_simple(Operator::ParameterizedRelu, vec![input, slope], op.output)
}

pub fn where_(ctx: &mut LoweringContext, op: &Where) -> Result<(), LoweringError> {
    let output = ctx.operand_desc(op.output)?;
    let condition = broadcast_input(ctx, op.condition, output.dims())?;
    let true_value = broadcast_input(ctx, op.true_value, output.dims())?;
    let false_value = broadcast_input(ctx, op.false_value, output.dims())?;
    ctx.add_simple(Operator::If, vec![condition, true_value, false_value], op.output)
}
