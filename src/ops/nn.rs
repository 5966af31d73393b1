//! Normalizations.

use crate::graph::ops::{BatchNormalization, InputOperandLayout, InstanceNormalization, LayerNormalization};
use crate::graph::OperandId;
use crate::ir::builder::NodeOutputId;
use crate::ir::Operator;
use crate::ops::{LoweringContext, LoweringError};
use crate::shape::{display_comma, Array, TensorDescriptor};

/// Views a per-axis parameter (mean, scale, ...) at the full input shape.
///
/// The parameter has one dimension per entry of `axes`, each equal to the
/// input's size on that axis or 1.
fn parameter_view(
    ctx: &LoweringContext,
    id: OperandId,
    axes: &[u32],
    input: &[u32],
) -> Result<(NodeOutputId, TensorDescriptor), LoweringError> {
    let (node_output, mut desc) = ctx.input(id)?;
    let fits = desc.rank() == axes.len()
        && desc
            .dims()
            .iter()
            .zip(axes)
            .all(|(&d, &axis)| input.get(axis as usize).map_or(false, |&i| d == i || d == 1));
    if !fits {
        return Err(ctx.invalid(format!(
            "a parameter of shape [{}] does not fit axes [{}] of [{}]",
            display_comma(desc.dims()),
            display_comma(axes),
            display_comma(input)
        )));
    }
    desc.make_broadcast_compatible(input.len(), axes);
    desc.broadcast_to(input);
    Ok((node_output, desc))
}

fn optional_parameter(
    ctx: &LoweringContext,
    id: Option<OperandId>,
    axes: &[u32],
    input: &[u32],
) -> Result<Option<(NodeOutputId, TensorDescriptor)>, LoweringError> {
    id.map(|id| parameter_view(ctx, id, axes, input)).transpose()
}

fn check_axes(ctx: &LoweringContext, axes: &[u32], rank: usize) -> Result<(), LoweringError> {
    for (i, &axis) in axes.iter().enumerate() {
        if axis as usize >= rank || axes[..i].contains(&axis) {
            return Err(ctx.invalid(format!(
                "[{}] are not distinct axes of a tensor of rank {}",
                display_comma(axes),
                rank
            )));
        }
    }
    Ok(())
}

/// Expects the scale and bias to be present; missing ones are materialized
/// as constants before lowering.
pub fn batch_normalization(ctx: &mut LoweringContext, op: &BatchNormalization) -> Result<(), LoweringError> {
    let input = ctx.input(op.input)?;
    let dims: Array = Array::from_slice(input.1.dims());
    let axes = [op.axis];
    check_axes(ctx, &axes, dims.len())?;
    ctx.expect_output_dims(op.output, &dims)?;
    let (scale, bias) = match (op.scale, op.bias) {
        (Some(scale), Some(bias)) => (scale, bias),
        _ => return Err(ctx.invalid("batch normalization needs a scale and a bias")),
    };

    let inputs = vec![
        input,
        parameter_view(ctx, op.mean, &axes, &dims)?,
        parameter_view(ctx, op.variance, &axes, &dims)?,
        parameter_view(ctx, scale, &axes, &dims)?,
        parameter_view(ctx, bias, &axes, &dims)?,
    ];
    let operator = Operator::BatchNormalization {
        epsilon: op.epsilon,
        fused: ctx.fused_activation(op.activation)?,
    };
    ctx.add_simple(operator, inputs, op.output)
}

pub fn instance_normalization(ctx: &mut LoweringContext, op: &InstanceNormalization) -> Result<(), LoweringError> {
    let input = ctx.input(op.input)?;
    let dims: Array = Array::from_slice(input.1.dims());
    if dims.len() != 4 {
        return Err(ctx.invalid(format!(
            "instance normalization takes a 4-D input but got [{}]",
            display_comma(&dims)
        )));
    }
    ctx.expect_output_dims(op.output, &dims)?;
    let (axes, channel) = match op.layout {
        InputOperandLayout::ChannelsFirst => ([2, 3], 1),
        InputOperandLayout::ChannelsLast => ([1, 2], 3),
    };

    let scale = optional_parameter(ctx, op.scale, &[channel], &dims)?;
    let bias = optional_parameter(ctx, op.bias, &[channel], &dims)?;
    let operator = Operator::MeanVarianceNormalization {
        axes: Array::from_slice(&axes),
        epsilon: op.epsilon,
    };
    let output = ctx.operand_desc(op.output)?;
    let node_output = ctx.add_node(operator, vec![Some(input), scale, bias], output, None)?;
    ctx.bind(op.output, node_output);
    Ok(())
}

pub fn layer_normalization(ctx: &mut LoweringContext, op: &LayerNormalization) -> Result<(), LoweringError> {
    let input = ctx.input(op.input)?;
    let dims: Array = Array::from_slice(input.1.dims());
    check_axes(ctx, &op.axes, dims.len())?;
    ctx.expect_output_dims(op.output, &dims)?;

    let scale = optional_parameter(ctx, op.scale, &op.axes, &dims)?;
    let bias = optional_parameter(ctx, op.bias, &op.axes, &dims)?;
    let operator = Operator::MeanVarianceNormalization {
        axes: Array::from_slice(&op.axes),
        epsilon: op.epsilon,
    };
    let output = ctx.operand_desc(op.output)?;
    let node_output = ctx.add_node(operator, vec![Some(input), scale, bias], output, None)?;
    ctx.bind(op.output, node_output);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendCapabilities;
    use crate::graph::ops::{Activation, Operation};
    use crate::graph::{materialize_defaults, GraphInfo};
    use crate::ops::{lower_graph, LoweredGraph, LoweringErrorKind};
    use crate::shape::DataType;

    fn lower(graph: &GraphInfo) -> Result<LoweredGraph, LoweringError> {
        lower_graph(graph, &BackendCapabilities::default())
    }

    #[test]
    fn test_batch_normalization_views() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[2, 3, 4]);
        let mean = graph.add_input("mean", DataType::Float32, &[3]);
        let variance = graph.add_input("variance", DataType::Float32, &[3]);
        let y = graph.add_output("y", DataType::Float32, &[2, 3, 4]);
        graph.push(Operation::BatchNormalization(BatchNormalization {
            input: x,
            mean,
            variance,
            scale: None,
            bias: None,
            output: y,
            axis: 1,
            epsilon: 1e-5,
            activation: Some(Activation::Relu),
        }));
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);

        materialize_defaults(&mut graph).unwrap();
        let lowered = lower(&graph).unwrap();
        assert_eq!(lowered.binding_info.constants.len(), 2);
        let node = &lowered.desc.nodes[0];
        let mean = node.inputs[1].as_ref().unwrap();
        assert_eq!((mean.dims(), mean.strides()), (&[2, 3, 4][..], &[0, 1, 0][..]));
        let scale = node.inputs[3].as_ref().unwrap();
        assert_eq!((scale.dims(), scale.strides()), (&[2, 3, 4][..], &[0, 0, 0][..]));
    }

    #[test]
    fn test_batch_normalization_parameter_shape() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[2, 3]);
        let mean = graph.add_input("mean", DataType::Float32, &[2]);
        let variance = graph.add_input("variance", DataType::Float32, &[3]);
        let y = graph.add_output("y", DataType::Float32, &[2, 3]);
        graph.push(Operation::BatchNormalization(BatchNormalization {
            input: x,
            mean,
            variance,
            scale: None,
            bias: None,
            output: y,
            axis: 1,
            epsilon: 1e-5,
            activation: None,
        }));
        materialize_defaults(&mut graph).unwrap();
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);
    }

    #[test]
    fn test_instance_normalization_layouts() {
        let lowered_axes = |layout| {
            let mut graph = GraphInfo::new();
            let x = graph.add_input("x", DataType::Float32, &[1, 2, 3, 4]);
            let scale = graph.add_input("scale", DataType::Float32, &[4]);
            let bias = graph.add_input("bias", DataType::Float32, &[4]);
            let y = graph.add_output("y", DataType::Float32, &[1, 2, 3, 4]);
            graph.push(Operation::InstanceNormalization(InstanceNormalization {
                input: x,
                scale: Some(scale),
                bias: Some(bias),
                output: y,
                epsilon: 1e-5,
                layout,
            }));
            lower(&graph).map(|lowered| lowered.desc.nodes[0].clone())
        };

        // a scale of 4 only fits the channel axis of NHWC
        assert!(lowered_axes(InputOperandLayout::ChannelsFirst).is_err());
        let node = lowered_axes(InputOperandLayout::ChannelsLast).unwrap();
        assert_eq!(
            node.operator,
            Operator::MeanVarianceNormalization {
                axes: Array::from_slice(&[1, 2]),
                epsilon: 1e-5,
            }
        );
        assert_eq!(node.inputs[1].as_ref().unwrap().strides(), &[0, 0, 0, 1]);
    }

    #[test]
    fn test_layer_normalization_without_parameters() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[2, 3, 4]);
        let y = graph.add_output("y", DataType::Float32, &[2, 3, 4]);
        graph.push(Operation::LayerNormalization(LayerNormalization {
            input: x,
            scale: None,
            bias: None,
            output: y,
            axes: vec![1, 2],
            epsilon: 1e-5,
        }));
        materialize_defaults(&mut graph).unwrap();
        let lowered = lower(&graph).unwrap();
        let node = &lowered.desc.nodes[0];
        assert!(node.inputs[1].is_none() && node.inputs[2].is_none());

        graph.operations[0] = Operation::LayerNormalization(LayerNormalization {
            input: x,
            scale: None,
            bias: None,
            output: y,
            axes: vec![2, 2],
            epsilon: 1e-5,
        });
        assert_eq!(lower(&graph).unwrap_err().kind, LoweringErrorKind::InvalidAttribute);
    }
}
