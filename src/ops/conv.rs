//! Spatial operations over the two trailing axes of an NCHW view.

use crate::graph::ops::{
    Conv2d, Conv2dKind, FilterLayout, InputOperandLayout, Padding2d, Pool2d, Pool2dKind, Resample2d, Size2d,
    InterpolationMode,
};
use crate::ir::{ConvolutionDirection, Operator, ResampleMode, Window2d};
use crate::ops::{LoweringContext, LoweringError, LoweringErrorKind};
use crate::shape::{display_comma, Array, TensorDescriptor};
use smallvec::SmallVec;

const CHANNELS_LAST_TO_FIRST: [u32; 4] = [0, 3, 1, 2];

/// Views an NHWC tensor as NCHW; NCHW descriptors are left alone.
fn to_channels_first(desc: &mut TensorDescriptor, layout: InputOperandLayout) {
    if layout == InputOperandLayout::ChannelsLast {
        desc.transpose(&CHANNELS_LAST_TO_FIRST);
    }
}

/// Permutation that views a filter stored in `layout` in `target` axis order.
fn filter_permutation(layout: FilterLayout, target: &str) -> Array {
    let axes = layout.axes();
    target
        .chars()
        .map(|axis| axes.find(axis).map_or(0, |position| position as u32))
        .collect()
}

fn window(size: [u32; 2], strides: Size2d, dilations: Size2d, padding: Padding2d) -> Window2d {
    Window2d {
        size,
        strides: [strides.height, strides.width],
        dilations: [dilations.height, dilations.width],
        start_padding: [padding.beginning.height, padding.beginning.width],
        end_padding: [padding.ending.height, padding.ending.width],
    }
}

fn check_rank(ctx: &LoweringContext, what: &str, desc: &TensorDescriptor) -> Result<(), LoweringError> {
    if desc.rank() != 4 {
        return Err(ctx.invalid(format!(
            "The {} must be 4-D but has shape [{}].",
            what,
            display_comma(desc.dims())
        )));
    }
    Ok(())
}

fn check_window(ctx: &LoweringContext, strides: Size2d, dilations: Size2d) -> Result<(), LoweringError> {
    if [strides.height, strides.width, dilations.height, dilations.width].contains(&0) {
        return Err(ctx.invalid("Strides and dilations must be positive."));
    }
    Ok(())
}

pub fn conv2d(ctx: &mut LoweringContext, op: &Conv2d) -> Result<(), LoweringError> {
    let (input, mut input_desc) = ctx.input(op.input)?;
    let (filter, mut filter_desc) = ctx.input(op.filter)?;
    let output = ctx.operand_desc(op.output)?;
    check_rank(ctx, "input", &input_desc)?;
    check_rank(ctx, "filter", &filter_desc)?;
    check_rank(ctx, "output", &output)?;
    check_window(ctx, op.strides, op.dilations)?;

    to_channels_first(&mut input_desc, op.input_layout);
    let mut output_view = output.clone();
    to_channels_first(&mut output_view, op.input_layout);
    let (direction, filter_order) = match op.kind {
        Conv2dKind::Direct => (ConvolutionDirection::Forward, "oihw"),
        Conv2dKind::Transposed => (ConvolutionDirection::Backward, "iohw"),
    };
    filter_desc.transpose(&filter_permutation(op.filter_layout(), filter_order));

    let groups = op.groups;
    let channels = input_desc.dims()[1];
    let out_channels = output_view.dims()[1];
    if groups == 0 || channels % groups != 0 || out_channels % groups != 0 {
        return Err(ctx.invalid(format!(
            "{} input and {} output channels cannot be split into {} groups.",
            channels, out_channels, groups
        )));
    }
    let filter_dims = filter_desc.dims();
    let filter_matches = match op.kind {
        Conv2dKind::Direct => filter_dims[0] == out_channels && filter_dims[1] * groups == channels,
        Conv2dKind::Transposed => filter_dims[0] == channels && filter_dims[1] * groups == out_channels,
    };
    if !filter_matches {
        return Err(ctx.invalid(format!(
            "The filter [{}] does not fit {} input and {} output channels.",
            display_comma(filter_dims),
            channels,
            out_channels
        )));
    }
    let size = [filter_dims[2], filter_dims[3]];

    let bias = match op.bias {
        Some(id) => {
            let (bias, mut desc) = ctx.input(id)?;
            if desc.dims() != [out_channels] {
                return Err(ctx.invalid(format!(
                    "The bias must have shape [{}] but has [{}].",
                    out_channels,
                    display_comma(desc.dims())
                )));
            }
            desc.make_broadcast_compatible(4, &[1]);
            Some((bias, desc))
        }
        None => None,
    };

    let operator = Operator::Convolution {
        direction,
        window: window(size, op.strides, op.dilations, op.padding),
        groups,
        fused: ctx.fused_activation(op.activation)?,
    };
    let node_output = ctx.add_node(
        operator,
        vec![Some((input, input_desc)), Some((filter, filter_desc)), bias],
        output_view,
        Some(output),
    )?;
    ctx.bind(op.output, node_output);
    Ok(())
}

pub fn pool2d(ctx: &mut LoweringContext, op: &Pool2d) -> Result<(), LoweringError> {
    let (input, mut input_desc) = ctx.input(op.input)?;
    let output = ctx.operand_desc(op.output)?;
    check_rank(ctx, "input", &input_desc)?;
    check_rank(ctx, "output", &output)?;
    check_window(ctx, op.strides, op.dilations)?;
    to_channels_first(&mut input_desc, op.layout);
    let mut output_view = output.clone();
    to_channels_first(&mut output_view, op.layout);

    let size = [op.window_dimensions.height, op.window_dimensions.width];
    let window = window(size, op.strides, op.dilations, op.padding);
    let operator = match op.kind {
        Pool2dKind::Average if op.dilations != Size2d::new(1, 1) => {
            return Err(LoweringError {
                kind: LoweringErrorKind::NotSupported,
                operation: ctx.operation(),
                message: "Average pooling does not support dilations.".to_string(),
            })
        }
        Pool2dKind::Average => Operator::AveragePooling {
            window,
            include_padding: false,
        },
        Pool2dKind::L2 => Operator::LpPooling { window, p: 2 },
        Pool2dKind::Max => Operator::MaxPooling { window },
    };
    let node_output = ctx.add_node(operator, vec![Some((input, input_desc))], output_view, Some(output))?;
    ctx.bind(op.output, node_output);
    Ok(())
}

/// Resamples a 4-D tensor along two of its axes; the other axes keep scale 1.
pub fn resample2d(ctx: &mut LoweringContext, op: &Resample2d) -> Result<(), LoweringError> {
    let input = ctx.input(op.input)?;
    let output = ctx.operand_desc(op.output)?;
    check_rank(ctx, "input", &input.1)?;
    check_rank(ctx, "output", &output)?;
    if op.axes.len() != 2 || op.axes.iter().any(|&a| a >= 4) || op.axes[0] == op.axes[1] {
        return Err(ctx.invalid(format!("[{}] are not two distinct axes of a 4-D tensor.", display_comma(&op.axes))));
    }

    let mut scales: SmallVec<[f32; 8]> = SmallVec::from_elem(1.0, 4);
    for (i, &axis) in op.axes.iter().enumerate() {
        let axis = axis as usize;
        scales[axis] = match &op.scales {
            Some(given) => *given
                .get(i)
                .ok_or_else(|| ctx.invalid("There must be one scale per axis."))?,
            None => output.dims()[axis] as f32 / input.1.dims()[axis] as f32,
        };
        if !(scales[axis] > 0.0) {
            return Err(ctx.invalid(format!("The scale {} must be positive.", scales[axis])));
        }
    }
    for axis in (0..4).filter(|a| !op.axes.contains(&(*a as u32))) {
        if input.1.dims()[axis] != output.dims()[axis] {
            return Err(ctx.invalid(format!("Axis {} is not resampled but changes size.", axis)));
        }
    }

    let mode = match op.mode {
        InterpolationMode::NearestNeighbor => ResampleMode::NearestNeighbor,
        InterpolationMode::Linear => ResampleMode::Linear,
    };
    ctx.add_simple(Operator::Resample { mode, scales }, vec![input], op.output)
}
