//! Native operator graph.
//!
//! This is what a backend compiles: operator nodes with fully resolved tensor
//! descriptors, connected by edges to graph inputs, to each other and to graph
//! outputs. Nodes are addressed by their position in [`GraphDesc::nodes`].

pub mod builder;

use crate::shape::{display_comma, Array, TensorDescriptor, MAX_RANK};
use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScaleBias {
    pub scale: f32,
    pub bias: f32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ElementWiseFunction {
    Abs,
    Ceil,
    Cos,
    Erf,
    Exp,
    Floor,
    Log,
    LogicalNot,
    Negate,
    Reciprocal,
    Sin,
    Sqrt,
    Tan,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BinaryFunction {
    Add,
    Subtract,
    Multiply,
    Divide,
    Max,
    Min,
    Pow,
    Equals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ActivationFunction {
    Elu { alpha: f32 },
    HardSigmoid { alpha: f32, beta: f32 },
    HardSwish,
    LeakyRelu { alpha: f32 },
    Linear { alpha: f32, beta: f32 },
    Relu,
    Sigmoid,
    /// Normalizes over the last axis.
    Softmax,
    Softplus { steepness: f32 },
    Softsign,
    Tanh,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReduceFunction {
    L1,
    L2,
    LogSum,
    LogSumExp,
    Max,
    Average,
    Min,
    Multiply,
    Sum,
    SumSquare,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PaddingMode {
    Constant(f32),
    Edge,
    Reflection,
    Symmetric,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResampleMode {
    NearestNeighbor,
    Linear,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConvolutionDirection {
    Forward,
    Backward,
}

/// Which of several equal extrema an arg reduction reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AxisDirection {
    Increasing,
    Decreasing,
}

/// Spatial window over the two trailing axes of an NCHW tensor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Window2d {
    pub size: [u32; 2],
    pub strides: [u32; 2],
    pub dilations: [u32; 2],
    pub start_padding: [u32; 2],
    pub end_padding: [u32; 2],
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operator {
    Identity {
        scale_bias: Option<ScaleBias>,
    },
    ElementWise(ElementWiseFunction),
    Cast,
    Clip {
        min: f32,
        max: f32,
    },
    Binary(BinaryFunction),
    Activation(ActivationFunction),
    /// Inputs are the tensor and the slope.
    ParameterizedRelu,
    /// Inputs are the condition, the value where it holds and the value where it does not.
    If,
    Join {
        axis: u32,
    },
    Split {
        axis: u32,
    },
    Slice {
        offsets: Array,
        sizes: Array,
        strides: Array,
    },
    Padding {
        mode: PaddingMode,
        start: Array,
        end: Array,
    },
    /// Output rank is input rank - 1 + indices rank.
    Gather {
        axis: u32,
    },
    /// Inputs are A, B and an optional C, all of rank 4.
    Gemm {
        trans_a: bool,
        trans_b: bool,
        alpha: f32,
        beta: f32,
        fused: Option<ActivationFunction>,
    },
    /// Inputs are the NCHW input, the filter (OIHW, or IOHW when backward) and an optional bias.
    Convolution {
        direction: ConvolutionDirection,
        window: Window2d,
        groups: u32,
        fused: Option<ActivationFunction>,
    },
    AveragePooling {
        window: Window2d,
        include_padding: bool,
    },
    LpPooling {
        window: Window2d,
        p: u32,
    },
    MaxPooling {
        window: Window2d,
    },
    /// Reduced axes keep size 1 in the output.
    Reduce {
        function: ReduceFunction,
        axes: Array,
    },
    ArgMin {
        axes: Array,
        direction: AxisDirection,
    },
    ArgMax {
        axes: Array,
        direction: AxisDirection,
    },
    /// Inputs are the tensor, mean, variance, scale and bias, all viewed at the output shape.
    BatchNormalization {
        epsilon: f32,
        fused: Option<ActivationFunction>,
    },
    /// Inputs are the tensor and an optional scale and bias pair viewed at the output shape.
    MeanVarianceNormalization {
        axes: Array,
        epsilon: f32,
    },
    Resample {
        mode: ResampleMode,
        scales: SmallVec<[f32; 8]>,
    },
}

impl Operator {
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Identity { .. } => "identity",
            Operator::ElementWise(_) => "element_wise",
            Operator::Cast => "cast",
            Operator::Clip { .. } => "clip",
            Operator::Binary(_) => "binary",
            Operator::Activation(_) => "activation",
            Operator::ParameterizedRelu => "parameterized_relu",
            Operator::If => "if",
            Operator::Join { .. } => "join",
            Operator::Split { .. } => "split",
            Operator::Slice { .. } => "slice",
            Operator::Padding { .. } => "padding",
            Operator::Gather { .. } => "gather",
            Operator::Gemm { .. } => "gemm",
            Operator::Convolution { .. } => "convolution",
            Operator::AveragePooling { .. } => "average_pooling",
            Operator::LpPooling { .. } => "lp_pooling",
            Operator::MaxPooling { .. } => "max_pooling",
            Operator::Reduce { .. } => "reduce",
            Operator::ArgMin { .. } => "arg_min",
            Operator::ArgMax { .. } => "arg_max",
            Operator::BatchNormalization { .. } => "batch_normalization",
            Operator::MeanVarianceNormalization { .. } => "mean_variance_normalization",
            Operator::Resample { .. } => "resample",
        }
    }

    /// Input slots as (count, optional slot indices), `None` meaning variadic.
    fn input_arity(&self) -> (Option<usize>, &'static [usize]) {
        match self {
            Operator::Binary(_) | Operator::ParameterizedRelu | Operator::Gather { .. } => (Some(2), &[]),
            Operator::If => (Some(3), &[]),
            Operator::Join { .. } => (None, &[]),
            Operator::Gemm { .. } | Operator::Convolution { .. } => (Some(3), &[2]),
            Operator::BatchNormalization { .. } => (Some(5), &[]),
            Operator::MeanVarianceNormalization { .. } => (Some(3), &[1, 2]),
            _ => (Some(1), &[]),
        }
    }

    /// Whether every input and the output must share one shape.
    fn is_element_wise(&self) -> bool {
        matches!(
            self,
            Operator::Identity { .. }
                | Operator::ElementWise(_)
                | Operator::Cast
                | Operator::Clip { .. }
                | Operator::Binary(_)
                | Operator::Activation(_)
                | Operator::ParameterizedRelu
                | Operator::If
                | Operator::BatchNormalization { .. }
                | Operator::MeanVarianceNormalization { .. }
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum DescError {
    #[error("{operator} expects {expected} {what} but got {actual}")]
    Arity {
        operator: &'static str,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("input {index} of {operator} is required")]
    MissingInput { operator: &'static str, index: usize },

    #[error("{operator} tensors have rank {rank}, more than {}", MAX_RANK)]
    RankTooLarge { operator: &'static str, rank: usize },

    #[error("{operator} needs every tensor at [{}] but got [{}]", display_comma(.expected), display_comma(.actual))]
    ShapeMismatch {
        operator: &'static str,
        expected: Vec<u32>,
        actual: Vec<u32>,
    },
}

/// A native operator with the descriptors of its inputs and outputs.
///
/// Input slots are ordered as each [`Operator`] variant documents; `None`
/// marks an optional input that is not connected.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorDesc {
    pub operator: Operator,
    pub inputs: Vec<Option<TensorDescriptor>>,
    pub outputs: Vec<TensorDescriptor>,
}

impl OperatorDesc {
    pub fn new(operator: Operator, inputs: Vec<Option<TensorDescriptor>>, outputs: Vec<TensorDescriptor>) -> Self {
        OperatorDesc {
            operator,
            inputs,
            outputs,
        }
    }

    /// Shorthand for a node whose inputs are all connected.
    pub fn dense(operator: Operator, inputs: Vec<TensorDescriptor>, outputs: Vec<TensorDescriptor>) -> Self {
        Self::new(operator, inputs.into_iter().map(Some).collect(), outputs)
    }

    pub fn validate(&self) -> Result<(), DescError> {
        let operator = self.operator.name();
        let (count, optional) = self.operator.input_arity();
        match count {
            Some(expected) if expected != self.inputs.len() => {
                return Err(DescError::Arity {
                    operator,
                    what: "inputs",
                    expected,
                    actual: self.inputs.len(),
                })
            }
            None if self.inputs.is_empty() => {
                return Err(DescError::Arity {
                    operator,
                    what: "inputs",
                    expected: 1,
                    actual: 0,
                })
            }
            _ => (),
        }
        if let Some(index) = (0..self.inputs.len()).find(|i| self.inputs[*i].is_none() && !optional.contains(i)) {
            return Err(DescError::MissingInput { operator, index });
        }

        let expected_outputs = match self.operator {
            Operator::Split { .. } => self.outputs.len().max(1),
            _ => 1,
        };
        if self.outputs.len() != expected_outputs {
            return Err(DescError::Arity {
                operator,
                what: "outputs",
                expected: expected_outputs,
                actual: self.outputs.len(),
            });
        }

        let descs = self.inputs.iter().flatten().chain(self.outputs.iter());
        if let Some(rank) = descs.clone().map(|d| d.rank()).find(|&r| r > MAX_RANK) {
            return Err(DescError::RankTooLarge { operator, rank });
        }

        if self.operator.is_element_wise() {
            let expected = self.outputs[0].dims();
            if let Some(desc) = descs.clone().find(|d| d.dims() != expected) {
                return Err(DescError::ShapeMismatch {
                    operator,
                    expected: expected.to_vec(),
                    actual: desc.dims().to_vec(),
                });
            }
        }
        if let Operator::MeanVarianceNormalization { .. } = self.operator {
            if self.inputs[1].is_some() != self.inputs[2].is_some() {
                return Err(DescError::MissingInput {
                    operator,
                    index: if self.inputs[1].is_none() { 1 } else { 2 },
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InputEdge {
    pub graph_input_index: u32,
    pub to_node: u32,
    pub to_node_input_index: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IntermediateEdge {
    pub from_node: u32,
    pub from_node_output_index: u32,
    pub to_node: u32,
    pub to_node_input_index: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OutputEdge {
    pub from_node: u32,
    pub from_node_output_index: u32,
    pub graph_output_index: u32,
}

/// Finished operator graph, ready to be compiled.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphDesc {
    pub input_count: u32,
    pub output_count: u32,
    pub nodes: Vec<OperatorDesc>,
    pub input_edges: Vec<InputEdge>,
    pub intermediate_edges: Vec<IntermediateEdge>,
    pub output_edges: Vec<OutputEdge>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::DataType;

    fn desc(dims: &[u32]) -> TensorDescriptor {
        TensorDescriptor::new(DataType::Float32, dims)
    }

    #[test]
    fn test_validate_binary() {
        let op = OperatorDesc::dense(
            Operator::Binary(BinaryFunction::Add),
            vec![desc(&[2, 3]), desc(&[2, 3])],
            vec![desc(&[2, 3])],
        );
        assert_eq!(op.validate(), Ok(()));

        let op = OperatorDesc::dense(
            Operator::Binary(BinaryFunction::Add),
            vec![desc(&[2, 3]), desc(&[1, 3])],
            vec![desc(&[2, 3])],
        );
        assert_eq!(
            op.validate(),
            Err(DescError::ShapeMismatch {
                operator: "binary",
                expected: vec![2, 3],
                actual: vec![1, 3]
            })
        );

        let op = OperatorDesc::dense(Operator::Binary(BinaryFunction::Add), vec![desc(&[2])], vec![desc(&[2])]);
        assert!(matches!(op.validate(), Err(DescError::Arity { expected: 2, actual: 1, .. })));
    }

    #[test]
    fn test_validate_optional_inputs() {
        let gemm = Operator::Gemm {
            trans_a: false,
            trans_b: false,
            alpha: 1.0,
            beta: 0.0,
            fused: None,
        };
        let op = OperatorDesc::new(
            gemm.clone(),
            vec![Some(desc(&[1, 1, 2, 3])), Some(desc(&[1, 1, 3, 4])), None],
            vec![desc(&[1, 1, 2, 4])],
        );
        assert_eq!(op.validate(), Ok(()));

        let op = OperatorDesc::new(
            gemm,
            vec![Some(desc(&[1, 1, 2, 3])), None, None],
            vec![desc(&[1, 1, 2, 4])],
        );
        assert_eq!(
            op.validate(),
            Err(DescError::MissingInput {
                operator: "gemm",
                index: 1
            })
        );

        let mvn = Operator::MeanVarianceNormalization {
            axes: Array::from_slice(&[1]),
            epsilon: 1e-5,
        };
        let op = OperatorDesc::new(mvn, vec![Some(desc(&[2, 3])), Some(desc(&[2, 3])), None], vec![desc(&[2, 3])]);
        assert_eq!(
            op.validate(),
            Err(DescError::MissingInput {
                operator: "mean_variance_normalization",
                index: 2
            })
        );
    }

    #[test]
    fn test_validate_rank() {
        let dims = [1; 9];
        let op = OperatorDesc::dense(Operator::Cast, vec![desc(&dims)], vec![desc(&dims)]);
        assert_eq!(
            op.validate(),
            Err(DescError::RankTooLarge {
                operator: "cast",
                rank: 9
            })
        );
    }

    #[test]
    fn test_validate_split() {
        let op = OperatorDesc::dense(
            Operator::Split { axis: 0 },
            vec![desc(&[4, 2])],
            vec![desc(&[1, 2]), desc(&[3, 2])],
        );
        assert_eq!(op.validate(), Ok(()));

        let op = OperatorDesc::dense(Operator::Split { axis: 0 }, vec![desc(&[4, 2])], vec![]);
        assert!(op.validate().is_err());
    }
}
