use crate::graph::OperandId;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::fmt;

pub type OperandIds = SmallVec<[OperandId; 4]>;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputOperandLayout {
    #[default]
    #[serde(alias = "nchw")]
    ChannelsFirst,
    #[serde(alias = "nhwc")]
    ChannelsLast,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Size2d {
    pub height: u32,
    pub width: u32,
}

impl Size2d {
    pub fn new(height: u32, width: u32) -> Self {
        Size2d { height, width }
    }
}

impl Default for Size2d {
    fn default() -> Self {
        Size2d::new(1, 1)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Padding2d {
    pub beginning: Size2d,
    pub ending: Size2d,
}

impl Default for Padding2d {
    fn default() -> Self {
        Padding2d {
            beginning: Size2d::new(0, 0),
            ending: Size2d::new(0, 0),
        }
    }
}

/// Activation fused into a convolution or batch normalization.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activation {
    Clamp { min_value: f32, max_value: f32 },
    Elu { alpha: f32 },
    Gelu,
    HardSigmoid { alpha: f32, beta: f32 },
    HardSwish,
    LeakyRelu { alpha: f32 },
    Linear { alpha: f32, beta: f32 },
    Relu,
    Sigmoid,
    Softplus { steepness: f32 },
    Softsign,
    Tanh,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgMinMaxKind {
    Min,
    Max,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArgMinMax {
    pub kind: ArgMinMaxKind,
    pub input: OperandId,
    pub output: OperandId,
    pub axes: Vec<u32>,
    #[serde(default)]
    pub keep_dimensions: bool,
    #[serde(default)]
    pub select_last_index: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNormalization {
    pub input: OperandId,
    pub mean: OperandId,
    pub variance: OperandId,
    #[serde(default)]
    pub scale: Option<OperandId>,
    #[serde(default)]
    pub bias: Option<OperandId>,
    pub output: OperandId,
    pub axis: u32,
    pub epsilon: f32,
    #[serde(default)]
    pub activation: Option<Activation>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Clamp {
    pub input: OperandId,
    pub output: OperandId,
    pub min_value: f32,
    pub max_value: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Concat {
    pub inputs: Vec<OperandId>,
    pub output: OperandId,
    pub axis: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conv2dKind {
    #[default]
    Direct,
    Transposed,
}

/// Axis order of a convolution filter; `o` and `i` are the output and input
/// channels of the operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterLayout {
    Oihw,
    Hwio,
    Ohwi,
    Ihwo,
    Iohw,
}

impl FilterLayout {
    pub fn axes(self) -> &'static str {
        match self {
            FilterLayout::Oihw => "oihw",
            FilterLayout::Hwio => "hwio",
            FilterLayout::Ohwi => "ohwi",
            FilterLayout::Ihwo => "ihwo",
            FilterLayout::Iohw => "iohw",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conv2d {
    #[serde(default)]
    pub kind: Conv2dKind,
    pub input: OperandId,
    pub filter: OperandId,
    #[serde(default)]
    pub bias: Option<OperandId>,
    pub output: OperandId,
    #[serde(default)]
    pub strides: Size2d,
    #[serde(default)]
    pub dilations: Size2d,
    #[serde(default)]
    pub padding: Padding2d,
    #[serde(default = "one")]
    pub groups: u32,
    #[serde(default)]
    pub input_layout: InputOperandLayout,
    /// Defaults to `oihw` for direct and `iohw` for transposed convolution.
    #[serde(default)]
    pub filter_layout: Option<FilterLayout>,
    #[serde(default)]
    pub activation: Option<Activation>,
}

impl Conv2d {
    pub fn filter_layout(&self) -> FilterLayout {
        self.filter_layout.unwrap_or(match self.kind {
            Conv2dKind::Direct => FilterLayout::Oihw,
            Conv2dKind::Transposed => FilterLayout::Iohw,
        })
    }
}

fn one() -> u32 {
    1
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryKind {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Pow,
    Equal,
    Greater,
    GreaterOrEqual,
    Lesser,
    LesserOrEqual,
}

impl BinaryKind {
    pub fn is_logical(self) -> bool {
        matches!(
            self,
            BinaryKind::Equal
                | BinaryKind::Greater
                | BinaryKind::GreaterOrEqual
                | BinaryKind::Lesser
                | BinaryKind::LesserOrEqual
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementWiseBinary {
    pub kind: BinaryKind,
    pub lhs: OperandId,
    pub rhs: OperandId,
    pub output: OperandId,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryKind {
    Abs,
    Ceil,
    Cos,
    Exp,
    Floor,
    Log,
    Neg,
    Sin,
    Tan,
    LogicalNot,
    Identity,
    Sqrt,
    Erf,
    Reciprocal,
    Cast,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementWiseUnary {
    pub kind: UnaryKind,
    pub input: OperandId,
    pub output: OperandId,
}

/// Operations that take one input, one output and no attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Unary {
    pub input: OperandId,
    pub output: OperandId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Elu {
    pub input: OperandId,
    pub output: OperandId,
    pub alpha: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gather {
    pub input: OperandId,
    pub indices: OperandId,
    pub output: OperandId,
    #[serde(default)]
    pub axis: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gemm {
    pub a: OperandId,
    pub b: OperandId,
    #[serde(default)]
    pub c: Option<OperandId>,
    pub output: OperandId,
    pub alpha: f32,
    pub beta: f32,
    #[serde(default)]
    pub a_transpose: bool,
    #[serde(default)]
    pub b_transpose: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HardSigmoid {
    pub input: OperandId,
    pub output: OperandId,
    pub alpha: f32,
    pub beta: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceNormalization {
    pub input: OperandId,
    #[serde(default)]
    pub scale: Option<OperandId>,
    #[serde(default)]
    pub bias: Option<OperandId>,
    pub output: OperandId,
    pub epsilon: f32,
    #[serde(default)]
    pub layout: InputOperandLayout,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerNormalization {
    pub input: OperandId,
    #[serde(default)]
    pub scale: Option<OperandId>,
    #[serde(default)]
    pub bias: Option<OperandId>,
    pub output: OperandId,
    pub axes: Vec<u32>,
    pub epsilon: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeakyRelu {
    pub input: OperandId,
    pub output: OperandId,
    pub alpha: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    pub input: OperandId,
    pub output: OperandId,
    pub alpha: f32,
    pub beta: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Matmul {
    pub a: OperandId,
    pub b: OperandId,
    pub output: OperandId,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaddingMode {
    Constant { value: f32 },
    Edge,
    Reflection,
    Symmetric,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pad {
    pub input: OperandId,
    pub output: OperandId,
    pub beginning_padding: Vec<u32>,
    pub ending_padding: Vec<u32>,
    pub mode: PaddingMode,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pool2dKind {
    Average,
    L2,
    Max,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pool2d {
    pub kind: Pool2dKind,
    pub input: OperandId,
    pub output: OperandId,
    pub window_dimensions: Size2d,
    #[serde(default)]
    pub strides: Size2d,
    #[serde(default)]
    pub dilations: Size2d,
    #[serde(default)]
    pub padding: Padding2d,
    #[serde(default)]
    pub layout: InputOperandLayout,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prelu {
    pub input: OperandId,
    pub slope: OperandId,
    pub output: OperandId,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceKind {
    L1,
    L2,
    LogSum,
    LogSumExp,
    Max,
    Mean,
    Min,
    Product,
    Sum,
    SumSquare,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reduce {
    pub kind: ReduceKind,
    pub input: OperandId,
    pub output: OperandId,
    pub axes: Vec<u32>,
    #[serde(default)]
    pub keep_dimensions: bool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpolationMode {
    #[default]
    NearestNeighbor,
    Linear,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resample2d {
    pub input: OperandId,
    pub output: OperandId,
    #[serde(default)]
    pub mode: InterpolationMode,
    /// Scales for `axes`; derived from the output size when absent.
    #[serde(default)]
    pub scales: Option<Vec<f32>>,
    pub axes: Vec<u32>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StartAndSize {
    pub start: u32,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    pub input: OperandId,
    pub output: OperandId,
    pub starts_and_sizes: Vec<StartAndSize>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Softplus {
    pub input: OperandId,
    pub output: OperandId,
    pub steepness: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub input: OperandId,
    pub outputs: Vec<OperandId>,
    pub axis: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transpose {
    pub input: OperandId,
    pub output: OperandId,
    pub permutation: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Triangular {
    pub input: OperandId,
    pub output: OperandId,
    #[serde(default)]
    pub upper: bool,
    #[serde(default)]
    pub diagonal: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Where {
    pub condition: OperandId,
    pub true_value: OperandId,
    pub false_value: OperandId,
    pub output: OperandId,
}

/// One node of a portable graph description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    ArgMinMax(ArgMinMax),
    BatchNormalization(BatchNormalization),
    Clamp(Clamp),
    Concat(Concat),
    Conv2d(Conv2d),
    ElementWiseBinary(ElementWiseBinary),
    ElementWiseUnary(ElementWiseUnary),
    Elu(Elu),
    Expand(Unary),
    Gather(Gather),
    Gelu(Unary),
    Gemm(Gemm),
    HardSigmoid(HardSigmoid),
    HardSwish(Unary),
    InstanceNormalization(InstanceNormalization),
    LayerNormalization(LayerNormalization),
    LeakyRelu(LeakyRelu),
    Linear(Linear),
    Matmul(Matmul),
    Pad(Pad),
    Pool2d(Pool2d),
    Prelu(Prelu),
    Reduce(Reduce),
    Relu(Unary),
    Resample2d(Resample2d),
    Reshape(Unary),
    Sigmoid(Unary),
    Slice(Slice),
    Softmax(Unary),
    Softplus(Softplus),
    Softsign(Unary),
    Split(Split),
    Tanh(Unary),
    Transpose(Transpose),
    Triangular(Triangular),
    Where(Where),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum OperationKind {
    ArgMinMax,
    BatchNormalization,
    Clamp,
    Concat,
    Conv2d,
    ElementWiseBinary,
    ElementWiseUnary,
    Elu,
    Expand,
    Gather,
    Gelu,
    Gemm,
    HardSigmoid,
    HardSwish,
    InstanceNormalization,
    LayerNormalization,
    LeakyRelu,
    Linear,
    Matmul,
    Pad,
    Pool2d,
    Prelu,
    Reduce,
    Relu,
    Resample2d,
    Reshape,
    Sigmoid,
    Slice,
    Softmax,
    Softplus,
    Softsign,
    Split,
    Tanh,
    Transpose,
    Triangular,
    Where,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::ArgMinMax => "argMinMax",
            OperationKind::BatchNormalization => "batchNormalization",
            OperationKind::Clamp => "clamp",
            OperationKind::Concat => "concat",
            OperationKind::Conv2d => "conv2d",
            OperationKind::ElementWiseBinary => "elementWiseBinary",
            OperationKind::ElementWiseUnary => "elementWiseUnary",
            OperationKind::Elu => "elu",
            OperationKind::Expand => "expand",
            OperationKind::Gather => "gather",
            OperationKind::Gelu => "gelu",
            OperationKind::Gemm => "gemm",
            OperationKind::HardSigmoid => "hardSigmoid",
            OperationKind::HardSwish => "hardSwish",
            OperationKind::InstanceNormalization => "instanceNormalization",
            OperationKind::LayerNormalization => "layerNormalization",
            OperationKind::LeakyRelu => "leakyRelu",
            OperationKind::Linear => "linear",
            OperationKind::Matmul => "matmul",
            OperationKind::Pad => "pad",
            OperationKind::Pool2d => "pool2d",
            OperationKind::Prelu => "prelu",
            OperationKind::Reduce => "reduce",
            OperationKind::Relu => "relu",
            OperationKind::Resample2d => "resample2d",
            OperationKind::Reshape => "reshape",
            OperationKind::Sigmoid => "sigmoid",
            OperationKind::Slice => "slice",
            OperationKind::Softmax => "softmax",
            OperationKind::Softplus => "softplus",
            OperationKind::Softsign => "softsign",
            OperationKind::Split => "split",
            OperationKind::Tanh => "tanh",
            OperationKind::Transpose => "transpose",
            OperationKind::Triangular => "triangular",
            OperationKind::Where => "where",
        };
        f.write_str(name)
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::ArgMinMax(_) => OperationKind::ArgMinMax,
            Operation::BatchNormalization(_) => OperationKind::BatchNormalization,
            Operation::Clamp(_) => OperationKind::Clamp,
            Operation::Concat(_) => OperationKind::Concat,
            Operation::Conv2d(_) => OperationKind::Conv2d,
            Operation::ElementWiseBinary(_) => OperationKind::ElementWiseBinary,
            Operation::ElementWiseUnary(_) => OperationKind::ElementWiseUnary,
            Operation::Elu(_) => OperationKind::Elu,
            Operation::Expand(_) => OperationKind::Expand,
            Operation::Gather(_) => OperationKind::Gather,
            Operation::Gelu(_) => OperationKind::Gelu,
            Operation::Gemm(_) => OperationKind::Gemm,
            Operation::HardSigmoid(_) => OperationKind::HardSigmoid,
            Operation::HardSwish(_) => OperationKind::HardSwish,
            Operation::InstanceNormalization(_) => OperationKind::InstanceNormalization,
            Operation::LayerNormalization(_) => OperationKind::LayerNormalization,
            Operation::LeakyRelu(_) => OperationKind::LeakyRelu,
            Operation::Linear(_) => OperationKind::Linear,
            Operation::Matmul(_) => OperationKind::Matmul,
            Operation::Pad(_) => OperationKind::Pad,
            Operation::Pool2d(_) => OperationKind::Pool2d,
            Operation::Prelu(_) => OperationKind::Prelu,
            Operation::Reduce(_) => OperationKind::Reduce,
            Operation::Relu(_) => OperationKind::Relu,
            Operation::Resample2d(_) => OperationKind::Resample2d,
            Operation::Reshape(_) => OperationKind::Reshape,
            Operation::Sigmoid(_) => OperationKind::Sigmoid,
            Operation::Slice(_) => OperationKind::Slice,
            Operation::Softmax(_) => OperationKind::Softmax,
            Operation::Softplus(_) => OperationKind::Softplus,
            Operation::Softsign(_) => OperationKind::Softsign,
            Operation::Split(_) => OperationKind::Split,
            Operation::Tanh(_) => OperationKind::Tanh,
            Operation::Transpose(_) => OperationKind::Transpose,
            Operation::Triangular(_) => OperationKind::Triangular,
            Operation::Where(_) => OperationKind::Where,
        }
    }

    /// Operand ids read by this operation, in argument order.
    pub fn inputs(&self) -> OperandIds {
        match self {
            Operation::ArgMinMax(op) => smallvec![op.input],
            Operation::BatchNormalization(op) => {
                let mut ids: OperandIds = smallvec![op.input, op.mean, op.variance];
                ids.extend(op.scale);
                ids.extend(op.bias);
                ids
            }
            Operation::Clamp(op) => smallvec![op.input],
            Operation::Concat(op) => op.inputs.iter().copied().collect(),
            Operation::Conv2d(op) => {
                let mut ids: OperandIds = smallvec![op.input, op.filter];
                ids.extend(op.bias);
                ids
            }
            Operation::ElementWiseBinary(op) => smallvec![op.lhs, op.rhs],
            Operation::ElementWiseUnary(op) => smallvec![op.input],
            Operation::Elu(op) => smallvec![op.input],
            Operation::Gather(op) => smallvec![op.input, op.indices],
            Operation::Gemm(op) => {
                let mut ids: OperandIds = smallvec![op.a, op.b];
                ids.extend(op.c);
                ids
            }
            Operation::HardSigmoid(op) => smallvec![op.input],
            Operation::InstanceNormalization(op) => {
                let mut ids: OperandIds = smallvec![op.input];
                ids.extend(op.scale);
                ids.extend(op.bias);
                ids
            }
            Operation::LayerNormalization(op) => {
                let mut ids: OperandIds = smallvec![op.input];
                ids.extend(op.scale);
                ids.extend(op.bias);
                ids
            }
            Operation::LeakyRelu(op) => smallvec![op.input],
            Operation::Linear(op) => smallvec![op.input],
            Operation::Matmul(op) => smallvec![op.a, op.b],
            Operation::Pad(op) => smallvec![op.input],
            Operation::Pool2d(op) => smallvec![op.input],
            Operation::Prelu(op) => smallvec![op.input, op.slope],
            Operation::Reduce(op) => smallvec![op.input],
            Operation::Resample2d(op) => smallvec![op.input],
            Operation::Slice(op) => smallvec![op.input],
            Operation::Softplus(op) => smallvec![op.input],
            Operation::Split(op) => smallvec![op.input],
            Operation::Transpose(op) => smallvec![op.input],
            Operation::Triangular(op) => smallvec![op.input],
            Operation::Where(op) => smallvec![op.condition, op.true_value, op.false_value],
            Operation::Expand(op)
            | Operation::Gelu(op)
            | Operation::HardSwish(op)
            | Operation::Relu(op)
            | Operation::Reshape(op)
            | Operation::Sigmoid(op)
            | Operation::Softmax(op)
            | Operation::Softsign(op)
            | Operation::Tanh(op) => smallvec![op.input],
        }
    }

    /// Operand ids produced by this operation.
    pub fn outputs(&self) -> OperandIds {
        match self {
            Operation::ArgMinMax(op) => smallvec![op.output],
            Operation::BatchNormalization(op) => smallvec![op.output],
            Operation::Clamp(op) => smallvec![op.output],
            Operation::Concat(op) => smallvec![op.output],
            Operation::Conv2d(op) => smallvec![op.output],
            Operation::ElementWiseBinary(op) => smallvec![op.output],
            Operation::ElementWiseUnary(op) => smallvec![op.output],
            Operation::Elu(op) => smallvec![op.output],
            Operation::Gather(op) => smallvec![op.output],
            Operation::Gemm(op) => smallvec![op.output],
            Operation::HardSigmoid(op) => smallvec![op.output],
            Operation::InstanceNormalization(op) => smallvec![op.output],
            Operation::LayerNormalization(op) => smallvec![op.output],
            Operation::LeakyRelu(op) => smallvec![op.output],
            Operation::Linear(op) => smallvec![op.output],
            Operation::Matmul(op) => smallvec![op.output],
            Operation::Pad(op) => smallvec![op.output],
            Operation::Pool2d(op) => smallvec![op.output],
            Operation::Prelu(op) => smallvec![op.output],
            Operation::Reduce(op) => smallvec![op.output],
            Operation::Resample2d(op) => smallvec![op.output],
            Operation::Slice(op) => smallvec![op.output],
            Operation::Softplus(op) => smallvec![op.output],
            Operation::Split(op) => op.outputs.iter().copied().collect(),
            Operation::Transpose(op) => smallvec![op.output],
            Operation::Triangular(op) => smallvec![op.output],
            Operation::Where(op) => smallvec![op.output],
            Operation::Expand(op)
            | Operation::Gelu(op)
            | Operation::HardSwish(op)
            | Operation::Relu(op)
            | Operation::Reshape(op)
            | Operation::Sigmoid(op)
            | Operation::Softmax(op)
            | Operation::Softsign(op)
            | Operation::Tanh(op) => smallvec![op.output],
        }
    }
}
