//! Lowering of a portable graph description into a native operator graph.
//!
//! Every [`Operation`] variant has one lowering function in a submodule;
//! [`lower_operation`] dispatches to it. A lowering function reads the node
//! outputs of its input operands from the [`LoweringContext`], creates the
//! operator nodes it needs and binds exactly one node output to each of its
//! output operands.

pub mod conv;
pub mod core;
pub mod gemm;
pub mod map;
pub mod nn;
pub mod reduce;

use crate::backend::{BackendCapabilities, FeatureLevel};
use crate::graph::ops::{Activation, Operation, OperationKind};
use crate::graph::{GraphInfo, Operand, OperandId};
use crate::ir::builder::{BuilderError, GraphBuilder, NodeId, NodeOutputId};
use crate::ir::{ActivationFunction, GraphDesc, Operator, OperatorDesc};
use crate::shape::{check_element_count, display_comma, TensorDescriptor, TensorFlags};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoweringErrorKind {
    NotSupported,
    InvalidAttribute,
    NodeCreation,
}

/// Failure to express one operation with native operators. Aborts the whole
/// compilation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct LoweringError {
    pub kind: LoweringErrorKind,
    pub operation: OperationKind,
    pub message: String,
}

impl LoweringError {
    pub fn not_supported(operation: OperationKind) -> Self {
        LoweringError {
            kind: LoweringErrorKind::NotSupported,
            operation,
            message: format!("This operator ({}) is not supported.", operation),
        }
    }

    pub fn unsupported_activation(operation: OperationKind) -> Self {
        LoweringError {
            kind: LoweringErrorKind::NotSupported,
            operation,
            message: "The fused activation type is not supported.".to_string(),
        }
    }

    pub fn invalid(operation: OperationKind, message: impl Into<String>) -> Self {
        LoweringError {
            kind: LoweringErrorKind::InvalidAttribute,
            operation,
            message: message.into(),
        }
    }

    fn node_creation(operation: OperationKind, source: BuilderError) -> Self {
        LoweringError {
            kind: LoweringErrorKind::NodeCreation,
            operation,
            message: format!("Failed to create the {} operator: {}", operation, source),
        }
    }
}

/// Binding slots of the compiled graph, stable for its lifetime.
///
/// Graph inputs take slots `0..inputs.len()` in declaration order and the
/// constants take the slots after them in id order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GraphBufferBindingInfo {
    pub inputs: BTreeMap<String, u32>,
    pub outputs: BTreeMap<String, u32>,
    pub constants: BTreeMap<OperandId, u32>,
    pub input_buffer_binding_count: u32,
}

/// Byte lengths of the named inputs and outputs of one compute.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ComputeResourceInfo {
    pub input_byte_lengths: BTreeMap<String, u64>,
    pub output_byte_lengths: BTreeMap<String, u64>,
}

#[derive(Debug)]
pub struct LoweredGraph {
    pub desc: GraphDesc,
    pub binding_info: GraphBufferBindingInfo,
    pub resource_info: ComputeResourceInfo,
}

/// State shared by the lowering functions of one graph.
pub struct LoweringContext<'a> {
    graph: &'a GraphInfo,
    capabilities: &'a BackendCapabilities,
    builder: GraphBuilder,
    node_outputs: BTreeMap<OperandId, NodeOutputId>,
    operation: OperationKind,
}

impl<'a> LoweringContext<'a> {
    pub fn new(graph: &'a GraphInfo, capabilities: &'a BackendCapabilities) -> Self {
        LoweringContext {
            graph,
            capabilities,
            builder: GraphBuilder::new(),
            node_outputs: BTreeMap::new(),
            // replaced before the first operation is lowered
            operation: OperationKind::Reshape,
        }
    }

    pub fn feature_level(&self) -> FeatureLevel {
        self.capabilities.feature_level
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn invalid(&self, message: impl Into<String>) -> LoweringError {
        LoweringError::invalid(self.operation, message)
    }

    pub fn operand(&self, id: OperandId) -> Result<&'a Operand, LoweringError> {
        self.graph
            .operands
            .get(&id)
            .ok_or_else(|| self.invalid(format!("operand {} does not exist", id)))
    }

    /// Dense descriptor of an operand as declared in the graph.
    pub fn operand_desc(&self, id: OperandId) -> Result<TensorDescriptor, LoweringError> {
        let operand = self.operand(id)?;
        check_element_count(&operand.dimensions).map_err(|e| self.invalid(format!("operand {}: {}", id, e)))?;
        Ok(TensorDescriptor::new(operand.data_type, &operand.dimensions))
    }

    /// Rejects an output operand whose declared shape is not `expected`.
    pub fn expect_output_dims(&self, id: OperandId, expected: &[u32]) -> Result<(), LoweringError> {
        let declared = &self.operand(id)?.dimensions;
        if declared.as_slice() != expected {
            return Err(self.invalid(format!(
                "The output shape [{}] does not match the computed shape [{}].",
                display_comma(declared),
                display_comma(expected)
            )));
        }
        Ok(())
    }

    pub fn node_output_id(&self, id: OperandId) -> Result<NodeOutputId, LoweringError> {
        self.node_outputs
            .get(&id)
            .copied()
            .ok_or_else(|| self.invalid(format!("operand {} is read before it is produced", id)))
    }

    /// The node output an operand is bound to, with a copy of its descriptor
    /// for the caller to view differently.
    pub fn input(&self, id: OperandId) -> Result<(NodeOutputId, TensorDescriptor), LoweringError> {
        let node_output = self.node_output_id(id)?;
        Ok((node_output, self.builder.node_output(node_output).desc.clone()))
    }

    pub fn create_node(&mut self, desc: OperatorDesc, inputs: &[NodeOutputId]) -> Result<NodeId, LoweringError> {
        trace!(operation = %self.operation, operator = %desc.operator, "creating node");
        self.builder
            .create_operator_node(desc, inputs)
            .map_err(|e| LoweringError::node_creation(self.operation, e))
    }

    pub fn create_node_output(&mut self, node: NodeId, output_index: u32, desc: TensorDescriptor) -> NodeOutputId {
        self.builder.create_node_output(node, output_index, desc)
    }

    /// Makes `node_output` the value of operand `id`.
    pub fn bind(&mut self, id: OperandId, node_output: NodeOutputId) {
        let previous = self.node_outputs.insert(id, node_output);
        assert!(previous.is_none(), "operand {} is bound twice", id);
    }

    /// Creates a single-output node and returns its output, seen through
    /// `output` (the node's own output descriptor when `None`).
    pub fn add_node(
        &mut self,
        operator: Operator,
        inputs: Vec<Option<(NodeOutputId, TensorDescriptor)>>,
        node_output: TensorDescriptor,
        output: Option<TensorDescriptor>,
    ) -> Result<NodeOutputId, LoweringError> {
        let ids: Vec<NodeOutputId> = inputs.iter().flatten().map(|(id, _)| *id).collect();
        let descs = inputs.into_iter().map(|input| input.map(|(_, desc)| desc)).collect();
        let node = self.create_node(OperatorDesc::new(operator, descs, vec![node_output.clone()]), &ids)?;
        Ok(self.create_node_output(node, 0, output.unwrap_or(node_output)))
    }

    /// The common case: a node reading dense inputs and producing the
    /// declared `output` operand.
    pub fn add_simple(
        &mut self,
        operator: Operator,
        inputs: Vec<(NodeOutputId, TensorDescriptor)>,
        output: OperandId,
    ) -> Result<(), LoweringError> {
        let output_desc = self.operand_desc(output)?;
        let inputs = inputs.into_iter().map(Some).collect();
        let node_output = self.add_node(operator, inputs, output_desc, None)?;
        self.bind(output, node_output);
        Ok(())
    }

    /// Native function of a fused activation.
    pub fn fused_activation(&self, activation: Option<Activation>) -> Result<Option<ActivationFunction>, LoweringError> {
        let function = match activation {
            None => return Ok(None),
            Some(Activation::Elu { alpha }) => ActivationFunction::Elu { alpha },
            Some(Activation::HardSigmoid { alpha, beta }) => ActivationFunction::HardSigmoid { alpha, beta },
            Some(Activation::LeakyRelu { alpha }) => ActivationFunction::LeakyRelu { alpha },
            Some(Activation::Linear { alpha, beta }) => ActivationFunction::Linear { alpha, beta },
            Some(Activation::Relu) => ActivationFunction::Relu,
            Some(Activation::Sigmoid) => ActivationFunction::Sigmoid,
            Some(Activation::Softplus { steepness }) => self.softplus(steepness)?,
            Some(Activation::Softsign) => ActivationFunction::Softsign,
            Some(Activation::Tanh) => ActivationFunction::Tanh,
            Some(Activation::Clamp { .. } | Activation::Gelu | Activation::HardSwish) => {
                return Err(LoweringError::unsupported_activation(self.operation))
            }
        };
        Ok(Some(function))
    }

    pub fn softplus(&self, steepness: f32) -> Result<ActivationFunction, LoweringError> {
        if steepness < 1.0 && !self.feature_level().allows_softplus_below_one() {
            return Err(LoweringError {
                kind: LoweringErrorKind::NotSupported,
                operation: self.operation,
                message: format!(
                    "Softplus steepness {} below 1 requires feature level {}.",
                    steepness,
                    FeatureLevel::V6_3
                ),
            });
        }
        Ok(ActivationFunction::Softplus { steepness })
    }
}

/// Lowers one operation through the function for its kind.
pub fn lower_operation(ctx: &mut LoweringContext, operation: &Operation) -> Result<(), LoweringError> {
    ctx.operation = operation.kind();
    match operation {
        Operation::ArgMinMax(op) => reduce::arg_min_max(ctx, op),
        Operation::BatchNormalization(op) => nn::batch_normalization(ctx, op),
        Operation::Clamp(op) => map::clamp(ctx, op),
        Operation::Concat(op) => core::concat(ctx, op),
        Operation::Conv2d(op) => conv::conv2d(ctx, op),
        Operation::ElementWiseBinary(op) => map::element_wise_binary(ctx, op),
        Operation::ElementWiseUnary(op) => map::element_wise_unary(ctx, op),
        Operation::Elu(op) => map::elu(ctx, op),
        Operation::Expand(op) => core::expand(ctx, op),
        Operation::Gather(op) => core::gather(ctx, op),
        Operation::Gelu(_) => Err(LoweringError::not_supported(OperationKind::Gelu)),
        Operation::Gemm(op) => gemm::gemm(ctx, op),
        Operation::HardSigmoid(op) => map::hard_sigmoid(ctx, op),
        Operation::HardSwish(op) => map::hard_swish(ctx, op),
        Operation::InstanceNormalization(op) => nn::instance_normalization(ctx, op),
        Operation::LayerNormalization(op) => nn::layer_normalization(ctx, op),
        Operation::LeakyRelu(op) => map::leaky_relu(ctx, op),
        Operation::Linear(op) => map::linear(ctx, op),
        Operation::Matmul(op) => gemm::matmul(ctx, op),
        Operation::Pad(op) => core::pad(ctx, op),
        Operation::Pool2d(op) => conv::pool2d(ctx, op),
        Operation::Prelu(op) => map::prelu(ctx, op),
        Operation::Reduce(op) => reduce::reduce(ctx, op),
        Operation::Relu(op) => map::activation(ctx, op, ActivationFunction::Relu),
        Operation::Resample2d(op) => conv::resample2d(ctx, op),
        Operation::Reshape(op) => core::reshape(ctx, op),
        Operation::Sigmoid(op) => map::activation(ctx, op, ActivationFunction::Sigmoid),
        Operation::Slice(op) => core::slice(ctx, op),
        Operation::Softmax(op) => reduce::softmax(ctx, op),
        Operation::Softplus(op) => map::softplus(ctx, op),
        Operation::Softsign(op) => map::activation(ctx, op, ActivationFunction::Softsign),
        Operation::Split(op) => core::split(ctx, op),
        Operation::Tanh(op) => map::activation(ctx, op, ActivationFunction::Tanh),
        Operation::Transpose(op) => core::transpose(ctx, op),
        Operation::Triangular(_) => Err(LoweringError::not_supported(OperationKind::Triangular)),
        Operation::Where(op) => map::where_(ctx, op),
    }
}

fn byte_length(ctx: &LoweringContext, id: OperandId) -> Result<u64, LoweringError> {
    ctx.operand(id)?
        .byte_length()
        .map_err(|e| ctx.invalid(format!("operand {}: {}", id, e)))
}

fn operand_name(ctx: &LoweringContext, id: OperandId) -> Result<String, LoweringError> {
    ctx.operand(id)?
        .name
        .clone()
        .ok_or_else(|| ctx.invalid(format!("operand {} has no name", id)))
}

/// Lowers a validated graph whose default constants are materialized.
///
/// Constants no operation reads are left out of the native graph.
pub fn lower_graph(graph: &GraphInfo, capabilities: &BackendCapabilities) -> Result<LoweredGraph, LoweringError> {
    let mut ctx = LoweringContext::new(graph, capabilities);
    let mut binding_info = GraphBufferBindingInfo::default();
    let mut resource_info = ComputeResourceInfo::default();

    for &id in &graph.input_operands {
        let name = operand_name(&ctx, id)?;
        let (node, index) = ctx.builder.create_input_node();
        let desc = ctx.operand_desc(id)?;
        let node_output = ctx.create_node_output(node, 0, desc);
        ctx.bind(id, node_output);
        resource_info.input_byte_lengths.insert(name.clone(), byte_length(&ctx, id)?);
        binding_info.inputs.insert(name, index);
    }

    let read: BTreeSet<OperandId> = graph.operations.iter().flat_map(|op| op.inputs()).collect();
    for &id in graph.constants.keys().filter(|id| read.contains(id)) {
        let operand = ctx.operand(id)?;
        let (node, index) = ctx.builder.create_input_node();
        let desc = TensorDescriptor::with_flags(operand.data_type, TensorFlags::OwnedByBackend, &operand.dimensions);
        let node_output = ctx.create_node_output(node, 0, desc);
        ctx.bind(id, node_output);
        binding_info.constants.insert(id, index);
    }
    binding_info.input_buffer_binding_count = ctx.builder.input_count();

    for operation in &graph.operations {
        lower_operation(&mut ctx, operation)?;
    }

    for &id in &graph.output_operands {
        let name = operand_name(&ctx, id)?;
        let mut node_output = ctx.node_output_id(id)?;
        let source = ctx.builder.node_output(node_output).clone();
        if ctx.builder.is_input_node(source.node) {
            // an input slot is never bound as an output slot, so copy it
            let output = TensorDescriptor::new(source.desc.data_type(), source.desc.dims());
            node_output = ctx.add_node(
                Operator::Identity { scale_bias: None },
                vec![Some((node_output, source.desc))],
                output,
                None,
            )?;
        }
        let index = ctx
            .builder
            .create_output_edge(node_output)
            .map_err(|e| LoweringError::node_creation(ctx.operation, e))?;
        resource_info.output_byte_lengths.insert(name.clone(), byte_length(&ctx, id)?);
        binding_info.outputs.insert(name, index);
    }

    debug!(
        operators = ctx.builder.operator_count(),
        inputs = binding_info.inputs.len(),
        constants = binding_info.constants.len(),
        outputs = binding_info.outputs.len(),
        "lowered graph"
    );
    Ok(LoweredGraph {
        desc: ctx.builder.finish(),
        binding_info,
        resource_info,
    })
}
