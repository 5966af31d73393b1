//! CPU reference backend.
//!
//! Executes a compiled operator graph one node at a time, in node order, with
//! every node output kept in the temporary resource and every owned-by-backend
//! input copied into the persistent resource at initialization. Values are
//! computed in `f64` and converted to each output's data type on write.

mod conv;
mod gemm;
mod layout;
mod map;
mod reduce;

use crate::backend::{Backend, BindingProperties, BufferBinding, CompiledOperator, ExecutionBindings};
use crate::ir::{ActivationFunction, GraphDesc, Operator, OperatorDesc};
use crate::session::device::DeviceError;
use crate::session::planner::{plan, AlignedByteLength};
use crate::shape::{Array, TensorDescriptor, TensorFlags};
use crate::tensor::{read_element, write_element};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Default)]
pub struct Native;

impl Backend for Native {
    fn compile(&self, graph: GraphDesc) -> Result<Arc<dyn CompiledOperator>, DeviceError> {
        let compiled = CompiledGraph::new(graph)?;
        debug!(
            nodes = compiled.graph.nodes.len(),
            properties = ?compiled.properties,
            "compiled operator graph"
        );
        Ok(Arc::new(compiled))
    }
}

/// Dense row-major values of one operator input.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Tensor {
    pub dims: Array,
    pub data: Vec<f64>,
}

impl Tensor {
    fn gather(desc: &TensorDescriptor, bytes: &[u8]) -> Self {
        Tensor {
            dims: Array::from_slice(desc.dims()),
            data: desc
                .iter()
                .map(|offset| read_element(desc.data_type(), bytes, offset))
                .collect(),
        }
    }
}

fn scatter(desc: &TensorDescriptor, values: &[f64], bytes: &mut [u8]) {
    for (offset, &value) in desc.iter().zip(values) {
        write_element(desc.data_type(), bytes, offset, value);
    }
}

pub(crate) fn row_major_strides(dims: &[u32]) -> Vec<usize> {
    let mut strides = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * dims[i + 1] as usize;
    }
    strides
}

pub(crate) fn unravel(mut index: usize, dims: &[u32]) -> Array {
    let mut coords = Array::from_elem(0, dims.len());
    for (coord, &dim) in coords.iter_mut().zip(dims).rev() {
        *coord = (index % dim as usize) as u32;
        index /= dim as usize;
    }
    coords
}

pub(crate) fn element_count(dims: &[u32]) -> usize {
    dims.iter().map(|&d| d as usize).product()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Source {
    GraphInput(u32),
    Node { node: u32, output: u32 },
}

#[derive(Debug)]
struct CompiledGraph {
    graph: GraphDesc,
    sources: Vec<Vec<Option<Source>>>,
    outputs: Vec<(u32, u32)>,
    input_sizes: Vec<u64>,
    temporary: AlignedByteLength<(u32, u32)>,
    persistent: AlignedByteLength<u32>,
    properties: BindingProperties,
    initialized: AtomicBool,
}

fn invalid(message: String) -> DeviceError {
    DeviceError::InvalidGraph(message)
}

fn slot_desc(graph: &GraphDesc, node: u32, slot: u32) -> Result<&TensorDescriptor, DeviceError> {
    graph
        .nodes
        .get(node as usize)
        .and_then(|n| n.inputs.get(slot as usize))
        .and_then(|desc| desc.as_ref())
        .ok_or_else(|| invalid(format!("node {} has no input {}", node, slot)))
}

fn output_desc(graph: &GraphDesc, node: u32, output: u32) -> Result<&TensorDescriptor, DeviceError> {
    graph
        .nodes
        .get(node as usize)
        .and_then(|n| n.outputs.get(output as usize))
        .ok_or_else(|| invalid(format!("node {} has no output {}", node, output)))
}

fn connect(sources: &mut [Vec<Option<Source>>], node: u32, slot: u32, source: Source) -> Result<(), DeviceError> {
    let entry = &mut sources[node as usize][slot as usize];
    if entry.is_some() {
        return Err(invalid(format!("input {} of node {} is connected twice", slot, node)));
    }
    *entry = Some(source);
    Ok(())
}

impl CompiledGraph {
    fn new(graph: GraphDesc) -> Result<Self, DeviceError> {
        if graph.output_count == 0 {
            return Err(invalid("the graph has no outputs".to_string()));
        }
        for (index, node) in graph.nodes.iter().enumerate() {
            node.validate()
                .map_err(|e| invalid(format!("node {}: {}", index, e)))?;
        }

        let mut sources: Vec<Vec<Option<Source>>> = graph.nodes.iter().map(|n| vec![None; n.inputs.len()]).collect();
        let mut input_sizes = vec![0u64; graph.input_count as usize];
        let mut owned = vec![false; graph.input_count as usize];
        for edge in &graph.input_edges {
            if edge.graph_input_index >= graph.input_count {
                return Err(invalid(format!("graph input {} does not exist", edge.graph_input_index)));
            }
            let desc = slot_desc(&graph, edge.to_node, edge.to_node_input_index)?;
            let index = edge.graph_input_index as usize;
            input_sizes[index] = input_sizes[index].max(desc.total_tensor_size_in_bytes());
            owned[index] |= desc.flags() == TensorFlags::OwnedByBackend;
            connect(
                &mut sources,
                edge.to_node,
                edge.to_node_input_index,
                Source::GraphInput(edge.graph_input_index),
            )?;
        }

        for edge in &graph.intermediate_edges {
            if edge.from_node >= edge.to_node {
                return Err(invalid(format!(
                    "edge from node {} to node {} does not point forward",
                    edge.from_node, edge.to_node
                )));
            }
            let producer = output_desc(&graph, edge.from_node, edge.from_node_output_index)?;
            let consumer = slot_desc(&graph, edge.to_node, edge.to_node_input_index)?;
            if producer.data_type() != consumer.data_type() {
                return Err(invalid(format!(
                    "node {} reads {} from node {} which produces {}",
                    edge.to_node,
                    consumer.data_type(),
                    edge.from_node,
                    producer.data_type()
                )));
            }
            if consumer.total_tensor_size_in_bytes() > producer.total_tensor_size_in_bytes() {
                return Err(invalid(format!(
                    "node {} reads {} which is larger than output {} of node {}",
                    edge.to_node, consumer, edge.from_node_output_index, edge.from_node
                )));
            }
            connect(
                &mut sources,
                edge.to_node,
                edge.to_node_input_index,
                Source::Node {
                    node: edge.from_node,
                    output: edge.from_node_output_index,
                },
            )?;
        }

        for (index, node) in graph.nodes.iter().enumerate() {
            if let Some(slot) = (0..node.inputs.len()).find(|&s| node.inputs[s].is_some() && sources[index][s].is_none()) {
                return Err(invalid(format!("input {} of node {} is not connected", slot, index)));
            }
        }

        let mut outputs = vec![None; graph.output_count as usize];
        for edge in &graph.output_edges {
            output_desc(&graph, edge.from_node, edge.from_node_output_index)?;
            let slot = outputs
                .get_mut(edge.graph_output_index as usize)
                .ok_or_else(|| invalid(format!("graph output {} does not exist", edge.graph_output_index)))?;
            if slot.is_some() {
                return Err(invalid(format!("graph output {} is bound twice", edge.graph_output_index)));
            }
            *slot = Some((edge.from_node, edge.from_node_output_index));
        }
        let outputs = outputs
            .into_iter()
            .enumerate()
            .map(|(index, output)| output.ok_or_else(|| invalid(format!("graph output {} is not bound", index))))
            .collect::<Result<Vec<_>, _>>()?;

        let node_outputs: BTreeMap<(u32, u32), u64> = graph
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(n, node)| {
                node.outputs
                    .iter()
                    .enumerate()
                    .map(move |(o, desc)| ((n as u32, o as u32), desc.total_tensor_size_in_bytes()))
            })
            .collect();
        let temporary = plan(&node_outputs).map_err(|e| invalid(e.to_string()))?;

        let owned_inputs: BTreeMap<u32, u64> = owned
            .iter()
            .enumerate()
            .filter(|(_, &owned)| owned)
            .map(|(index, _)| (index as u32, input_sizes[index]))
            .collect();
        let persistent = plan(&owned_inputs).map_err(|e| invalid(e.to_string()))?;

        let properties = BindingProperties {
            required_descriptor_count: graph.input_count
                + graph.output_count
                + (persistent.total > 0) as u32
                + (temporary.total > 0) as u32,
            temporary_resource_size: temporary.total,
            persistent_resource_size: persistent.total,
        };

        Ok(CompiledGraph {
            graph,
            sources,
            outputs,
            input_sizes,
            temporary,
            persistent,
            properties,
            initialized: AtomicBool::new(false),
        })
    }

    fn is_owned(&self, input: u32) -> bool {
        self.persistent.range(&input).is_some()
    }

    fn check_resource(&self, binding: Option<&BufferBinding>, size: u64, what: &str) -> Result<(), DeviceError> {
        match binding {
            _ if size == 0 => Ok(()),
            Some(binding) if binding.size >= size => Ok(()),
            Some(binding) => Err(DeviceError::InvalidBinding(format!(
                "the {} resource needs {} bytes but {} are bound",
                what, size, binding.size
            ))),
            None => Err(DeviceError::InvalidBinding(format!("the {} resource is not bound", what))),
        }
    }

    /// Copies the bytes every consumer of each graph input may read.
    fn read_inputs(&self, bindings: &ExecutionBindings) -> Result<Vec<Vec<u8>>, DeviceError> {
        (0..self.graph.input_count)
            .map(|input| {
                let size = self.input_sizes[input as usize];
                if let Some(range) = self.persistent.range(&input) {
                    let persistent = bindings
                        .persistent
                        .as_ref()
                        .ok_or_else(|| DeviceError::InvalidBinding("the persistent resource is not bound".to_string()))?;
                    return persistent.buffer.read_range(persistent.offset + range.start, size);
                }
                match &bindings.inputs[input as usize] {
                    _ if size == 0 => Ok(Vec::new()),
                    Some(binding) if binding.size >= size => binding.buffer.read_range(binding.offset, size),
                    Some(binding) => Err(DeviceError::InvalidBinding(format!(
                        "graph input {} needs {} bytes but {} are bound",
                        input, size, binding.size
                    ))),
                    None => Err(DeviceError::InvalidBinding(format!("graph input {} is not bound", input))),
                }
            })
            .collect()
    }

    fn evaluate_nodes(&self, inputs: &[Vec<u8>], scratch: &mut [u8]) -> Result<(), DeviceError> {
        for (index, node) in self.graph.nodes.iter().enumerate() {
            let args = node
                .inputs
                .iter()
                .zip(&self.sources[index])
                .map(|(desc, source)| match (desc, source) {
                    (Some(desc), Some(Source::GraphInput(input))) => Some(Tensor::gather(desc, &inputs[*input as usize])),
                    (Some(desc), Some(Source::Node { node, output })) => self
                        .temporary
                        .range(&(*node, *output))
                        .map(|range| Tensor::gather(desc, &scratch[range.start as usize..range.end as usize])),
                    _ => None,
                })
                .collect::<Vec<_>>();

            let results = evaluate(node, &args)?;
            trace!(node = index, operator = %node.operator, "evaluated");
            for (output, (values, desc)) in results.iter().zip(&node.outputs).enumerate() {
                if let Some(range) = self.temporary.range(&(index as u32, output as u32)) {
                    scatter(desc, values, &mut scratch[range.start as usize..range.end as usize]);
                }
            }
        }
        Ok(())
    }
}

impl CompiledOperator for CompiledGraph {
    fn binding_properties(&self) -> BindingProperties {
        self.properties
    }

    fn initialize(&self, inputs: &[Option<BufferBinding>], persistent: Option<&BufferBinding>) -> Result<(), DeviceError> {
        if inputs.len() != self.graph.input_count as usize {
            return Err(DeviceError::InvalidBinding(format!(
                "{} initialization inputs are bound but the graph has {}",
                inputs.len(),
                self.graph.input_count
            )));
        }
        self.check_resource(persistent, self.persistent.total, "persistent")?;

        let mut owned = Vec::new();
        for (index, binding) in inputs.iter().enumerate() {
            let input = index as u32;
            match (self.persistent.range(&input), binding) {
                (Some(range), Some(binding)) => {
                    let size = self.input_sizes[index];
                    if binding.size < size {
                        return Err(DeviceError::InvalidBinding(format!(
                            "owned input {} needs {} bytes but {} are bound",
                            index, size, binding.size
                        )));
                    }
                    owned.push((range.start, binding.buffer.read_range(binding.offset, size)?));
                }
                (Some(_), None) => {
                    return Err(DeviceError::InvalidBinding(format!("owned input {} is not bound", index)))
                }
                (None, Some(_)) => {
                    return Err(DeviceError::InvalidBinding(format!(
                        "graph input {} is not owned by the backend",
                        index
                    )))
                }
                (None, None) => (),
            }
        }

        if let Some(persistent) = persistent.filter(|_| !owned.is_empty()) {
            let range = persistent.buffer.checked_range(persistent.offset, persistent.size)?;
            let mut storage = persistent.buffer.write();
            let target = &mut storage[range];
            for (offset, bytes) in owned {
                let start = offset as usize;
                target[start..start + bytes.len()].copy_from_slice(&bytes);
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&self, bindings: &ExecutionBindings) -> Result<(), DeviceError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(DeviceError::Execution("the operator has not been initialized".to_string()));
        }
        if bindings.inputs.len() != self.graph.input_count as usize
            || bindings.outputs.len() != self.graph.output_count as usize
        {
            return Err(DeviceError::InvalidBinding(format!(
                "{} inputs and {} outputs are bound but the graph has {} and {}",
                bindings.inputs.len(),
                bindings.outputs.len(),
                self.graph.input_count,
                self.graph.output_count
            )));
        }
        if let Some(index) = (0..self.graph.input_count).find(|&i| self.is_owned(i) && bindings.inputs[i as usize].is_some()) {
            return Err(DeviceError::InvalidBinding(format!(
                "graph input {} is owned by the backend and cannot be bound",
                index
            )));
        }
        self.check_resource(bindings.persistent.as_ref(), self.persistent.total, "persistent")?;
        self.check_resource(bindings.temporary.as_ref(), self.temporary.total, "temporary")?;

        let inputs = self.read_inputs(bindings)?;

        let temporary = bindings
            .temporary
            .as_ref()
            .ok_or_else(|| DeviceError::InvalidBinding("the temporary resource is not bound".to_string()))?;
        let range = temporary.buffer.checked_range(temporary.offset, temporary.size)?;
        let results = {
            let mut storage = temporary.buffer.write();
            let scratch = &mut storage[range];
            self.evaluate_nodes(&inputs, scratch)?;

            self.outputs
                .iter()
                .map(|&(node, output)| {
                    let range = self.temporary.range(&(node, output)).cloned().unwrap_or(0..0);
                    scratch[range.start as usize..range.end as usize].to_vec()
                })
                .collect::<Vec<_>>()
        };

        for (index, (binding, bytes)) in bindings.outputs.iter().zip(results).enumerate() {
            let binding = binding
                .as_ref()
                .ok_or_else(|| DeviceError::InvalidBinding(format!("graph output {} is not bound", index)))?;
            let (node, output) = self.outputs[index];
            let size = self.graph.nodes[node as usize].outputs[output as usize].total_tensor_size_in_bytes();
            if binding.size < size {
                return Err(DeviceError::InvalidBinding(format!(
                    "graph output {} needs {} bytes but {} are bound",
                    index, size, binding.size
                )));
            }
            let range = binding.buffer.checked_range(binding.offset, size)?;
            binding.buffer.write()[range].copy_from_slice(&bytes[..size as usize]);
        }
        Ok(())
    }
}

fn input<'a>(args: &'a [Option<Tensor>], index: usize, operator: &Operator) -> Result<&'a Tensor, DeviceError> {
    args.get(index)
        .and_then(Option::as_ref)
        .ok_or_else(|| DeviceError::Execution(format!("input {} of {} is missing", index, operator)))
}

fn evaluate(node: &OperatorDesc, args: &[Option<Tensor>]) -> Result<Vec<Vec<f64>>, DeviceError> {
    let operator = &node.operator;
    let output = node.outputs[0].dims();
    let x = input(args, 0, operator)?;
    let values = match operator {
        Operator::Identity { scale_bias } => match scale_bias {
            Some(sb) => map::unary(x, |v| v * sb.scale as f64 + sb.bias as f64),
            None => x.data.clone(),
        },
        Operator::ElementWise(function) => map::unary(x, |v| map::element_wise(*function, v)),
        Operator::Cast => x.data.clone(),
        Operator::Clip { min, max } => map::unary(x, |v| v.max(*min as f64).min(*max as f64)),
        Operator::Binary(function) => map::binary(*function, x, input(args, 1, operator)?),
        Operator::Activation(ActivationFunction::Softmax) => reduce::softmax(x),
        Operator::Activation(function) => map::unary(x, |v| map::activation(*function, v)),
        Operator::ParameterizedRelu => map::prelu(x, input(args, 1, operator)?),
        Operator::If => map::select(x, input(args, 1, operator)?, input(args, 2, operator)?),
        Operator::Join { axis } => {
            let inputs = (0..args.len())
                .map(|i| input(args, i, operator))
                .collect::<Result<Vec<_>, _>>()?;
            layout::join(&inputs, *axis as usize, output)
        }
        Operator::Split { axis } => return Ok(layout::split(x, *axis as usize, &node.outputs)),
        Operator::Slice {
            offsets,
            sizes,
            strides,
        } => layout::slice(x, offsets, sizes, strides),
        Operator::Padding { mode, start, .. } => layout::pad(x, *mode, start, output),
        Operator::Gather { axis } => layout::gather(x, input(args, 1, operator)?, *axis as usize),
        Operator::Gemm {
            trans_a,
            trans_b,
            alpha,
            beta,
            fused,
        } => gemm::gemm(
            x,
            input(args, 1, operator)?,
            args.get(2).and_then(Option::as_ref),
            output,
            gemm::GemmParams {
                trans_a: *trans_a,
                trans_b: *trans_b,
                alpha: *alpha as f64,
                beta: *beta as f64,
                fused: *fused,
            },
        ),
        Operator::Convolution {
            direction,
            window,
            groups,
            fused,
        } => conv::convolution(
            x,
            input(args, 1, operator)?,
            args.get(2).and_then(Option::as_ref),
            output,
            conv::ConvParams {
                direction: *direction,
                window: *window,
                groups: *groups,
                fused: *fused,
            },
        ),
        Operator::AveragePooling {
            window,
            include_padding,
        } => conv::pool(
            x,
            window,
            conv::PoolFunction::Average {
                include_padding: *include_padding,
            },
            output,
        ),
        Operator::LpPooling { window, p } => conv::pool(x, window, conv::PoolFunction::Lp(*p), output),
        Operator::MaxPooling { window } => conv::pool(x, window, conv::PoolFunction::Max, output),
        Operator::Reduce { function, axes } => reduce::reduce(x, *function, axes),
        Operator::ArgMin { axes, direction } => reduce::arg_reduce(x, axes, false, *direction),
        Operator::ArgMax { axes, direction } => reduce::arg_reduce(x, axes, true, *direction),
        Operator::BatchNormalization { epsilon, fused } => map::batch_normalization(
            [
                x,
                input(args, 1, operator)?,
                input(args, 2, operator)?,
                input(args, 3, operator)?,
                input(args, 4, operator)?,
            ],
            *epsilon as f64,
            *fused,
        ),
        Operator::MeanVarianceNormalization { axes, epsilon } => reduce::mean_variance_normalization(
            x,
            args.get(1).and_then(Option::as_ref),
            args.get(2).and_then(Option::as_ref),
            axes,
            *epsilon as f64,
        ),
        Operator::Resample { mode, scales } => conv::resample(x, *mode, scales, output),
    };
    Ok(vec![values])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendCapabilities;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::{BinaryFunction, OperatorDesc};
    use crate::session::device::{Buffer, Device, HeapKind};
    use crate::shape::DataType;
    use crate::tensor::{decode, encode};

    fn f32_desc(dims: &[u32]) -> TensorDescriptor {
        TensorDescriptor::new(DataType::Float32, dims)
    }

    fn buffer_with(device: &Device, values: &[f64]) -> Buffer {
        let buffer = device
            .create_buffer(HeapKind::Upload, values.len() as u64 * 4, "data")
            .unwrap();
        buffer.map().unwrap().copy_from_slice(&encode(DataType::Float32, values));
        buffer
    }

    /// y = relu(x * w) with w owned by the backend.
    fn mul_relu_graph() -> GraphDesc {
        let mut builder = GraphBuilder::new();
        let (x, _) = builder.create_input_node();
        let (w, _) = builder.create_input_node();
        let x = builder.create_node_output(x, 0, f32_desc(&[4]));
        let w_desc = TensorDescriptor::with_flags(DataType::Float32, TensorFlags::OwnedByBackend, &[4]);
        let w = builder.create_node_output(w, 0, w_desc.clone());
        let mul = builder
            .create_operator_node(
                OperatorDesc::dense(
                    Operator::Binary(BinaryFunction::Multiply),
                    vec![f32_desc(&[4]), w_desc],
                    vec![f32_desc(&[4])],
                ),
                &[x, w],
            )
            .unwrap();
        let product = builder.create_node_output(mul, 0, f32_desc(&[4]));
        let relu = builder
            .create_operator_node(
                OperatorDesc::dense(
                    Operator::Activation(ActivationFunction::Relu),
                    vec![f32_desc(&[4])],
                    vec![f32_desc(&[4])],
                ),
                &[product],
            )
            .unwrap();
        let y = builder.create_node_output(relu, 0, f32_desc(&[4]));
        builder.create_output_edge(y).unwrap();
        builder.finish()
    }

    #[test]
    fn test_binding_properties() {
        let compiled = Native.compile(mul_relu_graph()).unwrap();
        assert_eq!(
            compiled.binding_properties(),
            BindingProperties {
                required_descriptor_count: 5,
                temporary_resource_size: 32,
                persistent_resource_size: 16,
            }
        );
    }

    #[test]
    fn test_initialize_and_execute() {
        let device = Device::new(BackendCapabilities::default()).unwrap();
        let compiled = Native.compile(mul_relu_graph()).unwrap();

        let weights = buffer_with(&device, &[2.0, -1.0, 0.5, 3.0]);
        let persistent = device.create_buffer(HeapKind::Default, 16, "persistent").unwrap();
        let temporary = device.create_buffer(HeapKind::Default, 32, "temporary").unwrap();
        let output = device.create_buffer(HeapKind::Readback, 16, "output").unwrap();
        let x = buffer_with(&device, &[1.0, 2.0, 3.0, 4.0]);

        let bindings = ExecutionBindings {
            inputs: vec![Some(BufferBinding::whole(x)), None],
            outputs: vec![Some(BufferBinding::whole(output.clone()))],
            persistent: Some(BufferBinding::whole(persistent.clone())),
            temporary: Some(BufferBinding::whole(temporary)),
        };
        assert!(matches!(compiled.execute(&bindings), Err(DeviceError::Execution(_))));

        compiled
            .initialize(
                &[None, Some(BufferBinding::whole(weights))],
                Some(&BufferBinding::whole(persistent)),
            )
            .unwrap();
        compiled.execute(&bindings).unwrap();
        let values = decode(DataType::Float32, &output.map().unwrap()).unwrap();
        assert_eq!(values, vec![2.0, 0.0, 1.5, 12.0]);
    }

    #[test]
    fn test_initialize_rejects_unowned_input() {
        let device = Device::new(BackendCapabilities::default()).unwrap();
        let compiled = Native.compile(mul_relu_graph()).unwrap();
        let x = buffer_with(&device, &[1.0; 4]);
        let persistent = device.create_buffer(HeapKind::Default, 16, "persistent").unwrap();
        let err = compiled
            .initialize(&[Some(BufferBinding::whole(x)), None], Some(&BufferBinding::whole(persistent)))
            .unwrap_err();
        assert!(matches!(err, DeviceError::InvalidBinding(_)));
    }

    #[test]
    fn test_compile_rejects_unconnected_input() {
        let mut graph = mul_relu_graph();
        graph.input_edges.pop();
        assert!(matches!(Native.compile(graph), Err(DeviceError::InvalidGraph(_))));

        let mut graph = mul_relu_graph();
        graph.output_edges.clear();
        assert!(matches!(Native.compile(graph), Err(DeviceError::InvalidGraph(_))));
    }

    #[test]
    fn test_compile_rejects_backward_edge() {
        let mut graph = mul_relu_graph();
        let edge = &mut graph.intermediate_edges[0];
        std::mem::swap(&mut edge.from_node, &mut edge.to_node);
        assert!(matches!(Native.compile(graph), Err(DeviceError::InvalidGraph(_))));
    }

    #[test]
    fn test_strided_output_is_scattered() {
        let mut transposed = f32_desc(&[3, 2]);
        transposed.transpose(&[1, 0]);
        let desc = OperatorDesc::dense(Operator::Identity { scale_bias: None }, vec![f32_desc(&[2, 3])], vec![transposed.clone()]);

        let inputs = vec![encode(DataType::Float32, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])];
        let mut builder = GraphBuilder::new();
        let (x, _) = builder.create_input_node();
        let x = builder.create_node_output(x, 0, f32_desc(&[2, 3]));
        let node = builder.create_operator_node(desc, &[x]).unwrap();
        let y = builder.create_node_output(node, 0, transposed);
        builder.create_output_edge(y).unwrap();
        let compiled = CompiledGraph::new(builder.finish()).unwrap();

        let mut scratch = vec![0u8; compiled.temporary.total as usize];
        compiled.evaluate_nodes(&inputs, &mut scratch).unwrap();
        assert_eq!(
            decode(DataType::Float32, &scratch[..24]).unwrap(),
            vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
    }

    #[test]
    fn test_index_helpers() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(unravel(17, &[2, 3, 4]).to_vec(), vec![1, 1, 1]);
        assert_eq!(element_count(&[2, 3, 4]), 24);
    }
}
