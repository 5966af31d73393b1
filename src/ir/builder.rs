use crate::ir::{DescError, GraphDesc, InputEdge, IntermediateEdge, OperatorDesc, OutputEdge};
use crate::shape::TensorDescriptor;
use thiserror::Error;

pub type NodeId = usize;
pub type NodeOutputId = usize;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum BuilderError {
    #[error(transparent)]
    InvalidOperator(#[from] DescError),

    #[error("{operator} has {expected} connected inputs but {actual} were given")]
    InputCount {
        operator: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("node output {0} does not exist")]
    UnknownNodeOutput(NodeOutputId),

    #[error("a graph input cannot be bound directly as a graph output")]
    InputAsOutput,
}

#[derive(Clone, Copy, Debug)]
enum Node {
    Input { graph_input_index: u32 },
    Operator { index: u32, output_count: usize },
}

/// One output of a node as seen by its consumers.
///
/// Several node outputs may refer to the same node and output index with
/// different descriptors; that is how reshapes are expressed without a copy.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeOutput {
    pub node: NodeId,
    pub output_index: u32,
    pub desc: TensorDescriptor,
}

/// Append-only arena the lowering functions build a [`GraphDesc`] in.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    node_outputs: Vec<NodeOutput>,
    graph: GraphDesc,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the node and the graph input index it is bound to.
    pub fn create_input_node(&mut self) -> (NodeId, u32) {
        let graph_input_index = self.graph.input_count;
        self.graph.input_count += 1;
        self.nodes.push(Node::Input { graph_input_index });
        (self.nodes.len() - 1, graph_input_index)
    }

    /// Adds an operator node reading `inputs`, one per connected input slot
    /// of `desc` in slot order.
    pub fn create_operator_node(&mut self, desc: OperatorDesc, inputs: &[NodeOutputId]) -> Result<NodeId, BuilderError> {
        desc.validate()?;

        let slots: Vec<u32> = (0..desc.inputs.len() as u32)
            .filter(|&slot| desc.inputs[slot as usize].is_some())
            .collect();
        if slots.len() != inputs.len() {
            return Err(BuilderError::InputCount {
                operator: desc.operator.name(),
                expected: slots.len(),
                actual: inputs.len(),
            });
        }

        let to_node = self.graph.nodes.len() as u32;
        for (&slot, &id) in slots.iter().zip(inputs) {
            let output = self.node_outputs.get(id).ok_or(BuilderError::UnknownNodeOutput(id))?;
            match self.nodes[output.node] {
                Node::Input { graph_input_index } => self.graph.input_edges.push(InputEdge {
                    graph_input_index,
                    to_node,
                    to_node_input_index: slot,
                }),
                Node::Operator { index, .. } => self.graph.intermediate_edges.push(IntermediateEdge {
                    from_node: index,
                    from_node_output_index: output.output_index,
                    to_node,
                    to_node_input_index: slot,
                }),
            }
        }

        self.nodes.push(Node::Operator {
            index: to_node,
            output_count: desc.outputs.len(),
        });
        self.graph.nodes.push(desc);
        Ok(self.nodes.len() - 1)
    }

    pub fn create_node_output(&mut self, node: NodeId, output_index: u32, desc: TensorDescriptor) -> NodeOutputId {
        let output_count = match self.nodes[node] {
            Node::Input { .. } => 1,
            Node::Operator { output_count, .. } => output_count,
        };
        assert!(
            (output_index as usize) < output_count,
            "node {} has no output {}",
            node,
            output_index
        );
        self.node_outputs.push(NodeOutput {
            node,
            output_index,
            desc,
        });
        self.node_outputs.len() - 1
    }

    pub fn node_output(&self, id: NodeOutputId) -> &NodeOutput {
        &self.node_outputs[id]
    }

    pub fn is_input_node(&self, node: NodeId) -> bool {
        matches!(self.nodes[node], Node::Input { .. })
    }

    /// Binds `id` to the next graph output and returns that output's index.
    pub fn create_output_edge(&mut self, id: NodeOutputId) -> Result<u32, BuilderError> {
        let output = self.node_outputs.get(id).ok_or(BuilderError::UnknownNodeOutput(id))?;
        let Node::Operator { index, .. } = self.nodes[output.node] else {
            return Err(BuilderError::InputAsOutput);
        };
        let graph_output_index = self.graph.output_count;
        self.graph.output_count += 1;
        self.graph.output_edges.push(OutputEdge {
            from_node: index,
            from_node_output_index: output.output_index,
            graph_output_index,
        });
        Ok(graph_output_index)
    }

    pub fn input_count(&self) -> u32 {
        self.graph.input_count
    }

    pub fn operator_count(&self) -> usize {
        self.graph.nodes.len()
    }

    pub fn finish(self) -> GraphDesc {
        self.graph
    }
}
