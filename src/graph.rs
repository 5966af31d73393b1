//! Portable graph description.
//!
//! A [`GraphInfo`] is what callers hand to the executor: operands keyed by id,
//! operations in topological order and the raw bytes of every constant. It is
//! plain data and round-trips through serde.

pub mod ops;

use crate::shape::{byte_length, check_element_count, DataType, ShapeError};
use crate::tensor;
use ops::Operation;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;
use tracing::debug;

pub type OperandId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandKind {
    Input,
    Constant,
    /// Graph outputs and intermediate results; only graph outputs are named.
    Output,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operand {
    pub kind: OperandKind,
    pub data_type: DataType,
    pub dimensions: Vec<u32>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Operand {
    pub fn byte_length(&self) -> Result<u64, ShapeError> {
        byte_length(self.data_type, &self.dimensions)
    }
}

#[derive(Error, Debug, Eq, PartialEq)]
pub enum ValidationError {
    #[error("the graph has no {0}")]
    Empty(&'static str),

    #[error("operand {0} does not exist")]
    UnknownOperand(OperandId),

    #[error("operand {id} is invalid: {source}")]
    InvalidOperand {
        id: OperandId,
        #[source]
        source: ShapeError,
    },

    #[error("operand {0} must be named")]
    MissingName(OperandId),

    #[error("the name {0:?} is used by more than one operand")]
    DuplicateName(String),

    #[error("operand {0} must not be named")]
    UnexpectedName(OperandId),

    #[error("the {0} operand list does not match the declared operands")]
    OperandListMismatch(&'static str),

    #[error("constant {id} holds {actual} bytes but {expected} are declared")]
    ConstantLength {
        id: OperandId,
        expected: u64,
        actual: u64,
    },

    #[error("operand {operand} is read by operation {index} before it is defined")]
    UseBeforeDefinition { operand: OperandId, index: usize },

    #[error("operand {operand} cannot be produced by operation {index}")]
    InvalidProducer { operand: OperandId, index: usize },

    #[error("operand {0} is produced more than once")]
    MultipleProducers(OperandId),

    #[error("output operand {0} is never produced")]
    OutputNotProduced(OperandId),

    #[error("no operand ids are left")]
    OutOfIds,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphInfo {
    pub operands: BTreeMap<OperandId, Operand>,
    pub operations: Vec<Operation>,
    pub input_operands: Vec<OperandId>,
    pub output_operands: Vec<OperandId>,
    #[serde(default)]
    pub constants: BTreeMap<OperandId, Vec<u8>>,
}

impl GraphInfo {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> Result<OperandId, ValidationError> {
        match self.operands.keys().next_back() {
            Some(&last) => last.checked_add(1).ok_or(ValidationError::OutOfIds),
            None => Ok(0),
        }
    }

    fn add_operand(&mut self, operand: Operand) -> OperandId {
        let id = self.operands.keys().next_back().map_or(0, |&last| last + 1);
        self.operands.insert(id, operand);
        id
    }

    pub fn add_input(&mut self, name: &str, data_type: DataType, dimensions: &[u32]) -> OperandId {
        let id = self.add_operand(Operand {
            kind: OperandKind::Input,
            data_type,
            dimensions: dimensions.to_vec(),
            name: Some(name.to_string()),
        });
        self.input_operands.push(id);
        id
    }

    pub fn add_constant(&mut self, data_type: DataType, dimensions: &[u32], bytes: Vec<u8>) -> OperandId {
        let id = self.add_operand(Operand {
            kind: OperandKind::Constant,
            data_type,
            dimensions: dimensions.to_vec(),
            name: None,
        });
        self.constants.insert(id, bytes);
        id
    }

    pub fn add_output(&mut self, name: &str, data_type: DataType, dimensions: &[u32]) -> OperandId {
        let id = self.add_operand(Operand {
            kind: OperandKind::Output,
            data_type,
            dimensions: dimensions.to_vec(),
            name: Some(name.to_string()),
        });
        self.output_operands.push(id);
        id
    }

    /// Adds an unnamed operand produced by one operation and read by others.
    pub fn add_intermediate(&mut self, data_type: DataType, dimensions: &[u32]) -> OperandId {
        self.add_operand(Operand {
            kind: OperandKind::Output,
            data_type,
            dimensions: dimensions.to_vec(),
            name: None,
        })
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn operand(&self, id: OperandId) -> Result<&Operand, ValidationError> {
        self.operands.get(&id).ok_or(ValidationError::UnknownOperand(id))
    }

    /// Checks the structural rules every later stage relies on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.operands.is_empty() {
            return Err(ValidationError::Empty("operands"));
        }
        if self.operations.is_empty() {
            return Err(ValidationError::Empty("operations"));
        }
        if self.output_operands.is_empty() {
            return Err(ValidationError::Empty("outputs"));
        }

        let mut names = HashSet::new();
        let mut inputs = BTreeSet::new();
        let mut outputs = BTreeSet::new();
        for (&id, operand) in &self.operands {
            let expected = operand
                .byte_length()
                .and_then(|length| check_element_count(&operand.dimensions).map(|_| length))
                .map_err(|source| ValidationError::InvalidOperand { id, source })?;

            match (operand.kind, &operand.name) {
                (OperandKind::Input, None) => return Err(ValidationError::MissingName(id)),
                (OperandKind::Constant, Some(_)) => return Err(ValidationError::UnexpectedName(id)),
                (_, Some(name)) => {
                    if !names.insert(name.as_str()) {
                        return Err(ValidationError::DuplicateName(name.clone()));
                    }
                }
                _ => (),
            }

            match operand.kind {
                OperandKind::Input => {
                    inputs.insert(id);
                }
                OperandKind::Output if operand.name.is_some() => {
                    outputs.insert(id);
                }
                OperandKind::Constant => {
                    let bytes = self
                        .constants
                        .get(&id)
                        .ok_or(ValidationError::ConstantLength { id, expected, actual: 0 })?;
                    if bytes.len() as u64 != expected {
                        return Err(ValidationError::ConstantLength {
                            id,
                            expected,
                            actual: bytes.len() as u64,
                        });
                    }
                }
                OperandKind::Output => (),
            }
        }

        if !same_ids(&self.input_operands, &inputs) {
            return Err(ValidationError::OperandListMismatch("input"));
        }
        if !same_ids(&self.output_operands, &outputs) {
            return Err(ValidationError::OperandListMismatch("output"));
        }
        if let Some(&id) = self
            .constants
            .keys()
            .find(|id| self.operands.get(id).map(|o| o.kind) != Some(OperandKind::Constant))
        {
            return Err(ValidationError::UnknownOperand(id));
        }

        let mut defined: HashSet<OperandId> = self
            .operands
            .iter()
            .filter(|(_, o)| o.kind != OperandKind::Output)
            .map(|(&id, _)| id)
            .collect();
        for (index, operation) in self.operations.iter().enumerate() {
            for operand in operation.inputs() {
                self.operand(operand)?;
                if !defined.contains(&operand) {
                    return Err(ValidationError::UseBeforeDefinition { operand, index });
                }
            }
            for operand in operation.outputs() {
                if self.operand(operand)?.kind != OperandKind::Output {
                    return Err(ValidationError::InvalidProducer { operand, index });
                }
                if !defined.insert(operand) {
                    return Err(ValidationError::MultipleProducers(operand));
                }
            }
        }

        match self.output_operands.iter().find(|id| !defined.contains(id)) {
            Some(&id) => Err(ValidationError::OutputNotProduced(id)),
            None => Ok(()),
        }
    }
}

fn same_ids(list: &[OperandId], expected: &BTreeSet<OperandId>) -> bool {
    let listed: BTreeSet<OperandId> = list.iter().copied().collect();
    listed.len() == list.len() && &listed == expected
}

fn add_filled_constant(
    graph: &mut GraphInfo,
    data_type: DataType,
    dimensions: &[u32],
    value: f64,
) -> Result<OperandId, ValidationError> {
    let id = graph.next_id()?;
    let count = dimensions.iter().map(|&d| d as usize).product::<usize>();
    let bytes = tensor::encode(data_type, &vec![value; count]);
    graph.operands.insert(
        id,
        Operand {
            kind: OperandKind::Constant,
            data_type,
            dimensions: dimensions.to_vec(),
            name: None,
        },
    );
    graph.constants.insert(id, bytes);
    Ok(id)
}

/// Gives every normalization that needs them explicit scale and bias constants.
///
/// Batch normalization gets a `[1]` scale of 1 and bias of 0 for whichever is
/// missing. Instance and layer normalization only get the missing half when the
/// other half is present; the synthesized constant has one dimension of size 1
/// per normalized axis.
pub fn materialize_defaults(graph: &mut GraphInfo) -> Result<(), ValidationError> {
    for index in 0..graph.operations.len() {
        let (input, scale, bias, rank) = match &graph.operations[index] {
            Operation::BatchNormalization(op) => (op.input, op.scale, op.bias, 1),
            Operation::InstanceNormalization(op) if op.scale.is_some() != op.bias.is_some() => {
                (op.input, op.scale, op.bias, 1)
            }
            Operation::LayerNormalization(op) if op.scale.is_some() != op.bias.is_some() => {
                (op.input, op.scale, op.bias, op.axes.len())
            }
            _ => continue,
        };
        if scale.is_some() && bias.is_some() {
            continue;
        }

        let data_type = graph.operand(input)?.data_type;
        let dims = vec![1; rank];
        let scale = match scale {
            Some(id) => id,
            None => add_filled_constant(graph, data_type, &dims, 1.0)?,
        };
        let bias = match bias {
            Some(id) => id,
            None => add_filled_constant(graph, data_type, &dims, 0.0)?,
        };
        debug!(index, scale, bias, "materialized normalization defaults");

        match &mut graph.operations[index] {
            Operation::BatchNormalization(op) => {
                op.scale = Some(scale);
                op.bias = Some(bias);
            }
            Operation::InstanceNormalization(op) => {
                op.scale = Some(scale);
                op.bias = Some(bias);
            }
            Operation::LayerNormalization(op) => {
                op.scale = Some(scale);
                op.bias = Some(bias);
            }
            _ => (),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ops::*;
    use super::*;

    fn add_graph() -> GraphInfo {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[4]);
        let c = graph.add_constant(DataType::Float32, &[4], tensor::encode(DataType::Float32, &[1.0; 4]));
        let y = graph.add_output("y", DataType::Float32, &[4]);
        graph.push(Operation::ElementWiseBinary(ElementWiseBinary {
            kind: BinaryKind::Add,
            lhs: x,
            rhs: c,
            output: y,
        }));
        graph
    }

    #[test]
    fn test_validate() {
        let graph = add_graph();
        assert_eq!(graph.validate(), Ok(()));
        assert_eq!(graph.input_operands, vec![0]);
        assert_eq!(graph.output_operands, vec![2]);
    }

    #[test]
    fn test_validate_json() {
        let graph = add_graph();
        let json = serde_json::to_string(&graph).unwrap();
        let parsed: GraphInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, graph);
        assert_eq!(parsed.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_constant() {
        let mut graph = add_graph();
        graph.constants.insert(1, vec![0; 12]);
        assert_eq!(
            graph.validate(),
            Err(ValidationError::ConstantLength {
                id: 1,
                expected: 16,
                actual: 12
            })
        );
    }

    #[test]
    fn test_validate_rejects_names() {
        let mut graph = add_graph();
        graph.operands.get_mut(&2).unwrap().name = Some("x".to_string());
        assert_eq!(graph.validate(), Err(ValidationError::DuplicateName("x".to_string())));

        let mut graph = add_graph();
        graph.operands.get_mut(&0).unwrap().name = None;
        assert_eq!(graph.validate(), Err(ValidationError::MissingName(0)));

        let mut graph = add_graph();
        graph.operands.get_mut(&1).unwrap().name = Some("c".to_string());
        assert_eq!(graph.validate(), Err(ValidationError::UnexpectedName(1)));
    }

    #[test]
    fn test_validate_rejects_order() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[2]);
        let t = graph.add_intermediate(DataType::Float32, &[2]);
        let y = graph.add_output("y", DataType::Float32, &[2]);
        graph.push(Operation::Relu(Unary { input: t, output: y }));
        graph.push(Operation::Relu(Unary { input: x, output: t }));
        assert_eq!(
            graph.validate(),
            Err(ValidationError::UseBeforeDefinition { operand: t, index: 0 })
        );

        graph.operations.reverse();
        assert_eq!(graph.validate(), Ok(()));

        graph.push(Operation::Relu(Unary { input: x, output: t }));
        assert_eq!(graph.validate(), Err(ValidationError::MultipleProducers(t)));
    }

    #[test]
    fn test_validate_rejects_missing_output() {
        let mut graph = add_graph();
        graph.add_output("z", DataType::Float32, &[4]);
        assert_eq!(graph.validate(), Err(ValidationError::OutputNotProduced(3)));

        let mut graph = add_graph();
        graph.output_operands.clear();
        assert_eq!(graph.validate(), Err(ValidationError::Empty("outputs")));
    }

    #[test]
    fn test_validate_rejects_zero_dimension() {
        let mut graph = add_graph();
        graph.operands.get_mut(&0).unwrap().dimensions = vec![4, 0];
        assert_eq!(
            graph.validate(),
            Err(ValidationError::InvalidOperand {
                id: 0,
                source: ShapeError::ZeroDimension { index: 1 }
            })
        );
    }

    #[test]
    fn test_validate_rejects_unaddressable_operand() {
        let mut graph = add_graph();
        graph.operands.get_mut(&0).unwrap().dimensions = vec![65536, 65536];
        assert_eq!(
            graph.validate(),
            Err(ValidationError::InvalidOperand {
                id: 0,
                source: ShapeError::TooManyElements { count: 1 << 32 }
            })
        );
    }

    #[test]
    fn test_materialize_batch_normalization() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float16, &[1, 2, 3, 3]);
        let mean = graph.add_constant(DataType::Float16, &[2], vec![0; 4]);
        let variance = graph.add_constant(DataType::Float16, &[2], vec![0; 4]);
        let y = graph.add_output("y", DataType::Float16, &[1, 2, 3, 3]);
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
        assert_eq!(graph.validate(), Ok(()));

        let Operation::BatchNormalization(op) = &graph.operations[0] else {
            panic!("operation kind changed");
        };
        assert_eq!((op.scale, op.bias), (Some(4), Some(5)));
        assert_eq!(graph.operands[&4].dimensions, vec![1]);
        assert_eq!(tensor::decode(DataType::Float16, &graph.constants[&4]).unwrap(), vec![1.0]);
        assert_eq!(tensor::decode(DataType::Float16, &graph.constants[&5]).unwrap(), vec![0.0]);
    }

    #[test]
    fn test_materialize_layer_normalization() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[2, 3, 4]);
        let scale = graph.add_constant(DataType::Float32, &[3, 4], vec![0; 48]);
        let y = graph.add_output("y", DataType::Float32, &[2, 3, 4]);
        graph.push(Operation::LayerNormalization(LayerNormalization {
            input: x,
            scale: Some(scale),
            bias: None,
            output: y,
            axes: vec![1, 2],
            epsilon: 1e-5,
        }));
        materialize_defaults(&mut graph).unwrap();

        let Operation::LayerNormalization(op) = &graph.operations[0] else {
            panic!("operation kind changed");
        };
        assert_eq!(op.bias, Some(3));
        assert_eq!(graph.operands[&3].dimensions, vec![1, 1]);
        assert_eq!(graph.constants[&3].len(), 4);
    }

    #[test]
    fn test_materialize_skips_absent_pairs() {
        let mut graph = GraphInfo::new();
        let x = graph.add_input("x", DataType::Float32, &[1, 2, 2, 2]);
        let y = graph.add_output("y", DataType::Float32, &[1, 2, 2, 2]);
        graph.push(Operation::InstanceNormalization(InstanceNormalization {
            input: x,
            scale: None,
            bias: None,
            output: y,
            epsilon: 1e-5,
            layout: InputOperandLayout::ChannelsFirst,
        }));
        let before = graph.clone();
        materialize_defaults(&mut graph).unwrap();
        assert_eq!(graph, before);
    }
}
