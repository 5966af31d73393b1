use crate::graph::ValidationError;
use crate::ops::LoweringError;
use crate::session::device::DeviceError;
use crate::session::memory::AllocationError;

fn describe(step: &str, source: &DeviceError) -> String {
    if source.is_out_of_memory() {
        format!("{} failed: not enough memory resources are available", step)
    } else {
        format!("{} failed: {}", step, source)
    }
}

/// The native compiler rejected the lowered graph.
#[derive(thiserror::Error, Debug)]
#[error("failed to compile the graph: {source}")]
pub struct CompileError {
    #[source]
    pub source: DeviceError,
}

/// Constant upload, persistent resource creation or the initialization
/// submission failed.
#[derive(thiserror::Error, Debug)]
#[error("{}", describe(.step, .source))]
pub struct InitializationError {
    pub step: &'static str,
    #[source]
    pub source: DeviceError,
}

/// Submitting or waiting for a compute failed. The executor stays usable.
#[derive(thiserror::Error, Debug)]
#[error("{}", describe(.step, .source))]
pub struct ExecutionError {
    pub step: &'static str,
    #[source]
    pub source: DeviceError,
}

/// Mapping a staging buffer for the CPU failed.
#[derive(thiserror::Error, Debug)]
#[error("{}", describe(.step, .source))]
pub struct MappingError {
    pub step: &'static str,
    #[source]
    pub source: DeviceError,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid graph: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Lowering(#[from] LoweringError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Initialization(#[from] InitializationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("invalid inputs: {0}")]
    InvalidInputs(String),
}

impl Error {
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            Error::Allocation(e) => e.is_out_of_memory(),
            Error::Compile(CompileError { source })
            | Error::Initialization(InitializationError { source, .. })
            | Error::Execution(ExecutionError { source, .. })
            | Error::Mapping(MappingError { source, .. }) => source.is_out_of_memory(),
            _ => false,
        }
    }
}
