//! Seam between the executor and a native operator library.

pub mod native;

use crate::ir::GraphDesc;
use crate::session::device::{Buffer, DeviceError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Operator library feature level. Later levels add native operators that
/// earlier ones only get as compositions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum FeatureLevel {
    #[default]
    #[serde(rename = "4.0")]
    V4_0,
    #[serde(rename = "5.0")]
    V5_0,
    #[serde(rename = "5.2")]
    V5_2,
    #[serde(rename = "6.2")]
    V6_2,
    #[serde(rename = "6.3")]
    V6_3,
}

impl FeatureLevel {
    pub fn has_native_negate(self) -> bool {
        self >= FeatureLevel::V5_0
    }

    pub fn has_native_hard_swish(self) -> bool {
        self >= FeatureLevel::V6_2
    }

    pub fn allows_softplus_below_one(self) -> bool {
        self >= FeatureLevel::V6_3
    }
}

impl fmt::Display for FeatureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeatureLevel::V4_0 => "4.0",
            FeatureLevel::V5_0 => "5.0",
            FeatureLevel::V5_2 => "5.2",
            FeatureLevel::V6_2 => "6.2",
            FeatureLevel::V6_3 => "6.3",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Eq, PartialEq)]
#[error("unknown feature level {0:?}")]
pub struct UnknownFeatureLevel(pub String);

impl FromStr for FeatureLevel {
    type Err = UnknownFeatureLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "4.0" => Ok(FeatureLevel::V4_0),
            "5.0" => Ok(FeatureLevel::V5_0),
            "5.2" => Ok(FeatureLevel::V5_2),
            "6.2" => Ok(FeatureLevel::V6_2),
            "6.3" => Ok(FeatureLevel::V6_3),
            _ => Err(UnknownFeatureLevel(s.to_string())),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendCapabilities {
    pub feature_level: FeatureLevel,
    /// CPU and accelerator share memory, so buffers can be mapped directly
    /// instead of staged through upload and readback heaps.
    pub unified_memory: bool,
    /// Bytes the device may have allocated at once; unlimited when absent.
    pub memory_budget: Option<u64>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BindingProperties {
    pub required_descriptor_count: u32,
    pub temporary_resource_size: u64,
    pub persistent_resource_size: u64,
}

/// A byte range of a device buffer bound to one operator slot.
#[derive(Clone, Debug)]
pub struct BufferBinding {
    pub buffer: Buffer,
    pub offset: u64,
    pub size: u64,
}

impl BufferBinding {
    pub fn new(buffer: Buffer, range: Range<u64>) -> Self {
        BufferBinding {
            buffer,
            offset: range.start,
            size: range.end - range.start,
        }
    }

    pub fn whole(buffer: Buffer) -> Self {
        let size = buffer.size();
        BufferBinding {
            buffer,
            offset: 0,
            size,
        }
    }

    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecutionBindings {
    pub inputs: Vec<Option<BufferBinding>>,
    pub outputs: Vec<Option<BufferBinding>>,
    pub persistent: Option<BufferBinding>,
    pub temporary: Option<BufferBinding>,
}

/// A compiled operator graph.
///
/// `initialize` runs once and receives only the graph inputs flagged as owned
/// by the backend; everything else is bound on each `execute`.
pub trait CompiledOperator: Send + Sync + fmt::Debug {
    fn binding_properties(&self) -> BindingProperties;

    fn initialize(&self, inputs: &[Option<BufferBinding>], persistent: Option<&BufferBinding>) -> Result<(), DeviceError>;

    fn execute(&self, bindings: &ExecutionBindings) -> Result<(), DeviceError>;
}

pub trait Backend: Send + Sync + fmt::Debug {
    fn compile(&self, graph: GraphDesc) -> Result<Arc<dyn CompiledOperator>, DeviceError>;
}
