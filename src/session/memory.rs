//! Device buffers a compiled graph needs besides the operator itself.
//!
//! Inputs and outputs are packed into one buffer each, laid out by the
//! planner. Without unified memory every packed buffer has a CPU-visible
//! twin (upload or readback) and the recorded command list copies between
//! them; with unified memory the CPU maps the device buffers directly.

use crate::backend::{BufferBinding, CompiledOperator, ExecutionBindings};
use crate::graph::OperandId;
use crate::ops::{ComputeResourceInfo, GraphBufferBindingInfo};
use crate::session::command::CommandRecorder;
use crate::session::device::{Buffer, DescriptorHeap, DeviceError};
use crate::session::planner::{plan, AlignedByteLength, PlanError};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error, instrument};

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("failed to allocate {label}: not enough memory resources are available")]
    OutOfMemory {
        label: String,
        #[source]
        source: DeviceError,
    },

    #[error("failed to allocate {label}: {source}")]
    Device {
        label: String,
        #[source]
        source: DeviceError,
    },

    #[error(transparent)]
    Planning(#[from] PlanError),
}

impl AllocationError {
    fn new(label: &str, source: DeviceError) -> Self {
        error!(label, "allocation failed: {}", source);
        let label = label.to_string();
        if source.is_out_of_memory() {
            AllocationError::OutOfMemory { label, source }
        } else {
            AllocationError::Device { label, source }
        }
    }

    /// Out of memory is the one allocation failure worth retrying once memory
    /// has been released.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, AllocationError::OutOfMemory { .. })
    }
}

fn allocate(
    label: &str,
    create: impl FnOnce(u64, &str) -> Result<Buffer, DeviceError>,
    size: u64,
) -> Result<Buffer, AllocationError> {
    create(size, label).map_err(|e| AllocationError::new(label, e))
}

/// Per-compute buffers: packed inputs and outputs, their staging twins and
/// the operator's scratch memory.
#[derive(Debug)]
pub struct ComputeResources {
    pub descriptor_heap: DescriptorHeap,
    pub input_plan: AlignedByteLength<String>,
    /// CPU-written staging buffer for the inputs; absent with unified memory.
    pub upload_buffer: Option<Buffer>,
    /// Absent when the graph has no inputs.
    pub input_buffer: Option<Buffer>,
    pub output_plan: AlignedByteLength<String>,
    pub output_buffer: Buffer,
    /// CPU-read staging buffer for the outputs; absent with unified memory.
    pub readback_buffer: Option<Buffer>,
    pub temporary_buffer: Option<Buffer>,
}

impl ComputeResources {
    /// The buffer the CPU writes named inputs into.
    pub fn input_staging(&self) -> Option<&Buffer> {
        self.upload_buffer.as_ref().or(self.input_buffer.as_ref())
    }

    /// The buffer the CPU reads named outputs from.
    pub fn output_staging(&self) -> &Buffer {
        self.readback_buffer.as_ref().unwrap_or(&self.output_buffer)
    }

    /// Execution bindings: each named input and output at its planned
    /// range, constant slots left unbound.
    pub fn execution_bindings(
        &self,
        binding_info: &GraphBufferBindingInfo,
        persistent: Option<&Buffer>,
    ) -> ExecutionBindings {
        let mut inputs = vec![None; binding_info.input_buffer_binding_count as usize];
        if let Some(buffer) = &self.input_buffer {
            for (name, &slot) in &binding_info.inputs {
                if let Some(range) = self.input_plan.range(name) {
                    inputs[slot as usize] = Some(BufferBinding::new(buffer.clone(), range.clone()));
                }
            }
        }
        let mut outputs = vec![None; binding_info.outputs.len()];
        for (name, &slot) in &binding_info.outputs {
            if let Some(range) = self.output_plan.range(name) {
                outputs[slot as usize] = Some(BufferBinding::new(self.output_buffer.clone(), range.clone()));
            }
        }
        ExecutionBindings {
            inputs,
            outputs,
            persistent: persistent.cloned().map(BufferBinding::whole),
            temporary: self.temporary_buffer.clone().map(BufferBinding::whole),
        }
    }
}

#[instrument(skip_all, fields(inputs = info.input_byte_lengths.len(), outputs = info.output_byte_lengths.len()))]
pub fn allocate_compute_resources(
    recorder: &CommandRecorder,
    operator: &dyn CompiledOperator,
    info: &ComputeResourceInfo,
) -> Result<ComputeResources, AllocationError> {
    let properties = operator.binding_properties();
    let input_plan = plan(&info.input_byte_lengths)?;
    let output_plan = plan(&info.output_byte_lengths)?;

    let (upload_buffer, input_buffer) = match input_plan.total {
        0 => (None, None),
        size if recorder.is_uma() => (
            None,
            Some(allocate("inputs", |s, l| recorder.create_custom_upload_buffer(s, l), size)?),
        ),
        size => (
            Some(allocate("input upload", |s, l| recorder.create_upload_buffer(s, l), size)?),
            Some(allocate("inputs", |s, l| recorder.create_default_buffer(s, l), size)?),
        ),
    };
    let (output_buffer, readback_buffer) = if recorder.is_uma() {
        let output = allocate(
            "outputs",
            |s, l| recorder.create_custom_readback_buffer(s, l),
            output_plan.total,
        )?;
        (output, None)
    } else {
        let output = allocate("outputs", |s, l| recorder.create_default_buffer(s, l), output_plan.total)?;
        let readback = allocate(
            "output readback",
            |s, l| recorder.create_readback_buffer(s, l),
            output_plan.total,
        )?;
        (output, Some(readback))
    };
    let temporary_buffer = match properties.temporary_resource_size {
        0 => None,
        size => Some(allocate("temporary", |s, l| recorder.create_default_buffer(s, l), size)?),
    };
    let descriptor_heap = recorder
        .device()
        .create_descriptor_heap(properties.required_descriptor_count)
        .map_err(|e| AllocationError::new("descriptor heap", e))?;

    debug!(
        input_bytes = input_plan.total,
        output_bytes = output_plan.total,
        temporary_bytes = properties.temporary_resource_size,
        "compute resources allocated"
    );
    Ok(ComputeResources {
        descriptor_heap,
        input_plan,
        upload_buffer,
        input_buffer,
        output_plan,
        output_buffer,
        readback_buffer,
        temporary_buffer,
    })
}

/// Staging for the constant operands, used once during initialization.
#[derive(Debug)]
pub struct ConstantResources {
    pub plan: AlignedByteLength<OperandId>,
    /// CPU-written; with unified memory it is also what the operator reads.
    pub upload_buffer: Buffer,
    pub default_buffer: Option<Buffer>,
}

impl ConstantResources {
    /// The buffer initialization reads the constants from.
    pub fn device_buffer(&self) -> &Buffer {
        self.default_buffer.as_ref().unwrap_or(&self.upload_buffer)
    }

    /// Initialization inputs: every constant slot bound at its planned range.
    pub fn bindings(&self, binding_info: &GraphBufferBindingInfo) -> Vec<Option<BufferBinding>> {
        let mut inputs = vec![None; binding_info.input_buffer_binding_count as usize];
        for (id, &slot) in &binding_info.constants {
            if let Some(range) = self.plan.range(id) {
                inputs[slot as usize] = Some(BufferBinding::new(self.device_buffer().clone(), range.clone()));
            }
        }
        inputs
    }
}

/// Allocates staging for `lengths`; `None` when there are no constants.
#[instrument(skip_all, fields(constants = lengths.len()))]
pub fn allocate_constant_resources(
    recorder: &CommandRecorder,
    lengths: &BTreeMap<OperandId, u64>,
) -> Result<Option<ConstantResources>, AllocationError> {
    let plan = plan(lengths)?;
    if plan.total == 0 {
        return Ok(None);
    }
    let resources = if recorder.is_uma() {
        ConstantResources {
            upload_buffer: allocate("constants", |s, l| recorder.create_custom_upload_buffer(s, l), plan.total)?,
            default_buffer: None,
            plan,
        }
    } else {
        ConstantResources {
            upload_buffer: allocate("constant upload", |s, l| recorder.create_upload_buffer(s, l), plan.total)?,
            default_buffer: Some(allocate("constants", |s, l| recorder.create_default_buffer(s, l), plan.total)?),
            plan,
        }
    };
    Ok(Some(resources))
}

/// The operator's persistent resource; `None` when it needs none.
pub fn allocate_persistent_resource(recorder: &CommandRecorder, size: u64) -> Result<Option<Buffer>, AllocationError> {
    match size {
        0 => Ok(None),
        size => allocate("persistent", |s, l| recorder.create_default_buffer(s, l), size).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCapabilities, BindingProperties};
    use crate::session::device::{Device, HeapKind};

    #[derive(Debug)]
    struct Scratch(u64);

    impl CompiledOperator for Scratch {
        fn binding_properties(&self) -> BindingProperties {
            BindingProperties {
                required_descriptor_count: 3,
                temporary_resource_size: self.0,
                persistent_resource_size: 0,
            }
        }

        fn initialize(&self, _: &[Option<BufferBinding>], _: Option<&BufferBinding>) -> Result<(), DeviceError> {
            Ok(())
        }

        fn execute(&self, _: &ExecutionBindings) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn recorder(unified_memory: bool, memory_budget: Option<u64>) -> CommandRecorder {
        let device = Device::new(BackendCapabilities {
            unified_memory,
            memory_budget,
            ..Default::default()
        })
        .unwrap();
        CommandRecorder::create(&device).unwrap()
    }

    fn info(inputs: &[(&str, u64)], outputs: &[(&str, u64)]) -> ComputeResourceInfo {
        ComputeResourceInfo {
            input_byte_lengths: inputs.iter().map(|&(n, l)| (n.to_string(), l)).collect(),
            output_byte_lengths: outputs.iter().map(|&(n, l)| (n.to_string(), l)).collect(),
        }
    }

    #[test]
    fn test_staged_resources() {
        let recorder = recorder(false, None);
        let resources =
            allocate_compute_resources(&recorder, &Scratch(64), &info(&[("a", 4), ("b", 20)], &[("y", 8)])).unwrap();
        assert_eq!(resources.input_plan.total, 48);
        assert_eq!(resources.upload_buffer.as_ref().unwrap().heap(), HeapKind::Upload);
        assert_eq!(resources.input_buffer.as_ref().unwrap().heap(), HeapKind::Default);
        assert_eq!(resources.output_staging().heap(), HeapKind::Readback);
        assert_eq!(resources.temporary_buffer.as_ref().unwrap().size(), 64);
        assert_eq!(resources.descriptor_heap.size(), 3);
        assert_eq!(recorder.device().stats().live_buffers, 5);
    }

    #[test]
    fn test_unified_memory_resources() {
        let recorder = recorder(true, None);
        let resources = allocate_compute_resources(&recorder, &Scratch(0), &info(&[], &[("y", 8)])).unwrap();
        assert!(resources.input_staging().is_none());
        assert!(resources.readback_buffer.is_none());
        assert!(resources.temporary_buffer.is_none());
        assert_eq!(resources.output_staging().heap(), HeapKind::CustomReadback);
        assert_eq!(recorder.device().stats().live_buffers, 1);
    }

    #[test]
    fn test_execution_bindings() {
        let recorder = recorder(false, None);
        let resources =
            allocate_compute_resources(&recorder, &Scratch(16), &info(&[("a", 4), ("b", 4)], &[("y", 4)])).unwrap();
        let binding_info = GraphBufferBindingInfo {
            inputs: BTreeMap::from([("a".to_string(), 0), ("b".to_string(), 1)]),
            outputs: BTreeMap::from([("y".to_string(), 0)]),
            constants: BTreeMap::from([(7, 2)]),
            input_buffer_binding_count: 3,
        };
        let bindings = resources.execution_bindings(&binding_info, None);
        assert_eq!(bindings.inputs.len(), 3);
        assert_eq!(bindings.inputs[1].as_ref().unwrap().range(), 16..32);
        assert!(bindings.inputs[2].is_none());
        assert_eq!(bindings.outputs[0].as_ref().unwrap().range(), 0..16);
        assert!(bindings.persistent.is_none());
        assert_eq!(bindings.temporary.as_ref().unwrap().size, 16);
    }

    #[test]
    fn test_out_of_memory() {
        let recorder = recorder(false, Some(56));
        let err = allocate_compute_resources(&recorder, &Scratch(0), &info(&[("a", 16)], &[("y", 16)])).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(
            err.to_string(),
            "failed to allocate output readback: not enough memory resources are available"
        );
    }

    #[test]
    fn test_constant_resources() {
        let recorder = recorder(false, None);
        assert!(allocate_constant_resources(&recorder, &BTreeMap::new()).unwrap().is_none());

        let constants = allocate_constant_resources(&recorder, &BTreeMap::from([(3, 8), (5, 4)]))
            .unwrap()
            .unwrap();
        let binding_info = GraphBufferBindingInfo {
            constants: BTreeMap::from([(3, 1), (5, 2)]),
            input_buffer_binding_count: 3,
            ..Default::default()
        };
        let bindings = constants.bindings(&binding_info);
        assert!(bindings[0].is_none());
        let binding = bindings[2].as_ref().unwrap();
        assert_eq!(binding.range(), 16..32);
        assert!(binding.buffer.ptr_eq(constants.device_buffer()));
        assert_eq!(constants.device_buffer().heap(), HeapKind::Default);

        assert!(allocate_persistent_resource(&recorder, 0).unwrap().is_none());
        assert_eq!(allocate_persistent_resource(&recorder, 12).unwrap().unwrap().size(), 12);
    }
}
