use crate::backend::{BufferBinding, CompiledOperator, ExecutionBindings};
use crate::session::device::{Buffer, Command, CommandList, DescriptorHeap, Device, DeviceError, HeapKind};
use std::sync::Arc;
use tracing::trace;

/// Records operator initialization, execution and buffer copies into one
/// command list and submits it to the device queue.
///
/// A recorded list can be submitted again with [`CommandRecorder::execute`]
/// as long as the buffers it references are alive.
#[derive(Debug)]
pub struct CommandRecorder {
    device: Device,
    list: CommandList,
    last_fence: u64,
}

impl CommandRecorder {
    pub fn create(device: &Device) -> Result<Self, DeviceError> {
        let mut list = device.create_command_list()?;
        list.close();
        Ok(CommandRecorder {
            device: device.clone(),
            list,
            last_fence: 0,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_uma(&self) -> bool {
        self.device.capabilities().unified_memory
    }

    /// Fence of the last submission of this recorder; 0 before the first.
    pub fn last_fence(&self) -> u64 {
        self.last_fence
    }

    /// Discards the recorded commands and starts a new recording.
    ///
    /// Fails while the previous submission is still executing.
    pub fn open(&mut self) -> Result<(), DeviceError> {
        let completed = self.device.queue().completed_fence();
        if completed < self.last_fence {
            return Err(DeviceError::InvalidArgument(format!(
                "submission {} of this recorder is still executing",
                self.last_fence
            )));
        }
        self.list.reset();
        Ok(())
    }

    pub fn close(&mut self) {
        self.list.close();
    }

    /// Submits the recorded list and returns its fence.
    pub fn execute(&mut self) -> Result<u64, DeviceError> {
        let fence = self.device.queue().execute(&self.list)?;
        trace!(fence, commands = self.list.len(), "recorder submitted");
        self.last_fence = fence;
        Ok(fence)
    }

    pub fn close_and_execute(&mut self) -> Result<u64, DeviceError> {
        self.close();
        self.execute()
    }

    /// Records initialization of `operator`; `inputs` has one slot per graph
    /// input, bound only for the inputs owned by the backend.
    pub fn initialize_operator(
        &mut self,
        operator: &Arc<dyn CompiledOperator>,
        inputs: Vec<Option<BufferBinding>>,
        persistent: Option<BufferBinding>,
    ) -> Result<(), DeviceError> {
        let count = operator.binding_properties().required_descriptor_count;
        let heap = self.device.create_descriptor_heap(count)?;
        self.list.record(Command::InitializeOperator {
            operator: operator.clone(),
            heap,
            inputs,
            persistent,
        })?;
        self.list.record(Command::Barrier)
    }

    pub fn execute_operator(
        &mut self,
        operator: &Arc<dyn CompiledOperator>,
        heap: DescriptorHeap,
        bindings: ExecutionBindings,
    ) -> Result<(), DeviceError> {
        self.list.record(Command::ExecuteOperator {
            operator: operator.clone(),
            heap,
            bindings,
        })?;
        self.list.record(Command::Barrier)
    }

    /// Copies the first `size` bytes of `src` into `dst` and makes them
    /// visible to the commands recorded after.
    pub fn upload_buffer_with_barrier(&mut self, dst: &Buffer, src: &Buffer, size: u64) -> Result<(), DeviceError> {
        self.list.record(Command::CopyBuffer {
            dst: dst.clone(),
            dst_offset: 0,
            src: src.clone(),
            src_offset: 0,
            size,
        })?;
        self.list.record(Command::Barrier)
    }

    /// Waits for earlier writes to `src`, then copies its first `size` bytes
    /// into `dst`.
    pub fn readback_buffer_with_barrier(&mut self, dst: &Buffer, src: &Buffer, size: u64) -> Result<(), DeviceError> {
        self.list.record(Command::Barrier)?;
        self.list.record(Command::CopyBuffer {
            dst: dst.clone(),
            dst_offset: 0,
            src: src.clone(),
            src_offset: 0,
            size,
        })
    }

    pub fn create_default_buffer(&self, size: u64, label: &str) -> Result<Buffer, DeviceError> {
        self.device.create_buffer(HeapKind::Default, size, label)
    }

    pub fn create_upload_buffer(&self, size: u64, label: &str) -> Result<Buffer, DeviceError> {
        self.device.create_buffer(HeapKind::Upload, size, label)
    }

    pub fn create_readback_buffer(&self, size: u64, label: &str) -> Result<Buffer, DeviceError> {
        self.device.create_buffer(HeapKind::Readback, size, label)
    }

    pub fn create_custom_upload_buffer(&self, size: u64, label: &str) -> Result<Buffer, DeviceError> {
        self.device.create_buffer(HeapKind::CustomUpload, size, label)
    }

    pub fn create_custom_readback_buffer(&self, size: u64, label: &str) -> Result<Buffer, DeviceError> {
        self.device.create_buffer(HeapKind::CustomReadback, size, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendCapabilities;
    use crate::session::device::Fault;
    use futures::executor::block_on;

    fn recorder(unified_memory: bool) -> CommandRecorder {
        let device = Device::new(BackendCapabilities {
            unified_memory,
            ..Default::default()
        })
        .unwrap();
        CommandRecorder::create(&device).unwrap()
    }

    #[test]
    fn test_upload_and_readback() {
        let mut recorder = recorder(false);
        assert!(!recorder.is_uma());
        let upload = recorder.create_upload_buffer(8, "upload").unwrap();
        let local = recorder.create_default_buffer(8, "local").unwrap();
        let readback = recorder.create_readback_buffer(8, "readback").unwrap();
        upload.map().unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        recorder.open().unwrap();
        recorder.upload_buffer_with_barrier(&local, &upload, 8).unwrap();
        recorder.readback_buffer_with_barrier(&readback, &local, 6).unwrap();
        let fence = recorder.close_and_execute().unwrap();
        block_on(recorder.device().queue().wait_for(fence)).unwrap();
        assert_eq!(&*readback.map().unwrap(), &[1, 2, 3, 4, 5, 6, 0, 0]);
        assert_eq!(recorder.device().stats().barriers_executed, 2);

        // re-submitting the same recording copies the new upload contents
        upload.map().unwrap().copy_from_slice(&[9; 8]);
        let fence = recorder.execute().unwrap();
        block_on(recorder.device().queue().wait_for(fence)).unwrap();
        assert_eq!(&*readback.map().unwrap(), &[9, 9, 9, 9, 9, 9, 0, 0]);
    }

    #[test]
    fn test_record_requires_open() {
        let mut recorder = recorder(true);
        assert!(recorder.is_uma());
        let buffer = recorder.create_custom_upload_buffer(4, "a").unwrap();
        assert!(recorder.upload_buffer_with_barrier(&buffer, &buffer, 4).is_err());
        recorder.open().unwrap();
        recorder.upload_buffer_with_barrier(&buffer, &buffer, 4).unwrap();
    }

    #[test]
    fn test_failed_submission_is_reported() {
        let mut recorder = recorder(false);
        recorder.open().unwrap();
        recorder.close();
        recorder.device().inject_fault(Fault::Execution);
        let fence = recorder.execute().unwrap();
        assert_eq!(recorder.last_fence(), fence);
        assert!(block_on(recorder.device().queue().wait_for(fence)).is_err());
        recorder.open().unwrap();
    }
}
