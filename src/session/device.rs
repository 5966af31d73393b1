// Simulated accelerator device: heaps, buffers, descriptor heaps and command lists.

use crate::backend::native::Native;
use crate::backend::{Backend, BackendCapabilities, BufferBinding, CompiledOperator, ExecutionBindings};
use crate::ir::GraphDesc;
use crate::session::reactor::CommandQueue;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt::{self, Debug, Formatter};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("out of memory: {requested} bytes requested with {in_use} of {budget} bytes in use")]
    OutOfMemory { requested: u64, in_use: u64, budget: u64 },

    #[error("the device was removed: {reason}")]
    Removed { reason: String },

    #[error("buffer {label:?} is not visible to the CPU")]
    NotMappable { label: String },

    #[error("invalid binding: {0}")]
    InvalidBinding(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("injected {0:?} fault")]
    Injected(Fault),

    #[error("failed to start a device thread")]
    Thread(#[source] std::io::Error),
}

impl DeviceError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, DeviceError::OutOfMemory { .. })
    }
}

/// Failure that the device reports exactly once, at the next matching step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    Compile,
    Submit,
    Execution,
    Map,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeapKind {
    /// Accelerator-local memory, never mapped.
    Default,
    Upload,
    Readback,
    /// Unified memory counterparts of the upload and readback heaps.
    CustomUpload,
    CustomReadback,
}

impl HeapKind {
    pub fn is_cpu_visible(self) -> bool {
        !matches!(self, HeapKind::Default)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeviceStats {
    pub memory_in_use: u64,
    pub live_buffers: usize,
    pub buffers_created: usize,
    pub live_command_lists: usize,
    pub barriers_executed: usize,
}

#[derive(Debug)]
pub(crate) struct DeviceShared {
    capabilities: BackendCapabilities,
    memory_in_use: AtomicU64,
    live_buffers: AtomicUsize,
    buffers_created: AtomicUsize,
    live_command_lists: AtomicUsize,
    barriers_executed: AtomicUsize,
    removed: Mutex<Option<String>>,
    faults: Mutex<Vec<Fault>>,
}

impl DeviceShared {
    pub(crate) fn check_removed(&self) -> Result<(), DeviceError> {
        match &*self.removed.lock() {
            Some(reason) => Err(DeviceError::Removed { reason: reason.clone() }),
            None => Ok(()),
        }
    }

    pub(crate) fn take_fault(&self, fault: Fault) -> Result<(), DeviceError> {
        let mut faults = self.faults.lock();
        match faults.iter().position(|f| *f == fault) {
            Some(index) => {
                faults.remove(index);
                Err(DeviceError::Injected(fault))
            }
            None => Ok(()),
        }
    }

    fn reserve(&self, size: u64) -> Result<(), DeviceError> {
        let budget = self.capabilities.memory_budget.unwrap_or(u64::MAX);
        self.memory_in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |in_use| {
                in_use.checked_add(size).filter(|&total| total <= budget)
            })
            .map(|_| ())
            .map_err(|in_use| DeviceError::OutOfMemory {
                requested: size,
                in_use,
                budget,
            })
    }
}

struct BufferInner {
    storage: RwLock<Vec<u8>>,
    heap: HeapKind,
    label: String,
    size: u64,
    shared: Arc<DeviceShared>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        self.shared.memory_in_use.fetch_sub(self.size, Ordering::SeqCst);
        self.shared.live_buffers.fetch_sub(1, Ordering::SeqCst);
        trace!(label = %self.label, size = self.size, "buffer released");
    }
}

/// Reference-counted device buffer. Clones share the same memory.
#[derive(Clone)]
pub struct Buffer(Arc<BufferInner>);

impl Buffer {
    pub fn size(&self) -> u64 {
        self.0.size
    }

    pub fn heap(&self) -> HeapKind {
        self.0.heap
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Maps a CPU-visible buffer for reading and writing.
    pub fn map(&self) -> Result<MappedBuffer<'_>, DeviceError> {
        if !self.0.heap.is_cpu_visible() {
            return Err(DeviceError::NotMappable {
                label: self.0.label.clone(),
            });
        }
        self.0.shared.check_removed()?;
        self.0.shared.take_fault(Fault::Map)?;
        Ok(MappedBuffer(self.0.storage.write()))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.0.storage.read_recursive()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.0.storage.write()
    }

    /// Copies the bytes of `range` out of the buffer.
    pub(crate) fn read_range(&self, offset: u64, size: u64) -> Result<Vec<u8>, DeviceError> {
        let range = self.checked_range(offset, size)?;
        Ok(self.read()[range].to_vec())
    }

    pub(crate) fn checked_range(&self, offset: u64, size: u64) -> Result<std::ops::Range<usize>, DeviceError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.0.size => Ok(offset as usize..end as usize),
            _ => Err(DeviceError::InvalidBinding(format!(
                "range {}..+{} is outside buffer {:?} of {} bytes",
                offset, size, self.0.label, self.0.size
            ))),
        }
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.0.label)
            .field("heap", &self.0.heap)
            .field("size", &self.0.size)
            .finish()
    }
}

/// CPU view of a mapped buffer; unmapped on drop.
pub struct MappedBuffer<'a>(RwLockWriteGuard<'a, Vec<u8>>);

impl Deref for MappedBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for MappedBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DescriptorHeap {
    size: u32,
}

impl DescriptorHeap {
    pub fn size(&self) -> u32 {
        self.size
    }
}

#[derive(Clone, Debug)]
pub enum Command {
    CopyBuffer {
        dst: Buffer,
        dst_offset: u64,
        src: Buffer,
        src_offset: u64,
        size: u64,
    },
    Barrier,
    InitializeOperator {
        operator: Arc<dyn CompiledOperator>,
        heap: DescriptorHeap,
        inputs: Vec<Option<BufferBinding>>,
        persistent: Option<BufferBinding>,
    },
    ExecuteOperator {
        operator: Arc<dyn CompiledOperator>,
        heap: DescriptorHeap,
        bindings: ExecutionBindings,
    },
}

/// Recorded commands, submitted to the queue as a unit and re-submittable.
pub struct CommandList {
    commands: Arc<Vec<Command>>,
    closed: bool,
    shared: Arc<DeviceShared>,
}

impl CommandList {
    pub fn record(&mut self, command: Command) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::InvalidArgument("the command list is closed".to_string()));
        }
        Arc::make_mut(&mut self.commands).push(command);
        Ok(())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Clears the list and opens it for recording again.
    pub fn reset(&mut self) {
        self.commands = Arc::new(Vec::new());
        self.closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(crate) fn commands(&self) -> Arc<Vec<Command>> {
        self.commands.clone()
    }
}

impl Debug for CommandList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("len", &self.commands.len())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for CommandList {
    fn drop(&mut self) {
        self.shared.live_command_lists.fetch_sub(1, Ordering::SeqCst);
    }
}

fn copy_buffer(dst: &Buffer, dst_offset: u64, src: &Buffer, src_offset: u64, size: u64) -> Result<(), DeviceError> {
    let dst_range = dst.checked_range(dst_offset, size)?;
    let src_range = src.checked_range(src_offset, size)?;
    if dst.ptr_eq(src) {
        dst.write().copy_within(src_range, dst_range.start);
    } else {
        let src = src.read();
        dst.write()[dst_range].copy_from_slice(&src[src_range]);
    }
    Ok(())
}

fn check_descriptors(operator: &dyn CompiledOperator, heap: &DescriptorHeap) -> Result<(), DeviceError> {
    let required = operator.binding_properties().required_descriptor_count;
    if heap.size < required {
        return Err(DeviceError::InvalidBinding(format!(
            "{} descriptors are required but the heap holds {}",
            required, heap.size
        )));
    }
    Ok(())
}

/// Runs one submission on the queue thread.
pub(crate) fn run_commands(commands: &[Command], shared: &DeviceShared) -> Result<(), DeviceError> {
    shared.check_removed()?;
    shared.take_fault(Fault::Execution)?;
    for command in commands {
        match command {
            Command::CopyBuffer {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => copy_buffer(dst, *dst_offset, src, *src_offset, *size)?,
            Command::Barrier => {
                shared.barriers_executed.fetch_add(1, Ordering::SeqCst);
            }
            Command::InitializeOperator {
                operator,
                heap,
                inputs,
                persistent,
            } => {
                check_descriptors(operator.as_ref(), heap)?;
                operator.initialize(inputs, persistent.as_ref())?;
            }
            Command::ExecuteOperator {
                operator,
                heap,
                bindings,
            } => {
                check_descriptors(operator.as_ref(), heap)?;
                operator.execute(bindings)?;
            }
        }
    }
    Ok(())
}

/// Handle to an accelerator. Clones share the device.
#[derive(Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
    backend: Arc<dyn Backend>,
    queue: Arc<CommandQueue>,
}

impl Device {
    /// Creates a device running the CPU reference backend.
    pub fn new(capabilities: BackendCapabilities) -> Result<Self, DeviceError> {
        Self::with_backend(capabilities, Arc::new(Native))
    }

    pub fn with_backend(capabilities: BackendCapabilities, backend: Arc<dyn Backend>) -> Result<Self, DeviceError> {
        debug!(?capabilities, "creating device");
        let shared = Arc::new(DeviceShared {
            capabilities,
            memory_in_use: AtomicU64::new(0),
            live_buffers: AtomicUsize::new(0),
            buffers_created: AtomicUsize::new(0),
            live_command_lists: AtomicUsize::new(0),
            barriers_executed: AtomicUsize::new(0),
            removed: Mutex::new(None),
            faults: Mutex::new(Vec::new()),
        });
        let queue = Arc::new(CommandQueue::new(shared.clone())?);
        Ok(Device { shared, backend, queue })
    }

    pub fn capabilities(&self) -> &BackendCapabilities {
        &self.shared.capabilities
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn compile(&self, graph: GraphDesc) -> Result<Arc<dyn CompiledOperator>, DeviceError> {
        self.shared.check_removed()?;
        self.shared.take_fault(Fault::Compile)?;
        self.backend.compile(graph)
    }

    pub fn create_buffer(&self, heap: HeapKind, size: u64, label: &str) -> Result<Buffer, DeviceError> {
        self.shared.check_removed()?;
        if size == 0 {
            return Err(DeviceError::InvalidArgument(format!("buffer {:?} has size 0", label)));
        }
        let len = usize::try_from(size).map_err(|_| DeviceError::OutOfMemory {
            requested: size,
            in_use: self.shared.memory_in_use.load(Ordering::SeqCst),
            budget: self.shared.capabilities.memory_budget.unwrap_or(u64::MAX),
        })?;
        self.shared.reserve(size).map_err(|e| {
            error!(label, size, "buffer allocation failed: {}", e);
            e
        })?;

        self.shared.live_buffers.fetch_add(1, Ordering::SeqCst);
        self.shared.buffers_created.fetch_add(1, Ordering::SeqCst);
        trace!(label, size, ?heap, "buffer created");
        Ok(Buffer(Arc::new(BufferInner {
            storage: RwLock::new(vec![0; len]),
            heap,
            label: label.to_string(),
            size,
            shared: self.shared.clone(),
        })))
    }

    pub fn create_descriptor_heap(&self, size: u32) -> Result<DescriptorHeap, DeviceError> {
        self.shared.check_removed()?;
        Ok(DescriptorHeap { size })
    }

    pub fn create_command_list(&self) -> Result<CommandList, DeviceError> {
        self.shared.check_removed()?;
        self.shared.live_command_lists.fetch_add(1, Ordering::SeqCst);
        Ok(CommandList {
            commands: Arc::new(Vec::new()),
            closed: false,
            shared: self.shared.clone(),
        })
    }

    /// Marks the device as lost; every later call on it fails.
    pub fn remove(&self, reason: &str) {
        error!(reason, "device removed");
        *self.shared.removed.lock() = Some(reason.to_string());
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.shared.faults.lock().push(fault);
    }

    pub fn stats(&self) -> DeviceStats {
        DeviceStats {
            memory_in_use: self.shared.memory_in_use.load(Ordering::SeqCst),
            live_buffers: self.shared.live_buffers.load(Ordering::SeqCst),
            buffers_created: self.shared.buffers_created.load(Ordering::SeqCst),
            live_command_lists: self.shared.live_command_lists.load(Ordering::SeqCst),
            barriers_executed: self.shared.barriers_executed.load(Ordering::SeqCst),
        }
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("capabilities", &self.shared.capabilities)
            .field("backend", &self.backend)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(memory_budget: Option<u64>) -> Device {
        Device::new(BackendCapabilities {
            memory_budget,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_buffer_accounting() {
        let device = device(None);
        let a = device.create_buffer(HeapKind::Upload, 64, "a").unwrap();
        let b = device.create_buffer(HeapKind::Default, 32, "b").unwrap();
        assert_eq!(device.stats().memory_in_use, 96);
        assert_eq!(device.stats().live_buffers, 2);

        let a2 = a.clone();
        drop(a);
        assert_eq!(device.stats().live_buffers, 2);
        drop(a2);
        drop(b);
        let stats = device.stats();
        assert_eq!((stats.memory_in_use, stats.live_buffers, stats.buffers_created), (0, 0, 2));
    }

    #[test]
    fn test_out_of_memory() {
        let device = device(Some(100));
        let _a = device.create_buffer(HeapKind::Default, 64, "a").unwrap();
        let err = device.create_buffer(HeapKind::Default, 64, "b").unwrap_err();
        assert!(err.is_out_of_memory());
        assert!(matches!(
            err,
            DeviceError::OutOfMemory {
                requested: 64,
                in_use: 64,
                budget: 100
            }
        ));
        assert!(device.create_buffer(HeapKind::Default, 36, "c").is_ok());
    }

    #[test]
    fn test_map() {
        let device = device(None);
        let upload = device.create_buffer(HeapKind::Upload, 4, "upload").unwrap();
        upload.map().unwrap().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&*upload.map().unwrap(), &[1, 2, 3, 4]);

        let local = device.create_buffer(HeapKind::Default, 4, "local").unwrap();
        assert!(matches!(local.map(), Err(DeviceError::NotMappable { .. })));

        device.inject_fault(Fault::Map);
        assert!(matches!(upload.map(), Err(DeviceError::Injected(Fault::Map))));
        assert!(upload.map().is_ok());
    }

    #[test]
    fn test_removed_device() {
        let device = device(None);
        device.remove("driver reset");
        assert!(matches!(
            device.create_buffer(HeapKind::Upload, 4, "x"),
            Err(DeviceError::Removed { .. })
        ));
        assert!(device.create_command_list().is_err());
    }

    #[test]
    fn test_command_list() {
        let device = device(None);
        let mut list = device.create_command_list().unwrap();
        assert_eq!(device.stats().live_command_lists, 1);
        list.record(Command::Barrier).unwrap();
        list.close();
        assert!(list.record(Command::Barrier).is_err());
        assert_eq!(list.len(), 1);
        list.reset();
        assert!(list.is_empty() && !list.is_closed());
        drop(list);
        assert_eq!(device.stats().live_command_lists, 0);
    }

    #[test]
    fn test_copy_buffer() {
        let device = device(None);
        let src = device.create_buffer(HeapKind::Upload, 8, "src").unwrap();
        let dst = device.create_buffer(HeapKind::Readback, 8, "dst").unwrap();
        src.map().unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let commands = vec![
            Command::CopyBuffer {
                dst: dst.clone(),
                dst_offset: 4,
                src: src.clone(),
                src_offset: 0,
                size: 4,
            },
            Command::Barrier,
        ];
        run_commands(&commands, &device.shared).unwrap();
        assert_eq!(&*dst.map().unwrap(), &[0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(device.stats().barriers_executed, 1);

        let commands = vec![Command::CopyBuffer {
            dst,
            dst_offset: 6,
            src,
            src_offset: 0,
            size: 4,
        }];
        assert!(matches!(
            run_commands(&commands, &device.shared),
            Err(DeviceError::InvalidBinding(_))
        ));
    }
}
