use crate::session::device::{run_commands, Command, CommandList, DeviceError, DeviceShared, Fault};
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, trace};

type Waiter = oneshot::Sender<Result<(), DeviceError>>;

#[derive(Debug)]
enum Event {
    Close,
    Submit { fence: u64, commands: Arc<Vec<Command>> },
}

/// Which failures a wait reports.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WaitScope {
    /// Only the failure of this one submission.
    Fence,
    /// The earliest unreported failure of any submission up to the fence.
    Through,
}

#[derive(Default)]
struct QueueState {
    last_submitted: u64,
    completed: u64,
    stopped: bool,
    errors: BTreeMap<u64, DeviceError>,
    waiters: Vec<(u64, WaitScope, Waiter)>,
    pending: VecDeque<(u64, Box<dyn Any + Send + Sync>)>,
}

impl QueueState {
    fn take_errors(&mut self, fence: u64, scope: WaitScope) -> Result<(), DeviceError> {
        let error = match scope {
            WaitScope::Fence => self.errors.remove(&fence),
            WaitScope::Through => {
                let later = self.errors.split_off(&fence.saturating_add(1));
                let done = std::mem::replace(&mut self.errors, later);
                done.into_values().next()
            }
        };
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn complete(&mut self, fence: u64, result: Result<(), DeviceError>) {
        self.completed = fence;
        if let Err(e) = result {
            self.errors.insert(fence, e);
        }
        let (ready, waiting) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition::<Vec<_>, _>(|(target, _, _)| *target <= fence);
        self.waiters = waiting;
        for (target, scope, waiter) in ready {
            let result = self.take_errors(target, scope);
            // the waiting future may have been dropped
            let _ = waiter.send(result);
        }
    }

    /// Fails every waiter once the worker has exited.
    fn stop(&mut self) {
        self.stopped = true;
        for (fence, _, waiter) in self.waiters.drain(..) {
            let _ = waiter.send(Err(stopped_error()));
            trace!(fence, "waiter released by a stopped queue");
        }
    }
}

fn stopped_error() -> DeviceError {
    DeviceError::Removed {
        reason: "the command queue has stopped".to_string(),
    }
}

/// Runs one submission, turning a kernel panic into a failure of its fence.
fn run_submission(commands: &[Command], shared: &DeviceShared) -> Result<(), DeviceError> {
    panic::catch_unwind(AssertUnwindSafe(|| run_commands(commands, shared))).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(DeviceError::Execution(format!("a kernel panicked: {}", message)))
    })
}

/// In-order command queue executing submissions on a dedicated thread.
///
/// Every submission gets the next fence value; `wait_async` resolves once the
/// queue has completed everything submitted before the call.
pub struct CommandQueue {
    dispatcher: Mutex<Sender<Event>>,
    state: Arc<Mutex<QueueState>>,
    shared: Arc<DeviceShared>,
    handle: Option<JoinHandle<()>>,
}

impl CommandQueue {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Result<Self, DeviceError> {
        let (tx, rx) = channel::<Event>();
        let state = Arc::new(Mutex::new(QueueState::default()));

        let worker_state = state.clone();
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("graphrt-queue".to_string())
            .spawn(move || {
                for event in rx {
                    match event {
                        Event::Close => break,
                        Event::Submit { fence, commands } => {
                            trace!(fence, commands = commands.len(), "executing submission");
                            let result = run_submission(&commands, &worker_shared);
                            if let Err(e) = &result {
                                error!(fence, "submission failed: {}", e);
                            }
                            // buffers referenced by the commands are released outside the lock
                            drop(commands);
                            worker_state.lock().complete(fence, result);
                        }
                    }
                }
                worker_state.lock().stop();
            })
            .map_err(DeviceError::Thread)?;

        Ok(CommandQueue {
            dispatcher: Mutex::new(tx),
            state,
            shared,
            handle: Some(handle),
        })
    }

    /// Submits a closed command list and returns its fence value.
    pub fn execute(&self, list: &CommandList) -> Result<u64, DeviceError> {
        if !list.is_closed() {
            return Err(DeviceError::InvalidArgument(
                "only closed command lists can be executed".to_string(),
            ));
        }
        self.shared.check_removed()?;
        self.shared.take_fault(Fault::Submit)?;

        let mut state = self.state.lock();
        let fence = state.last_submitted + 1;
        self.dispatcher
            .lock()
            .send(Event::Submit {
                fence,
                commands: list.commands(),
            })
            .map_err(|_| stopped_error())?;
        state.last_submitted = fence;
        trace!(fence, "submitted");
        Ok(fence)
    }

    /// Waits for everything submitted so far and reports the first failure
    /// among those submissions that no earlier wait has reported.
    pub async fn wait_async(&self) -> Result<(), DeviceError> {
        let fence = self.state.lock().last_submitted;
        self.wait(fence, WaitScope::Through).await
    }

    /// Waits for submission `fence` and reports only its own failure.
    pub async fn wait_for(&self, fence: u64) -> Result<(), DeviceError> {
        self.wait(fence, WaitScope::Fence).await
    }

    async fn wait(&self, fence: u64, scope: WaitScope) -> Result<(), DeviceError> {
        let receiver = {
            let mut state = self.state.lock();
            if state.completed >= fence {
                return state.take_errors(fence, scope);
            }
            if state.stopped {
                return Err(stopped_error());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push((fence, scope, tx));
            rx
        };
        receiver.await.map_err(|_| stopped_error())?
    }

    /// Keeps `object` alive until the work submitted so far completes.
    pub fn reference_until_completed(&self, object: Box<dyn Any + Send + Sync>) {
        let mut state = self.state.lock();
        let fence = state.last_submitted;
        state.pending.push_back((fence, object));
    }

    pub fn release_completed_resources(&self) {
        let released: Vec<_> = {
            let mut state = self.state.lock();
            let completed = state.completed;
            let count = state.pending.iter().take_while(|(fence, _)| *fence <= completed).count();
            state.pending.drain(..count).collect()
        };
        if !released.is_empty() {
            trace!(count = released.len(), "released completed resources");
        }
    }

    pub fn completed_fence(&self) -> u64 {
        self.state.lock().completed
    }

    pub fn last_submitted_fence(&self) -> u64 {
        self.state.lock().last_submitted
    }

    pub fn pending_reference_count(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        let _ = self.dispatcher.lock().send(Event::Close);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{BackendCapabilities, BindingProperties, BufferBinding, CompiledOperator, ExecutionBindings};
    use crate::session::device::{Command, Device, DeviceError, Fault, HeapKind};
    use futures::executor::block_on;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Panicking;

    impl CompiledOperator for Panicking {
        fn binding_properties(&self) -> BindingProperties {
            BindingProperties::default()
        }

        fn initialize(&self, _: &[Option<BufferBinding>], _: Option<&BufferBinding>) -> Result<(), DeviceError> {
            Ok(())
        }

        fn execute(&self, _: &ExecutionBindings) -> Result<(), DeviceError> {
            panic!("index out of bounds");
        }
    }

    fn device() -> Device {
        Device::new(BackendCapabilities::default()).unwrap()
    }

    #[test]
    fn test_execute_and_wait() {
        let device = device();
        let src = device.create_buffer(HeapKind::Upload, 4, "src").unwrap();
        let dst = device.create_buffer(HeapKind::Readback, 4, "dst").unwrap();
        src.map().unwrap().copy_from_slice(&[9, 8, 7, 6]);

        let mut list = device.create_command_list().unwrap();
        list.record(Command::CopyBuffer {
            dst: dst.clone(),
            dst_offset: 0,
            src: src.clone(),
            src_offset: 0,
            size: 4,
        })
        .unwrap();
        assert!(device.queue().execute(&list).is_err());
        list.close();

        let queue = device.queue();
        assert_eq!(queue.execute(&list).unwrap(), 1);
        assert_eq!(queue.execute(&list).unwrap(), 2);
        block_on(queue.wait_async()).unwrap();
        assert_eq!(queue.completed_fence(), 2);
        assert_eq!(&*dst.map().unwrap(), &[9, 8, 7, 6]);
    }

    #[test]
    fn test_wait_reports_failure_once() {
        let device = device();
        let mut list = device.create_command_list().unwrap();
        list.record(Command::Barrier).unwrap();
        list.close();

        device.inject_fault(Fault::Execution);
        let queue = device.queue();
        queue.execute(&list).unwrap();
        assert!(matches!(
            block_on(queue.wait_async()),
            Err(DeviceError::Injected(Fault::Execution))
        ));

        queue.execute(&list).unwrap();
        block_on(queue.wait_async()).unwrap();
        assert_eq!(device.stats().barriers_executed, 1);
    }

    #[test]
    fn test_submit_fault() {
        let device = device();
        let mut list = device.create_command_list().unwrap();
        list.close();
        device.inject_fault(Fault::Submit);
        assert!(device.queue().execute(&list).is_err());
        assert_eq!(device.queue().last_submitted_fence(), 0);
        assert_eq!(device.queue().execute(&list).unwrap(), 1);
    }

    #[test]
    fn test_reference_until_completed() {
        let device = device();
        let buffer = device.create_buffer(HeapKind::Default, 16, "kept").unwrap();
        let mut list = device.create_command_list().unwrap();
        list.record(Command::Barrier).unwrap();
        list.close();

        let queue = device.queue();
        queue.execute(&list).unwrap();
        queue.reference_until_completed(Box::new(buffer));
        assert_eq!(queue.pending_reference_count(), 1);
        assert_eq!(device.stats().live_buffers, 1);

        block_on(queue.wait_async()).unwrap();
        queue.release_completed_resources();
        assert_eq!(queue.pending_reference_count(), 0);
        assert_eq!(device.stats().live_buffers, 0);
    }

    #[test]
    fn test_wait_for_reports_only_its_fence() {
        let device = device();
        let mut list = device.create_command_list().unwrap();
        list.record(Command::Barrier).unwrap();
        list.close();

        let queue = device.queue();
        device.inject_fault(Fault::Execution);
        let failed = queue.execute(&list).unwrap();
        let clean = queue.execute(&list).unwrap();

        block_on(queue.wait_for(clean)).unwrap();
        assert!(matches!(
            block_on(queue.wait_for(failed)),
            Err(DeviceError::Injected(Fault::Execution))
        ));
        block_on(queue.wait_async()).unwrap();
    }

    #[test]
    fn test_kernel_panic_fails_its_fence() {
        let device = device();
        let mut list = device.create_command_list().unwrap();
        list.record(Command::ExecuteOperator {
            operator: Arc::new(Panicking),
            heap: device.create_descriptor_heap(1).unwrap(),
            bindings: ExecutionBindings::default(),
        })
        .unwrap();
        list.close();

        let queue = device.queue();
        let fence = queue.execute(&list).unwrap();
        let err = block_on(queue.wait_for(fence)).unwrap_err();
        assert!(err.to_string().contains("index out of bounds"), "{}", err);

        // the worker survives and keeps serving submissions
        let mut list = device.create_command_list().unwrap();
        list.record(Command::Barrier).unwrap();
        list.close();
        let fence = queue.execute(&list).unwrap();
        block_on(queue.wait_for(fence)).unwrap();
        assert_eq!(device.stats().barriers_executed, 1);
    }
}
