//! Compiling a graph description for a device and running it.

pub mod command;
pub mod device;
pub mod memory;
pub mod planner;
pub mod reactor;

use crate::backend::{BufferBinding, CompiledOperator};
use crate::error::{CompileError, Error, ExecutionError, InitializationError, MappingError};
use crate::graph::{materialize_defaults, GraphInfo, OperandId};
use crate::ops::{lower_graph, ComputeResourceInfo, GraphBufferBindingInfo};
use crate::session::command::CommandRecorder;
use crate::session::device::{Buffer, Device, DeviceError};
use crate::session::memory::{
    allocate_compute_resources, allocate_constant_resources, allocate_persistent_resource, ComputeResources,
};
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, instrument, warn};

fn initialization(step: &'static str) -> impl FnOnce(DeviceError) -> InitializationError {
    move |source| {
        error!(step, "initialization failed: {}", source);
        InitializationError { step, source }
    }
}

fn execution(step: &'static str) -> impl FnOnce(DeviceError) -> ExecutionError {
    move |source| {
        error!(step, "compute failed: {}", source);
        ExecutionError { step, source }
    }
}

fn mapping(step: &'static str) -> impl FnOnce(DeviceError) -> MappingError {
    move |source| {
        error!(step, "mapping failed: {}", source);
        MappingError { step, source }
    }
}

/// Resources reused across computes, with the recorder whose commands were
/// recorded against them. The recorder never outlives its resources in the
/// cache, so a cached recording always addresses the cached buffers.
#[derive(Debug)]
struct Cached {
    resources: ComputeResources,
    recorder: Option<CommandRecorder>,
}

/// Single slot: a compute that finds it empty creates its own resources and
/// returns them only if the slot is still empty when it finishes.
#[derive(Debug, Default)]
struct Cache {
    slot: Option<Cached>,
}

/// A graph compiled and initialized for one device.
#[derive(Debug)]
pub struct GraphExecutor {
    device: Device,
    operator: Arc<dyn CompiledOperator>,
    binding_info: GraphBufferBindingInfo,
    resource_info: ComputeResourceInfo,
    persistent: Option<Buffer>,
    cache: Mutex<Cache>,
}

impl GraphExecutor {
    /// Validates, lowers, compiles and initializes `graph`, then prepares the
    /// resources of the first compute.
    #[instrument(skip_all, fields(operations = graph.operations.len()))]
    pub async fn compile(device: &Device, graph: &GraphInfo) -> Result<GraphExecutor, Error> {
        graph.validate()?;
        let mut graph = graph.clone();
        materialize_defaults(&mut graph)?;
        let lowered = lower_graph(&graph, device.capabilities()).map_err(|e| {
            warn!(operation = %e.operation, "lowering failed: {}", e);
            e
        })?;
        debug!(nodes = lowered.desc.nodes.len(), "graph lowered");

        let operator = compile_in_background(device, lowered.desc).await?;
        let (mut recorder, persistent) = initialize(device, &operator, &lowered.binding_info, &graph.constants).await?;

        let executor = GraphExecutor {
            device: device.clone(),
            operator,
            binding_info: lowered.binding_info,
            resource_info: lowered.resource_info,
            persistent,
            cache: Mutex::new(Cache::default()),
        };
        let resources = allocate_compute_resources(&recorder, &*executor.operator, &executor.resource_info)?;
        executor.record(&mut recorder, &resources)?;
        *executor.cache.lock() = Cache {
            slot: Some(Cached {
                resources,
                recorder: Some(recorder),
            }),
        };
        Ok(executor)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn binding_info(&self) -> &GraphBufferBindingInfo {
        &self.binding_info
    }

    /// Runs the graph once on `inputs`, keyed by input name, and returns the
    /// outputs keyed by output name. Every buffer is dense and row-major.
    #[instrument(skip_all)]
    pub async fn compute(&self, inputs: &BTreeMap<String, Vec<u8>>) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        self.check_inputs(inputs)?;

        let cached = self.cache.lock().slot.take();
        let (resources, recorder) = match cached {
            Some(Cached { resources, recorder }) => (Some(resources), recorder),
            None => (None, None),
        };
        let needs_record = recorder.is_none();
        let mut recorder = match recorder {
            Some(recorder) => recorder,
            None => CommandRecorder::create(&self.device).map_err(execution("command recorder creation"))?,
        };
        let resources = match resources {
            Some(resources) => resources,
            None => allocate_compute_resources(&recorder, &*self.operator, &self.resource_info)?,
        };

        let result = self.run(&mut recorder, &resources, inputs, needs_record).await;

        {
            let mut cache = self.cache.lock();
            if cache.slot.is_none() {
                // a failed submission leaves the recording in an unknown state
                let recorder = if result.is_ok() { Some(recorder) } else { None };
                cache.slot = Some(Cached { resources, recorder });
            }
        }
        self.device.queue().release_completed_resources();
        result
    }

    fn check_inputs(&self, inputs: &BTreeMap<String, Vec<u8>>) -> Result<(), Error> {
        let expected = &self.resource_info.input_byte_lengths;
        if let Some(name) = inputs.keys().find(|name| !expected.contains_key(*name)) {
            return Err(Error::InvalidInputs(format!("the graph has no input named {:?}", name)));
        }
        for (name, &length) in expected {
            match inputs.get(name) {
                None => return Err(Error::InvalidInputs(format!("input {:?} is missing", name))),
                Some(bytes) if bytes.len() as u64 != length => {
                    return Err(Error::InvalidInputs(format!(
                        "input {:?} has {} bytes but {} are expected",
                        name,
                        bytes.len(),
                        length
                    )))
                }
                Some(_) => (),
            }
        }
        Ok(())
    }

    /// Records upload, execution and readback for `resources`.
    fn record(&self, recorder: &mut CommandRecorder, resources: &ComputeResources) -> Result<(), ExecutionError> {
        recorder.open().map_err(execution("recording"))?;
        if let (Some(upload), Some(input)) = (&resources.upload_buffer, &resources.input_buffer) {
            recorder
                .upload_buffer_with_barrier(input, upload, resources.input_plan.total)
                .map_err(execution("recording"))?;
        }
        let bindings = resources.execution_bindings(&self.binding_info, self.persistent.as_ref());
        recorder
            .execute_operator(&self.operator, resources.descriptor_heap, bindings)
            .map_err(execution("recording"))?;
        if let Some(readback) = &resources.readback_buffer {
            recorder
                .readback_buffer_with_barrier(readback, &resources.output_buffer, resources.output_plan.total)
                .map_err(execution("recording"))?;
        }
        recorder.close();
        Ok(())
    }

    async fn run(
        &self,
        recorder: &mut CommandRecorder,
        resources: &ComputeResources,
        inputs: &BTreeMap<String, Vec<u8>>,
        needs_record: bool,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        if needs_record {
            debug!("recording compute");
            self.record(recorder, resources)?;
        }

        if let Some(staging) = resources.input_staging() {
            let mut mapped = staging.map().map_err(mapping("input upload"))?;
            for (name, bytes) in inputs {
                if let Some(range) = resources.input_plan.range(name) {
                    let start = range.start as usize;
                    mapped[start..start + bytes.len()].copy_from_slice(bytes);
                }
            }
        }

        let fence = recorder.execute().map_err(execution("submission"))?;
        self.device.queue().wait_for(fence).await.map_err(execution("wait"))?;

        let mapped = resources.output_staging().map().map_err(mapping("output readback"))?;
        let outputs = self
            .resource_info
            .output_byte_lengths
            .iter()
            .filter_map(|(name, &length)| {
                let start = resources.output_plan.range(name)?.start as usize;
                Some((name.clone(), mapped[start..start + length as usize].to_vec()))
            })
            .collect();
        Ok(outputs)
    }
}

/// Runs the native compiler on its own thread and waits for it without
/// blocking the caller's executor.
async fn compile_in_background(
    device: &Device,
    graph: crate::ir::GraphDesc,
) -> Result<Arc<dyn CompiledOperator>, CompileError> {
    let (sender, receiver) = oneshot::channel();
    let compiler = device.clone();
    thread::Builder::new()
        .name("graphrt-compiler".to_string())
        .spawn(move || {
            // the executor may have stopped waiting
            let _ = sender.send(compiler.compile(graph));
        })
        .map_err(|e| CompileError {
            source: DeviceError::Thread(e),
        })?;

    let result = receiver.await.unwrap_or_else(|_| {
        Err(DeviceError::Execution("the compiler thread stopped without a result".to_string()))
    });
    result.map_err(|source| {
        error!("compilation failed: {}", source);
        CompileError { source }
    })
}

/// Uploads the constants and runs operator initialization. Returns the
/// recorder used, idle again, and the persistent resource.
#[instrument(skip_all, fields(constants = binding_info.constants.len()))]
async fn initialize(
    device: &Device,
    operator: &Arc<dyn CompiledOperator>,
    binding_info: &GraphBufferBindingInfo,
    constants: &BTreeMap<OperandId, Vec<u8>>,
) -> Result<(CommandRecorder, Option<Buffer>), Error> {
    let mut recorder = CommandRecorder::create(device).map_err(initialization("command recorder creation"))?;
    let lengths: BTreeMap<OperandId, u64> = binding_info
        .constants
        .keys()
        .filter_map(|id| Some((*id, constants.get(id)?.len() as u64)))
        .collect();
    let staging = allocate_constant_resources(&recorder, &lengths)?;

    recorder.open().map_err(initialization("recording"))?;
    let inputs = match &staging {
        Some(staging) => {
            {
                let mut mapped = staging.upload_buffer.map().map_err(mapping("constant upload"))?;
                for (id, range) in &staging.plan.ranges {
                    if let Some(bytes) = constants.get(id) {
                        let start = range.start as usize;
                        mapped[start..start + bytes.len()].copy_from_slice(bytes);
                    }
                }
            }
            if let Some(default) = &staging.default_buffer {
                recorder
                    .upload_buffer_with_barrier(default, &staging.upload_buffer, staging.plan.total)
                    .map_err(initialization("constant upload"))?;
            }
            staging.bindings(binding_info)
        }
        None => vec![None; binding_info.input_buffer_binding_count as usize],
    };

    let persistent_size = operator.binding_properties().persistent_resource_size;
    let persistent = allocate_persistent_resource(&recorder, persistent_size)?;
    recorder
        .initialize_operator(operator, inputs, persistent.clone().map(BufferBinding::whole))
        .map_err(initialization("operator initialization"))?;
    let fence = recorder
        .close_and_execute()
        .map_err(initialization("initialization submission"))?;
    if let Some(staging) = staging {
        device.queue().reference_until_completed(Box::new(staging));
    }
    device
        .queue()
        .wait_for(fence)
        .await
        .map_err(initialization("initialization"))?;
    device.queue().release_completed_resources();
    debug!(persistent_size, "graph initialized");
    Ok((recorder, persistent))
}
