//! Compiled programs and replicated execution
//!
//! A [`LocalExecutable`] pairs a compiled artifact with the devices its
//! replicas run on. Both entry points share one dispatch path: arguments are
//! validated up front, one task per replica is queued on that device's
//! worker thread, and the caller blocks until every replica has reported.

pub mod assignment;

pub use assignment::DeviceAssignment;

use std::sync::mpsc;
use std::sync::Arc;

use crate::buffer::{LocalBuffer, SharedDeviceBuffer};
use crate::client::LocalClient;
use crate::error::{ForgeError, ForgeResult};
use crate::platform::{DevicePlatform, DriverResult, ShapedBuffer};
use crate::program::{BuildOptions, CompiledArtifact, Computation};
use crate::shape::Shape;

/// A program compiled for a client's devices
#[derive(Debug)]
pub struct LocalExecutable {
    name: String,
    result_shape: Shape,
    artifact: Option<Arc<CompiledArtifact>>,
    device_assignment: DeviceAssignment,
    client: Arc<LocalClient>,
}

type ReplicaResult = DriverResult<Arc<SharedDeviceBuffer>>;

impl LocalExecutable {
    /// Compile `computation` for `client`'s platform.
    ///
    /// `argument_layouts` are the parameter shapes in parameter order. Without
    /// `options` the program runs as a single replica on device 0.
    pub fn compile(
        computation: &Computation,
        argument_layouts: Vec<Shape>,
        options: Option<&BuildOptions>,
        client: &Arc<LocalClient>,
    ) -> ForgeResult<LocalExecutable> {
        let options = options.cloned().unwrap_or_default();
        let num_replicas = options.num_replicas();
        if num_replicas == 0 {
            return Err(crate::invalid_argument!(
                "program {} needs at least one replica",
                computation.name(),
            ));
        }

        let device_assignment = match options.device_assignment() {
            Some(ordinals) => {
                if ordinals.len() != num_replicas {
                    return Err(crate::invalid_argument!(
                        "device assignment lists {} devices for {} replicas",
                        ordinals.len(),
                        num_replicas,
                    ));
                }
                DeviceAssignment::from_ordinals(ordinals.to_vec(), client.device_count())?
            }
            None => DeviceAssignment::for_replicas(num_replicas, client.device_count())?,
        };

        let artifact = client
            .platform()
            .compiler()
            .compile(computation, &argument_layouts, &options)
            .map_err(|e| ForgeError::compile(computation.name(), e))?;

        tracing::info!(
            program = computation.name(),
            replicas = num_replicas,
            devices = %device_assignment,
            "LocalExecutable: compiled"
        );

        Ok(LocalExecutable {
            name: artifact.name().to_string(),
            result_shape: artifact.result_shape().clone(),
            artifact: Some(Arc::new(artifact)),
            device_assignment,
            client: Arc::clone(client),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn result_shape(&self) -> &Shape {
        &self.result_shape
    }

    pub fn num_replicas(&self) -> usize {
        self.device_assignment.num_replicas()
    }

    pub fn device_assignment(&self) -> &DeviceAssignment {
        &self.device_assignment
    }

    /// Device ordinal of each replica, in replica order
    pub fn device_ordinals(&self) -> Vec<usize> {
        self.device_assignment.ordinals().to_vec()
    }

    pub fn client(&self) -> &Arc<LocalClient> {
        &self.client
    }

    pub fn is_deleted(&self) -> bool {
        self.artifact.is_none()
    }

    /// Drop the compiled program; buffers produced by it are unaffected
    pub fn delete(&mut self) {
        if self.artifact.take().is_some() {
            tracing::debug!(program = %self.name, "LocalExecutable: deleted");
        }
    }

    fn artifact(&self) -> ForgeResult<&Arc<CompiledArtifact>> {
        self.artifact.as_ref().ok_or_else(|| {
            crate::failed_precondition!("program {} has been deleted", self.name)
        })
    }

    /// Run a single-replica program
    pub fn execute(&self, arguments: &[&LocalBuffer]) -> ForgeResult<LocalBuffer> {
        let artifact = self.artifact()?;
        if self.num_replicas() != 1 {
            return Err(crate::failed_precondition!(
                "execute requires a single-replica program; {} has {} replicas",
                self.name,
                self.num_replicas(),
            ));
        }
        let mut results = self.execute_replicated(artifact, &[arguments.to_vec()])?;
        results
            .pop()
            .ok_or_else(|| crate::internal_error!("{} produced no result", self.name))
    }

    /// Run every replica, each with its own arguments, and return their
    /// results in replica order
    pub fn execute_per_replica(&self, arguments: &[Vec<&LocalBuffer>]) -> ForgeResult<Vec<LocalBuffer>> {
        let artifact = self.artifact()?;
        if arguments.len() != self.num_replicas() {
            return Err(crate::invalid_argument!(
                "{} has {} replicas but arguments were given for {}",
                self.name,
                self.num_replicas(),
                arguments.len(),
            ));
        }
        self.execute_replicated(artifact, arguments)
    }

    fn validate_arguments(
        &self,
        artifact: &CompiledArtifact,
        replica: usize,
        device_ordinal: usize,
        arguments: &[&LocalBuffer],
    ) -> ForgeResult<Vec<Arc<SharedDeviceBuffer>>> {
        let parameters = artifact.parameter_shapes();
        if arguments.len() != parameters.len() {
            return Err(crate::invalid_argument!(
                "{} takes {} arguments, replica {} was given {}",
                self.name,
                parameters.len(),
                replica,
                arguments.len(),
            ));
        }
        arguments
            .iter()
            .zip(parameters)
            .enumerate()
            .map(|(index, (argument, parameter))| {
                let device_buffer = argument.device_buffer().map_err(|_| {
                    crate::invalid_argument!(
                        "argument {} of replica {} has been deleted",
                        index,
                        replica,
                    )
                })?;
                if argument.device_ordinal() != device_ordinal {
                    return Err(crate::invalid_argument!(
                        "argument {} of replica {} is on device {}, replica runs on device {}",
                        index,
                        replica,
                        argument.device_ordinal(),
                        device_ordinal,
                    ));
                }
                if argument.on_host_shape() != parameter {
                    return Err(crate::invalid_argument!(
                        "argument {} of replica {} has shape {}, parameter expects {}",
                        index,
                        replica,
                        argument.on_host_shape(),
                        parameter,
                    ));
                }
                Ok(Arc::clone(device_buffer))
            })
            .collect()
    }

    fn execute_replicated(
        &self,
        artifact: &Arc<CompiledArtifact>,
        arguments: &[Vec<&LocalBuffer>],
    ) -> ForgeResult<Vec<LocalBuffer>> {
        let num_replicas = arguments.len();
        let mut validated = Vec::with_capacity(num_replicas);
        for (replica, replica_arguments) in arguments.iter().enumerate() {
            let ordinal = self.device_assignment.ordinal(replica).ok_or_else(|| {
                crate::invalid_argument!("replica {} has no assigned device", replica)
            })?;
            validated.push((
                ordinal,
                self.validate_arguments(artifact, replica, ordinal, replica_arguments)?,
            ));
        }

        let (sender, receiver) = mpsc::channel::<(usize, ReplicaResult)>();
        let mut inline = None;
        for (replica, (ordinal, device_buffers)) in validated.into_iter().enumerate() {
            let worker = self.client.worker(ordinal)?;
            let platform = Arc::clone(self.client.platform());
            let artifact = Arc::clone(artifact);
            let sender = sender.clone();
            tracing::debug!(
                program = %self.name,
                replica,
                device_ordinal = ordinal,
                "LocalExecutable: dispatching replica"
            );
            let task = move || {
                let result = run_replica(&platform, &artifact, ordinal, replica, &device_buffers);
                drop(device_buffers);
                let _ = sender.send((replica, result));
            };
            if worker.is_current() {
                // Already on this device's worker; queueing would wait on itself
                inline = Some(task);
            } else {
                worker.schedule(task)?;
            }
        }
        drop(sender);
        // Last, once every other replica is queued; replicas may wait on each other
        if let Some(task) = inline {
            task();
        }

        let mut slots: Vec<Option<ReplicaResult>> = (0..num_replicas).map(|_| None).collect();
        for (replica, result) in receiver.iter() {
            slots[replica] = Some(result);
        }

        let mut outputs = Vec::with_capacity(num_replicas);
        for (replica, slot) in slots.into_iter().enumerate() {
            let ordinal = self.device_assignment.ordinal(replica).unwrap_or_default();
            match slot {
                Some(Ok(device_buffer)) => outputs.push(LocalBuffer::new(
                    self.result_shape.clone(),
                    device_buffer,
                    Arc::clone(&self.client),
                )),
                Some(Err(e)) => {
                    tracing::warn!(
                        program = %self.name,
                        replica,
                        device_ordinal = ordinal,
                        error = %e,
                        "LocalExecutable: replica failed"
                    );
                    return Err(ForgeError::driver(
                        format!(
                            "executing {} replica {} on device {}",
                            self.name, replica, ordinal
                        ),
                        e,
                    ));
                }
                None => {
                    return Err(crate::internal_error!(
                        "replica {} of {} stopped without reporting a result",
                        replica,
                        self.name,
                    ))
                }
            }
        }
        Ok(outputs)
    }
}

fn run_replica(
    platform: &Arc<dyn DevicePlatform>,
    artifact: &CompiledArtifact,
    device_ordinal: usize,
    replica: usize,
    arguments: &[Arc<SharedDeviceBuffer>],
) -> ReplicaResult {
    for argument in arguments {
        argument.block_until_defined()?;
    }
    let views: Vec<ShapedBuffer> = arguments.iter().map(|a| a.as_shaped_buffer()).collect();
    let output = platform.execute(device_ordinal, replica, artifact, &views)?;
    Ok(SharedDeviceBuffer::from_shaped_buffer(platform, output))
}
