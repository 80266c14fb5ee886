//! DeviceLink: an ordered, retrying command queue in front of one camera.
//!
//! The transport underneath is connectionless and lossy, so every attempt is
//! bounded by a timeout and failed attempts are resent as-is. Resending is
//! safe because every command is absolute ("go to slot 3"), never relative.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::visca::ERROR_BUFFER_FULL;
use super::{FocusValue, PresetSlot};

/// High-level camera command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraCommand {
    /// Ask for the current focus position
    InquireFocus,
    /// Store the current pan/tilt/zoom position in a memory slot
    CommitMemory(PresetSlot),
    /// Move to a memory slot and apply a stored focus position
    Recall { slot: PresetSlot, focus: FocusValue },
    Power(bool),
    FocusLock(bool),
}

impl CameraCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CameraCommand::InquireFocus => "focus inquiry",
            CameraCommand::CommitMemory(_) => "memory set",
            CameraCommand::Recall { .. } => "memory recall",
            CameraCommand::Power(_) => "power",
            CameraCommand::FocusLock(_) => "focus lock",
        }
    }
}

/// Confirmed result of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandReply {
    /// The camera reported completion
    Done,
    /// Answer to a focus inquiry
    Focus(FocusValue),
}

/// Device errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Io(String),
    #[error("camera rejected the command (error 0x{code:02x})")]
    Rejected { code: u8 },
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    #[error("unexpected reply {reply:?} to {command}")]
    UnexpectedReply {
        command: &'static str,
        reply: CommandReply,
    },
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<DeviceError> },
    #[error("device link for camera {0} is closed")]
    LinkClosed(usize),
}

impl DeviceError {
    /// Whether resending the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeviceError::Timeout(_) | DeviceError::Io(_) => true,
            DeviceError::Rejected { code } => *code == ERROR_BUFFER_FULL,
            _ => false,
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        DeviceError::Io(e.to_string())
    }
}

/// One attempt at a camera command over some transport.
///
/// Implementations do not time out or retry on their own; [`DeviceLink`]
/// wraps every call in its [`RetryPolicy`].
pub trait CameraProtocol: Send + 'static {
    fn execute(
        &mut self,
        command: CameraCommand,
    ) -> impl Future<Output = Result<CommandReply, DeviceError>> + Send;
}

/// Timeout and retry budget for a single command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time allowed for one attempt, including movement until completion
    pub timeout: Duration,
    /// Total attempts, including the first one
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            max_attempts: 3,
        }
    }
}

struct Job {
    command: CameraCommand,
    reply: oneshot::Sender<Result<CommandReply, DeviceError>>,
}

/// Handle to a camera's command queue.
///
/// Cloning the handle shares the queue. The worker task stops once every
/// handle is dropped and the queue has drained.
#[derive(Clone)]
pub struct DeviceLink {
    camera: usize,
    queue: mpsc::UnboundedSender<Job>,
}

impl DeviceLink {
    /// Start the worker task for `camera`. Must be called inside a tokio runtime.
    pub fn spawn<P: CameraProtocol>(camera: usize, protocol: P, policy: RetryPolicy) -> Self {
        let (queue, jobs) = mpsc::unbounded_channel();
        tokio::spawn(run_link(camera, protocol, policy, jobs));
        Self { camera, queue }
    }

    pub fn camera(&self) -> usize {
        self.camera
    }

    /// Queue a command and wait for its confirmed result.
    ///
    /// Dropping the returned future does not cancel the command once queued.
    pub async fn submit(&self, command: CameraCommand) -> Result<CommandReply, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .send(Job { command, reply })
            .map_err(|_| DeviceError::LinkClosed(self.camera))?;
        rx.await.map_err(|_| DeviceError::LinkClosed(self.camera))?
    }

    pub async fn inquire_focus(&self) -> Result<FocusValue, DeviceError> {
        match self.submit(CameraCommand::InquireFocus).await? {
            CommandReply::Focus(focus) => Ok(focus),
            reply => Err(DeviceError::UnexpectedReply {
                command: CameraCommand::InquireFocus.name(),
                reply,
            }),
        }
    }

    pub async fn commit_memory(&self, slot: PresetSlot) -> Result<(), DeviceError> {
        self.submit(CameraCommand::CommitMemory(slot)).await.map(|_| ())
    }

    pub async fn recall(&self, slot: PresetSlot, focus: FocusValue) -> Result<(), DeviceError> {
        self.submit(CameraCommand::Recall { slot, focus }).await.map(|_| ())
    }

    pub async fn set_power(&self, on: bool) -> Result<(), DeviceError> {
        self.submit(CameraCommand::Power(on)).await.map(|_| ())
    }

    pub async fn set_focus_lock(&self, on: bool) -> Result<(), DeviceError> {
        self.submit(CameraCommand::FocusLock(on)).await.map(|_| ())
    }
}

async fn run_link<P: CameraProtocol>(
    camera: usize,
    mut protocol: P,
    policy: RetryPolicy,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    log::debug!("Device link for camera {camera} started");

    while let Some(job) = jobs.recv().await {
        let result = execute_with_retry(camera, &mut protocol, job.command, &policy).await;
        if let Err(e) = &result {
            log::warn!("Camera {camera}: {} failed: {e}", job.command.name());
        }
        // The requester may have gone away; the command still ran to completion.
        let _ = job.reply.send(result);
    }

    log::debug!("Device link for camera {camera} stopped");
}

async fn execute_with_retry<P: CameraProtocol>(
    camera: usize,
    protocol: &mut P,
    command: CameraCommand,
    policy: &RetryPolicy,
) -> Result<CommandReply, DeviceError> {
    let attempts = policy.max_attempts.max(1);
    let mut last = DeviceError::Timeout(policy.timeout);

    for attempt in 1..=attempts {
        let outcome = match tokio::time::timeout(policy.timeout, protocol.execute(command)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DeviceError::Timeout(policy.timeout)),
        };

        match outcome {
            Ok(reply) => {
                if attempt > 1 {
                    log::info!("Camera {camera}: {} succeeded on attempt {attempt}", command.name());
                }
                return Ok(reply);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                log::debug!(
                    "Camera {camera}: {} attempt {attempt}/{attempts} failed: {e}",
                    command.name()
                );
                last = e;
            }
        }
    }

    Err(DeviceError::RetriesExhausted {
        attempts,
        last: Box::new(last),
    })
}
