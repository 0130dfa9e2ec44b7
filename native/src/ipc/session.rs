// Channel bootstrap: the controller creates the queue, semaphore and pipes for
// one run and hands the worker everything it needs through the environment.

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus};
use std::time::Duration;
use uuid::Uuid;

use super::channel::{self, ControlChannel, PipeReader, PipeWriter};
use super::peer::WorkerPeer;
use super::queue::QueueConsumer;
use super::CHANNEL_ENV;
use crate::cancel::CancelToken;
use crate::config::IpcConfig;
use crate::error::{CommError, CommResult};
use crate::shm::ShmAllocator;

/// Everything the worker needs to attach to a run's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub run_id: Uuid,
    pub queue_name: String,
    pub semaphore_name: String,
    pub capacity: usize,
    pub pool_prefix: String,
    pub max_segments: usize,
    pub max_payload_size: usize,
    pub max_message_size: usize,
    pub poll_interval_ms: u64,
    pub acquire_retries: u32,
    pub acquire_backoff_ms: u64,
    /// Worker's write end of the request pipe.
    pub request_fd: RawFd,
    /// Worker's read end of the reply pipe.
    pub reply_fd: RawFd,
}

impl ChannelSpec {
    fn new(config: &IpcConfig, run_id: Uuid) -> Self {
        let run = run_id.simple().to_string();
        let run = &run[..12];
        Self {
            run_id,
            queue_name: format!("/{}-{}-queue", config.shm_prefix, run),
            semaphore_name: format!("/{}-{}-free", config.shm_prefix, run),
            capacity: config.queue_capacity(),
            pool_prefix: config.shm_prefix.clone(),
            max_segments: config.max_segments,
            max_payload_size: config.max_payload_size,
            max_message_size: config.max_message_size,
            poll_interval_ms: config.poll_interval_ms,
            acquire_retries: config.acquire_retries,
            acquire_backoff_ms: config.acquire_backoff_ms,
            request_fd: -1,
            reply_fd: -1,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn acquire_backoff(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_ms)
    }

    pub fn allocator(&self) -> ShmAllocator {
        ShmAllocator::new(&self.pool_prefix, self.max_segments, self.max_payload_size)
    }

    pub fn to_env_value(&self) -> CommResult<String> {
        serde_json::to_string(self)
            .map_err(|e| CommError::Bootstrap(format!("cannot serialize channel spec: {}", e)))
    }

    pub fn from_env_value(value: &str) -> CommResult<Self> {
        serde_json::from_str(value)
            .map_err(|e| CommError::Bootstrap(format!("invalid {}: {}", CHANNEL_ENV, e)))
    }

    /// Read the channel spec the controller left in the environment.
    pub fn from_env() -> CommResult<Self> {
        let value = std::env::var(CHANNEL_ENV)
            .map_err(|_| CommError::Bootstrap(format!("{} is not set", CHANNEL_ENV)))?;
        Self::from_env_value(&value)
    }
}

/// Controller side of a run's channel.
pub struct ControllerChannel {
    pub queue: QueueConsumer,
    pub control: ControlChannel<PipeReader, PipeWriter>,
    pub allocator: ShmAllocator,
    spec: ChannelSpec,
}

impl ControllerChannel {
    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }
}

/// Worker ends of the pipes, held by the controller until the worker exists.
pub struct WorkerEndpoints {
    spec: ChannelSpec,
    reply_reader: PipeReader,
    request_writer: PipeWriter,
}

/// Create queue, semaphore and both pipes for a new run. Orphaned payload
/// segments from earlier runs are swept first.
pub fn create_channel(config: &IpcConfig) -> CommResult<(ControllerChannel, WorkerEndpoints)> {
    config
        .validate()
        .map_err(|e| CommError::Bootstrap(e.to_string()))?;

    let spec = ChannelSpec::new(config, Uuid::new_v4());
    let mut allocator = spec.allocator();
    allocator.sweep_orphans();

    let queue = QueueConsumer::create(&spec.queue_name, &spec.semaphore_name, spec.capacity)?;
    let (request_reader, request_writer) = channel::pipe()?;
    let (reply_reader, reply_writer) = channel::pipe()?;
    let control = ControlChannel::new(
        request_reader,
        reply_writer,
        spec.max_message_size,
        spec.poll_interval(),
    );

    info!(
        "[IPC] Channel {} ready ({} slots, {} segments)",
        spec.run_id, spec.capacity, spec.max_segments
    );

    Ok((
        ControllerChannel {
            queue,
            control,
            allocator,
            spec: spec.clone(),
        },
        WorkerEndpoints {
            spec,
            reply_reader,
            request_writer,
        },
    ))
}

impl WorkerEndpoints {
    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    /// Start the worker executable with the pipe ends inherited and the channel spec
    /// in its environment. The controller's copies of the worker ends are
    /// closed afterwards so a dying worker shows up as EOF.
    pub fn spawn(mut self, mut command: Command) -> CommResult<WorkerProcess> {
        let request_fd = self.request_writer.as_raw_fd();
        let reply_fd = self.reply_reader.as_raw_fd();
        self.spec.request_fd = request_fd;
        self.spec.reply_fd = reply_fd;

        command.env(CHANNEL_ENV, self.spec.to_env_value()?);
        // SAFETY: the closure only calls fcntl, which is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                for fd in [request_fd, reply_fd] {
                    if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        info!("[IPC] Worker started (pid {})", child.id());
        Ok(WorkerProcess { child })
    }

    /// Attach a worker inside this process. Used by tests and by embedders
    /// that run the script on a thread.
    pub fn connect(self, cancel: CancelToken) -> CommResult<WorkerPeer> {
        let (spec, reply_reader, request_writer) = self.split();
        WorkerPeer::open(&spec, reply_reader, request_writer, cancel)
    }

    pub(crate) fn split(self) -> (ChannelSpec, PipeReader, PipeWriter) {
        (self.spec, self.reply_reader, self.request_writer)
    }
}

/// Take ownership of a pipe end inherited from the controller.
pub(crate) fn adopt_fd(fd: RawFd) -> CommResult<OwnedFd> {
    // SAFETY: F_GETFD only inspects the descriptor table.
    if fd < 0 || unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(CommError::Bootstrap(format!(
            "inherited descriptor {} is not open",
            fd
        )));
    }
    // SAFETY: the descriptor is open and, by the bootstrap contract, nothing
    // else in this process owns it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    // Keep it away from anything this worker might exec in turn.
    // SAFETY: fd is open.
    unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    Ok(owned)
}

/// Control over the worker process, as the dispatcher needs it.
pub trait PeerProcess {
    fn pid(&self) -> i32;
    /// Cooperative termination: the worker unwinds its blocking calls.
    fn request_abort(&mut self) -> CommResult<()>;
    /// Hard termination. Returns once the process is gone.
    fn terminate(&mut self) -> CommResult<()>;
    /// Exit status if the process has already finished.
    fn try_reap(&mut self) -> CommResult<Option<ExitStatus>>;
}

pub struct WorkerProcess {
    child: Child,
}

impl WorkerProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl PeerProcess for WorkerProcess {
    fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    fn request_abort(&mut self) -> CommResult<()> {
        match signal::kill(Pid::from_raw(self.pid()), Signal::SIGTERM) {
            Ok(()) => {
                debug!("[IPC] Sent SIGTERM to worker {}", self.pid());
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn terminate(&mut self) -> CommResult<()> {
        match self.child.kill() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e.into()),
        }
        let status = self.child.wait()?;
        warn!("[IPC] Worker {} terminated ({})", self.pid(), status);
        Ok(())
    }

    fn try_reap(&mut self) -> CommResult<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }
}
