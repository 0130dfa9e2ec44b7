// Inter-process channel between the controller and one worker process:
// a semaphore-gated ring of slots in shared memory plus a typed request/reply
// protocol on a pipe pair.

pub mod channel;
pub mod peer;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod wire;

pub use channel::{ControlChannel, Inbound, PipeReader, PipeWriter};
pub use peer::{RequestState, WorkerPeer};
pub use protocol::{
    Choices, FileSelector, InputDialog, LayoutOp, Message, MessageKind, HEADER_SIZE,
};
pub use queue::{QueueConsumer, QueueProducer, SlotKind};
pub use session::{
    create_channel, ChannelSpec, ControllerChannel, PeerProcess, WorkerEndpoints, WorkerProcess,
};

/// Environment variable carrying the serialized [`ChannelSpec`] to the worker.
pub const CHANNEL_ENV: &str = "LABCTL_CHANNEL";
