// Worker side of the channel: streaming data into the queue and synchronous
// requests to the controller.

use log::{debug, error, info};
use std::time::Duration;

use super::channel::{ControlChannel, PipeReader, PipeWriter};
use super::protocol::{Choices, FileSelector, InputDialog, LayoutOp, Message, MessageKind};
use super::queue::{QueueProducer, SlotKind};
use super::session::{adopt_fd, ChannelSpec};
use crate::cancel::CancelToken;
use crate::error::{CommError, CommResult};
use crate::shm::{SegmentAllocator, SegmentId, ShmAllocator};

/// Progress of the request currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    QueuedMarker,
    HeaderWritten,
    AwaitingReply,
    Completed,
    /// Terminal. The channel may hold half a request, so nothing more is sent.
    Failed,
}

/// The worker's handle on the channel.
pub struct WorkerPeer {
    queue: QueueProducer,
    control: ControlChannel<PipeReader, PipeWriter>,
    allocator: ShmAllocator,
    cancel: CancelToken,
    state: RequestState,
    poll: Duration,
    acquire_retries: u32,
    acquire_backoff: Duration,
}

impl WorkerPeer {
    pub fn open(
        spec: &ChannelSpec,
        reply_reader: PipeReader,
        request_writer: PipeWriter,
        cancel: CancelToken,
    ) -> CommResult<Self> {
        let poll = spec.poll_interval();
        let queue =
            QueueProducer::open(&spec.queue_name, &spec.semaphore_name, spec.capacity, poll)?;
        let control = ControlChannel::new(reply_reader, request_writer, spec.max_message_size, poll);
        debug!("[WORKER] Attached to channel {}", spec.run_id);
        Ok(Self {
            queue,
            control,
            allocator: spec.allocator(),
            cancel,
            state: RequestState::Idle,
            poll,
            acquire_retries: spec.acquire_retries,
            acquire_backoff: spec.acquire_backoff(),
        })
    }

    /// Attach using the channel spec and pipe descriptors inherited from the controller.
    pub fn from_env(cancel: CancelToken) -> CommResult<Self> {
        let spec = ChannelSpec::from_env()?;
        let reply_reader = PipeReader::from(adopt_fd(spec.reply_fd)?);
        let request_writer = PipeWriter::from(adopt_fd(spec.request_fd)?);
        info!("[WORKER] Channel {} inherited", spec.run_id);
        Self::open(&spec, reply_reader, request_writer, cancel)
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_poisoned(&self) -> bool {
        self.state == RequestState::Failed
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Announce a payload segment that is already filled.
    pub fn send_data(&self, kind: SlotKind, segment: SegmentId) -> CommResult<()> {
        if !kind.is_data() {
            return Err(CommError::Malformed(
                "request markers are only sent by write_message".to_string(),
            ));
        }
        self.queue.enqueue(kind, Some(segment), &self.cancel)
    }

    /// Copy `payload` into a fresh segment and announce it. The segment is
    /// released again if it never makes it into the queue.
    pub fn publish_data(&mut self, kind: SlotKind, payload: &[u8]) -> CommResult<SegmentId> {
        let id = self.allocator.acquire_with_backoff(
            payload.len(),
            self.acquire_retries,
            self.acquire_backoff,
            &self.cancel,
            self.poll,
        )?;
        let published = self
            .allocator
            .attach(id)
            .and_then(|mut segment| {
                segment.write_payload(payload)?;
                segment.detach();
                Ok(())
            })
            .and_then(|()| self.send_data(kind, id));
        if let Err(e) = published {
            if let Err(release_err) = self.allocator.release(id) {
                debug!("[WORKER] Could not release segment {}: {}", id, release_err);
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Queue a request marker and write `message` to the controller. For
    /// one-way kinds the request is complete afterwards; otherwise the caller
    /// must follow up with [`read_message`](Self::read_message).
    ///
    /// A message that cannot be encoded is rejected before anything is
    /// queued and leaves the peer usable.
    pub fn write_message(&mut self, message: &Message) -> CommResult<()> {
        if message.kind().is_reply() {
            return Err(CommError::Malformed(format!(
                "{:?} is a reply kind",
                message.kind()
            )));
        }
        self.begin()?;
        let bytes = self.control.encode(message)?;
        let result = self.queue_and_write(&bytes);
        self.settle(result)?;
        self.state = match message.kind().reply_kind() {
            Some(_) => RequestState::HeaderWritten,
            None => RequestState::Completed,
        };
        Ok(())
    }

    fn queue_and_write(&mut self, bytes: &[u8]) -> CommResult<()> {
        self.queue.enqueue(SlotKind::Request, None, &self.cancel)?;
        self.state = RequestState::QueuedMarker;
        self.control.write_encoded(bytes)
    }

    /// Block until the controller's reply arrives. Cancellable until the
    /// first reply byte is available.
    pub fn read_message(&mut self, expected: MessageKind) -> CommResult<Message> {
        if self.is_poisoned() {
            return Err(CommError::ChannelFailed);
        }
        if self.state != RequestState::HeaderWritten {
            return Err(CommError::Malformed(format!(
                "no request awaiting a reply (state {:?})",
                self.state
            )));
        }
        self.state = RequestState::AwaitingReply;
        let result = self.control.read_expected(expected, Some(&self.cancel));
        let reply = self.settle(result)?;
        self.state = RequestState::Completed;
        Ok(reply)
    }

    /// Send `message` and, if its kind has one, wait for the reply.
    pub fn request(&mut self, message: &Message) -> CommResult<Option<Message>> {
        self.write_message(message)?;
        match message.kind().reply_kind() {
            Some(kind) => self.read_message(kind).map(Some),
            None => Ok(None),
        }
    }

    fn begin(&mut self) -> CommResult<()> {
        match self.state {
            RequestState::Failed => Err(CommError::ChannelFailed),
            RequestState::Idle | RequestState::Completed => {
                self.state = RequestState::Idle;
                Ok(())
            }
            other => Err(CommError::Malformed(format!(
                "previous request still in state {:?}",
                other
            ))),
        }
    }

    fn settle<T>(&mut self, result: CommResult<T>) -> CommResult<T> {
        if let Err(ref e) = result {
            error!("[WORKER] Request failed in state {:?}: {}", self.state, e);
            self.state = RequestState::Failed;
        }
        result
    }

    fn expect_int(&mut self, message: Message) -> CommResult<i32> {
        match self.request(&message)? {
            Some(Message::Int(value)) => Ok(value),
            other => Err(unexpected_reply(MessageKind::Int, other)),
        }
    }

    fn expect_str(&mut self, message: Message) -> CommResult<Option<String>> {
        match self.request(&message)? {
            Some(Message::Str(value)) => Ok(value),
            other => Err(unexpected_reply(MessageKind::Str, other)),
        }
    }

    pub fn print(&mut self, text: &str) -> CommResult<()> {
        self.write_message(&Message::Print(text.to_string()))
    }

    /// Blocks until the operator acknowledges the message.
    pub fn show_message(&mut self, text: &str) -> CommResult<()> {
        self.expect_int(Message::ShowMessage(text.to_string()))
            .map(|_| ())
    }

    pub fn show_alert(&mut self, text: &str) -> CommResult<()> {
        self.expect_int(Message::ShowAlert(text.to_string()))
            .map(|_| ())
    }

    /// Index of the button the operator picked.
    pub fn show_choices(&mut self, choices: &Choices) -> CommResult<i32> {
        self.expect_int(Message::ShowChoices(choices.clone()))
    }

    /// Selected path, or `None` if the operator cancelled.
    pub fn show_file_selector(&mut self, selector: &FileSelector) -> CommResult<Option<String>> {
        self.expect_str(Message::ShowFileSelector(selector.clone()))
    }

    pub fn show_input_dialog(&mut self, dialog: &InputDialog) -> CommResult<Option<String>> {
        self.expect_str(Message::ShowInputDialog(dialog.clone()))
    }

    pub fn append_program_lines(&mut self, lines: &[String]) -> CommResult<()> {
        self.write_message(&Message::AppendProgramLine(lines.to_vec()))
    }

    pub fn append_output_lines(&mut self, lines: &[String]) -> CommResult<()> {
        self.write_message(&Message::AppendOutputLine(lines.to_vec()))
    }

    pub fn freeze(&mut self, frozen: bool) -> CommResult<()> {
        self.write_message(&Message::Freeze(frozen))
    }

    /// Forward a layout blob; returns the controller's verdict (`None` when
    /// the operation was rejected).
    pub fn layout(&mut self, op: LayoutOp, data: &[u8]) -> CommResult<Option<Vec<u8>>> {
        let message = Message::Layout {
            op,
            data: data.to_vec(),
        };
        match self.request(&message)? {
            Some(Message::Blob(verdict)) => Ok(verdict),
            other => Err(unexpected_reply(MessageKind::Blob, other)),
        }
    }
}

fn unexpected_reply(expected: MessageKind, actual: Option<Message>) -> CommError {
    match actual {
        Some(message) => CommError::UnexpectedKind {
            expected,
            actual: message.kind(),
        },
        None => CommError::Malformed(format!("no reply where {:?} was expected", expected)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpcConfig;
    use crate::ipc::session::{create_channel, ControllerChannel};

    fn attached() -> (ControllerChannel, WorkerPeer) {
        let (controller, endpoints) = create_channel(&IpcConfig::isolated()).unwrap();
        let peer = endpoints.connect(CancelToken::new()).unwrap();
        (controller, peer)
    }

    /// Spin until the worker thread has queued its request marker.
    fn wait_for_marker(controller: &ControllerChannel) {
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !controller.queue.dequeue_ready() {
            assert!(std::time::Instant::now() < deadline, "no request marker");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn one_way_request_completes_after_writing() {
        let (mut controller, mut peer) = attached();
        peer.print("hello").unwrap();
        assert_eq!(peer.state(), RequestState::Completed);

        assert!(controller.queue.dequeue_ready());
        assert_eq!(controller.queue.peek_kind().unwrap(), SlotKind::Request);
        controller.queue.advance().unwrap();
        assert_eq!(
            controller.control.read_message(None).unwrap(),
            Message::Print("hello".into())
        );
    }

    #[test]
    fn reply_round_trip_moves_through_the_states() {
        let (mut controller, mut peer) = attached();
        let handle = std::thread::spawn(move || {
            let value = peer
                .show_input_dialog(&InputDialog {
                    message: "Sample?".into(),
                    default: Some(String::new()),
                })
                .unwrap();
            (value, peer.state())
        });

        wait_for_marker(&controller);
        controller.queue.advance().unwrap();
        let request = controller.control.read_message(None).unwrap();
        assert_eq!(request.kind(), MessageKind::ShowInputDialog);
        controller.control.write_message(&Message::Str(None)).unwrap();

        let (value, state) = handle.join().unwrap();
        assert_eq!(value, None);
        assert_eq!(state, RequestState::Completed);
    }

    #[test]
    fn failure_poisons_the_peer() {
        let (mut controller, mut peer) = attached();
        let handle = std::thread::spawn(move || {
            let result = peer.show_message("hi");
            (result, peer)
        });

        wait_for_marker(&controller);
        controller.queue.advance().unwrap();
        controller.control.read_message(None).unwrap();
        // Wrong reply kind for a message acknowledgement.
        controller
            .control
            .write_message(&Message::Str(Some("?".into())))
            .unwrap();

        let (result, mut peer) = handle.join().unwrap();
        assert!(matches!(result, Err(CommError::UnexpectedKind { .. })));
        assert!(peer.is_poisoned());
        assert!(matches!(peer.print("again"), Err(CommError::ChannelFailed)));
        assert_eq!(controller.queue.len().unwrap(), 0);
    }

    #[test]
    fn unencodable_request_queues_nothing() {
        let (mut controller, mut peer) = attached();
        let result = peer.show_choices(&Choices {
            text: "Too many".into(),
            labels: vec!["x".into(); 5],
            default: 0,
        });
        assert!(matches!(result, Err(CommError::Malformed(_))));
        assert_eq!(peer.state(), RequestState::Idle);
        assert!(!controller.queue.dequeue_ready());

        let oversized = "y".repeat(controller.spec().max_message_size + 1);
        assert!(matches!(
            peer.print(&oversized),
            Err(CommError::Malformed(_))
        ));
        assert!(!controller.queue.dequeue_ready());

        // The peer is still usable afterwards.
        peer.print("fine").unwrap();
        controller.queue.advance().unwrap();
        assert_eq!(
            controller.control.read_message(None).unwrap(),
            Message::Print("fine".into())
        );
    }

    #[test]
    fn cancelled_reply_wait_poisons_the_peer() {
        let (_controller, mut peer) = attached();
        let token = peer.cancel_token().clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            token.cancel();
        });
        assert!(matches!(
            peer.show_alert("stuck"),
            Err(CommError::Cancelled)
        ));
        canceller.join().unwrap();
        assert_eq!(peer.state(), RequestState::Failed);
    }

    #[test]
    fn published_data_is_readable_by_the_controller() {
        let (mut controller, mut peer) = attached();
        let id = peer.publish_data(SlotKind::Data2D, b"payload").unwrap();

        assert_eq!(controller.queue.peek_kind().unwrap(), SlotKind::Data2D);
        assert_eq!(controller.queue.peek_segment_id().unwrap(), id);
        let segment = controller.allocator.attach(id).unwrap();
        assert_eq!(segment.payload().unwrap(), b"payload");
        drop(segment);
        controller.allocator.release(id).unwrap();
    }

    #[test]
    fn requests_cannot_be_sent_as_data_or_replies() {
        let (_controller, mut peer) = attached();
        assert!(matches!(
            peer.send_data(SlotKind::Request, 0),
            Err(CommError::Malformed(_))
        ));
        assert!(matches!(
            peer.write_message(&Message::Int(1)),
            Err(CommError::Malformed(_))
        ));
        assert!(!peer.is_poisoned());
    }

    #[test]
    fn reading_without_a_request_is_rejected() {
        let (_controller, mut peer) = attached();
        assert!(matches!(
            peer.read_message(MessageKind::Int),
            Err(CommError::Malformed(_))
        ));
        assert_eq!(peer.state(), RequestState::Idle);
    }
}
