// Controller-side drain loop, run once per idle tick.

use log::{debug, error, info, warn};
use std::process::ExitStatus;

use crate::error::{CommError, CommResult};
use crate::gui::{DataSink, GuiCollaborator};
use crate::ipc::{ControllerChannel, Message, PeerProcess, QueueConsumer, SlotKind};
use crate::logging;
use crate::shm::SegmentAllocator;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub data_consumed: usize,
    pub request_handled: bool,
    pub escalated: bool,
}

/// Routes queue slots to the data sink and control requests to the GUI.
///
/// Data slots are drained exhaustively; at most one request is answered per
/// tick so a slow dialog never hides a growing backlog for long. Any failure
/// while draining kills the worker and empties the queue.
pub struct Dispatcher<G, D, P> {
    channel: ControllerChannel,
    gui: G,
    sink: D,
    worker: P,
    aborted: bool,
}

impl<G, D, P> Dispatcher<G, D, P>
where
    G: GuiCollaborator,
    D: DataSink,
    P: PeerProcess,
{
    pub fn new(channel: ControllerChannel, gui: G, sink: D, worker: P) -> Self {
        Self {
            channel,
            gui,
            sink,
            worker,
            aborted: false,
        }
    }

    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if self.aborted {
            return report;
        }
        if let Err(e) = self.drain(&mut report) {
            self.escalate(&e);
            report.escalated = true;
        }
        report
    }

    fn drain(&mut self, report: &mut TickReport) -> CommResult<()> {
        while self.channel.queue.dequeue_ready() {
            match self.channel.queue.peek_kind()? {
                SlotKind::Request => {
                    self.channel.queue.advance()?;
                    self.respond()?;
                    report.request_handled = true;
                    break;
                }
                kind => {
                    self.consume_data(kind)?;
                    report.data_consumed += 1;
                }
            }
        }
        Ok(())
    }

    fn consume_data(&mut self, kind: SlotKind) -> CommResult<()> {
        let id = self.channel.queue.peek_segment_id()?;
        let segment = self.channel.allocator.attach(id)?;
        segment.claim();
        let consumed = segment
            .payload()
            .and_then(|payload| self.sink.consume(kind, payload));
        segment.detach();

        // The segment is ours now; release it even if the payload was bad.
        let released = self.channel.allocator.release(id);
        consumed?;
        released?;
        self.channel.queue.advance()
    }

    fn respond(&mut self) -> CommResult<()> {
        let request = self.channel.control.read_message(None)?;
        debug!("[DISPATCH] Handling {:?}", request.kind());

        let reply = match request {
            Message::Print(text) => {
                self.gui.print(&text);
                None
            }
            Message::ShowMessage(text) => {
                self.gui.show_message(&text);
                Some(Message::Int(0))
            }
            Message::ShowAlert(text) => {
                self.gui.show_alert(&text);
                Some(Message::Int(0))
            }
            Message::ShowChoices(choices) => {
                let index = self
                    .gui
                    .show_choices(&choices.text, &choices.labels, choices.default);
                Some(Message::Int(index))
            }
            Message::ShowFileSelector(selector) => {
                Some(Message::Str(self.gui.show_file_selector(&selector)))
            }
            Message::ShowInputDialog(dialog) => Some(Message::Str(self.gui.show_input(&dialog))),
            Message::AppendProgramLine(lines) => {
                self.gui.append_program_lines(&lines);
                None
            }
            Message::AppendOutputLine(lines) => {
                self.gui.append_output_lines(&lines);
                None
            }
            Message::Freeze(frozen) => {
                self.gui.freeze(frozen);
                None
            }
            Message::Layout { op, data } => {
                Some(Message::Blob(self.gui.apply_layout_blob(op, &data)))
            }
            other @ (Message::Int(_)
            | Message::Long(_)
            | Message::Float(_)
            | Message::Double(_)
            | Message::Str(_)
            | Message::Blob(_)) => {
                return Err(CommError::Malformed(format!(
                    "worker sent reply kind {:?} as a request",
                    other.kind()
                )))
            }
        };

        if let Some(reply) = reply {
            let bytes = self.encode_reply(reply)?;
            self.channel.control.write_encoded(&bytes)?;
        }
        Ok(())
    }

    /// A string or blob answer too large for the channel is sent as NULL
    /// (cancelled or rejected) so the request still completes.
    fn encode_reply(&self, reply: Message) -> CommResult<Vec<u8>> {
        match self.channel.control.encode(&reply) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let fallback = match reply {
                    Message::Str(_) => Message::Str(None),
                    Message::Blob(_) => Message::Blob(None),
                    _ => return Err(e),
                };
                warn!("[DISPATCH] Dropping {:?} reply: {}", fallback.kind(), e);
                self.channel.control.encode(&fallback)
            }
        }
    }

    fn escalate(&mut self, cause: &CommError) {
        let reason = if cause.is_protocol_violation() {
            format!("protocol violation: {}", cause)
        } else {
            format!("channel failure: {}", cause)
        };
        error!("[DISPATCH] Terminating worker after {}", reason);
        logging::capture_critical_error("dispatcher", &reason);

        if let Err(e) = self.worker.terminate() {
            warn!("[DISPATCH] Failed to terminate worker {}: {}", self.worker.pid(), e);
        }
        match self.channel.queue.reset() {
            Ok(discarded) => debug!("[DISPATCH] Queue reset, {} slot(s) discarded", discarded),
            Err(e) => warn!("[DISPATCH] Queue reset incomplete: {}", e),
        }
        self.channel.allocator.sweep_orphans();
        self.gui.report_aborted(&reason);
        self.aborted = true;
    }

    /// Operator abort: ask the worker to unwind. Draining continues until it
    /// exits so nothing it already published is lost.
    pub fn abort_run(&mut self) -> CommResult<()> {
        info!("[DISPATCH] Abort requested for worker {}", self.worker.pid());
        self.worker.request_abort()
    }

    /// Exit status of the worker once it has finished.
    pub fn worker_exit(&mut self) -> CommResult<Option<ExitStatus>> {
        self.worker.try_reap()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn queue(&self) -> &QueueConsumer {
        &self.channel.queue
    }

    pub fn gui(&self) -> &G {
        &self.gui
    }

    pub fn sink(&self) -> &D {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::IpcConfig;
    use crate::ipc::wire::Header;
    use crate::ipc::{create_channel, Choices, FileSelector, InputDialog, LayoutOp, QueueProducer};
    use crate::ipc::{WorkerPeer, WorkerProcess};
    use crate::shm::process_alive;
    use std::io::Write;
    use std::process::Command;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct ScriptedGui {
        choice: i32,
        selected_file: Option<String>,
        printed: Vec<String>,
        output: Vec<String>,
        frozen: Option<bool>,
        aborted: Option<String>,
    }

    impl GuiCollaborator for ScriptedGui {
        fn print(&mut self, text: &str) {
            self.printed.push(text.to_string());
        }
        fn show_message(&mut self, _text: &str) {}
        fn show_alert(&mut self, _text: &str) {}
        fn show_choices(&mut self, _text: &str, _labels: &[String], _default: i32) -> i32 {
            self.choice
        }
        fn show_file_selector(&mut self, request: &FileSelector) -> Option<String> {
            self.selected_file
                .clone()
                .or_else(|| request.default_file.clone())
        }
        fn show_input(&mut self, _request: &InputDialog) -> Option<String> {
            Some(String::new())
        }
        fn append_program_lines(&mut self, _lines: &[String]) {}
        fn append_output_lines(&mut self, lines: &[String]) {
            self.output = lines.to_vec();
        }
        fn freeze(&mut self, frozen: bool) {
            self.frozen = Some(frozen);
        }
        fn apply_layout_blob(&mut self, op: LayoutOp, data: &[u8]) -> Option<Vec<u8>> {
            match op {
                LayoutOp::ButtonState => Some(data.iter().rev().copied().collect()),
                _ => None,
            }
        }
        fn report_aborted(&mut self, reason: &str) {
            self.aborted = Some(reason.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        payloads: Vec<(SlotKind, Vec<u8>)>,
    }

    impl DataSink for RecordingSink {
        fn consume(&mut self, kind: SlotKind, payload: &[u8]) -> CommResult<()> {
            if payload == b"reject" {
                return Err(CommError::Malformed("sink rejected payload".into()));
            }
            self.payloads.push((kind, payload.to_vec()));
            Ok(())
        }
    }

    /// Worker running on a thread; nothing to signal.
    struct InProcess;

    impl PeerProcess for InProcess {
        fn pid(&self) -> i32 {
            std::process::id() as i32
        }
        fn request_abort(&mut self) -> CommResult<()> {
            Ok(())
        }
        fn terminate(&mut self) -> CommResult<()> {
            Ok(())
        }
        fn try_reap(&mut self) -> CommResult<Option<ExitStatus>> {
            Ok(None)
        }
    }

    type TestDispatcher<P> = Dispatcher<ScriptedGui, RecordingSink, P>;

    fn in_process(gui: ScriptedGui) -> (TestDispatcher<InProcess>, WorkerPeer) {
        let (channel, endpoints) = create_channel(&IpcConfig::isolated()).unwrap();
        let peer = endpoints.connect(CancelToken::new()).unwrap();
        let dispatcher = Dispatcher::new(channel, gui, RecordingSink::default(), InProcess);
        (dispatcher, peer)
    }

    /// Tick until a request was answered.
    fn tick_until_request<P: PeerProcess>(dispatcher: &mut TestDispatcher<P>) -> TickReport {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let report = dispatcher.tick();
            if report.request_handled || report.escalated {
                return report;
            }
            assert!(Instant::now() < deadline, "no request arrived");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn choice_reply_reaches_the_worker() {
        let gui = ScriptedGui {
            choice: 2,
            ..Default::default()
        };
        let (mut dispatcher, mut peer) = in_process(gui);
        let worker = thread::spawn(move || {
            peer.show_choices(&Choices {
                text: "Pick one".into(),
                labels: vec!["A".into(), "B".into(), "C".into(), "D".into()],
                default: 1,
            })
        });

        let report = tick_until_request(&mut dispatcher);
        assert!(!report.escalated);
        assert_eq!(worker.join().unwrap().unwrap(), 2);
    }

    #[test]
    fn data_is_drained_before_the_next_request() {
        let (mut dispatcher, mut peer) = in_process(ScriptedGui::default());
        peer.publish_data(SlotKind::Data1D, b"first").unwrap();
        peer.print("between").unwrap();
        peer.publish_data(SlotKind::Data2D, b"second").unwrap();
        peer.freeze(true).unwrap();

        let report = dispatcher.tick();
        assert_eq!(report.data_consumed, 1);
        assert!(report.request_handled);
        assert_eq!(dispatcher.gui().printed, vec!["between".to_string()]);
        assert_eq!(dispatcher.sink().payloads.len(), 1);

        let report = dispatcher.tick();
        assert_eq!(report.data_consumed, 1);
        assert_eq!(dispatcher.gui().frozen, Some(true));
        assert_eq!(
            dispatcher.sink().payloads,
            vec![
                (SlotKind::Data1D, b"first".to_vec()),
                (SlotKind::Data2D, b"second".to_vec()),
            ]
        );
        assert!(!dispatcher.queue().dequeue_ready());
        assert_eq!(dispatcher.tick(), TickReport::default());
    }

    #[test]
    fn consumed_segments_go_back_to_the_pool() {
        let (mut dispatcher, mut peer) = in_process(ScriptedGui::default());
        // More blocks than the pool holds at once.
        for round in 0..3u8 {
            for i in 0..4u8 {
                peer.publish_data(SlotKind::Data1D, &[round, i]).unwrap();
            }
            assert_eq!(dispatcher.tick().data_consumed, 4);
        }
        assert_eq!(dispatcher.channel.allocator.live_count(), 0);
        assert_eq!(dispatcher.sink().payloads.len(), 12);
    }

    #[test]
    fn string_and_blob_replies() {
        let (mut dispatcher, mut peer) = in_process(ScriptedGui::default());
        let worker = thread::spawn(move || {
            let path = peer
                .show_file_selector(&FileSelector {
                    default_file: Some("run.dat".into()),
                    ..Default::default()
                })
                .unwrap();
            let input = peer
                .show_input_dialog(&InputDialog {
                    message: "Name".into(),
                    default: None,
                })
                .unwrap();
            let accepted = peer.layout(LayoutOp::ButtonState, &[1, 2, 3]).unwrap();
            let rejected = peer.layout(LayoutOp::MenuDelete, &[9]).unwrap();
            peer.append_output_lines(&["a".to_string(), String::new()]).unwrap();
            (path, input, accepted, rejected)
        });

        for _ in 0..5 {
            tick_until_request(&mut dispatcher);
        }
        let (path, input, accepted, rejected) = worker.join().unwrap();
        assert_eq!(path.as_deref(), Some("run.dat"));
        assert_eq!(input.as_deref(), Some(""));
        assert_eq!(accepted, Some(vec![3, 2, 1]));
        assert_eq!(rejected, None);
        assert_eq!(dispatcher.gui().output, vec!["a".to_string(), String::new()]);
    }

    #[test]
    fn unknown_discriminant_kills_the_worker_and_empties_the_queue() {
        let (channel, endpoints) = create_channel(&IpcConfig::isolated()).unwrap();
        let (spec, _reply_reader, mut request_writer) = endpoints.split();
        let producer = QueueProducer::open(
            &spec.queue_name,
            &spec.semaphore_name,
            spec.capacity,
            spec.poll_interval(),
        )
        .unwrap();
        let token = CancelToken::new();
        producer.enqueue(SlotKind::Request, None, &token).unwrap();
        producer.enqueue(SlotKind::Request, None, &token).unwrap();
        request_writer
            .write_all(&Header::new(999).to_bytes())
            .unwrap();

        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let worker = WorkerProcess::new(child);
        let pid = worker.pid();
        let mut dispatcher =
            Dispatcher::new(channel, ScriptedGui::default(), RecordingSink::default(), worker);

        let report = dispatcher.tick();
        assert!(report.escalated);
        assert!(dispatcher.is_aborted());
        assert!(!process_alive(pid));
        assert!(!dispatcher.queue().dequeue_ready());
        assert_eq!(
            dispatcher.queue().free_slots().unwrap() as usize,
            spec.capacity - 1
        );
        assert!(dispatcher
            .gui()
            .aborted
            .as_deref()
            .is_some_and(|reason| {
                reason.starts_with("protocol violation") && reason.contains("999")
            }));
        assert_eq!(dispatcher.tick(), TickReport::default());
    }

    #[test]
    fn rejected_payload_escalates_and_frees_the_segment() {
        let (channel, endpoints) = create_channel(&IpcConfig::isolated()).unwrap();
        let mut peer = endpoints.connect(CancelToken::new()).unwrap();
        peer.publish_data(SlotKind::Data1D, b"reject").unwrap();
        let unread = peer.publish_data(SlotKind::Data1D, b"never seen").unwrap();

        let mut dispatcher =
            Dispatcher::new(channel, ScriptedGui::default(), RecordingSink::default(), InProcess);
        let report = dispatcher.tick();
        assert!(report.escalated);
        assert!(dispatcher.sink().payloads.is_empty());
        assert!(!dispatcher.queue().dequeue_ready());
        // The first segment is released directly; the second still belongs to
        // this (live) process and stays until its owner goes away.
        assert_eq!(dispatcher.channel.allocator.live_count(), 1);
        dispatcher.channel.allocator.release(unread).unwrap();
    }

    #[test]
    fn worker_death_mid_request_escalates() {
        let (mut dispatcher, mut peer) = in_process(ScriptedGui::default());
        // A marker whose request never follows: the worker end closes.
        peer.print("complete").unwrap();
        let (spec_queue, spec_sem, capacity, poll) = {
            let spec = dispatcher.channel.spec();
            (
                spec.queue_name.clone(),
                spec.semaphore_name.clone(),
                spec.capacity,
                spec.poll_interval(),
            )
        };
        let producer = QueueProducer::open(&spec_queue, &spec_sem, capacity, poll).unwrap();
        producer
            .enqueue(SlotKind::Request, None, &CancelToken::new())
            .unwrap();
        drop(peer);

        assert!(tick_until_request(&mut dispatcher).request_handled);
        let report = dispatcher.tick();
        assert!(report.escalated);
        assert!(dispatcher
            .gui()
            .aborted
            .as_deref()
            .is_some_and(|reason| reason.starts_with("channel failure")));
    }

    #[test]
    fn unencodable_request_leaves_the_tick_idle() {
        let (mut dispatcher, mut peer) = in_process(ScriptedGui::default());
        let result = peer.show_choices(&Choices {
            text: "Pick one".into(),
            labels: vec!["x".into(); 5],
            default: 0,
        });
        assert!(matches!(result, Err(CommError::Malformed(_))));
        assert!(!dispatcher.queue().dequeue_ready());

        let started = Instant::now();
        assert_eq!(dispatcher.tick(), TickReport::default());
        assert!(started.elapsed() < Duration::from_secs(1));

        peer.print("still here").unwrap();
        assert!(dispatcher.tick().request_handled);
        assert_eq!(dispatcher.gui().printed, vec!["still here".to_string()]);
    }

    #[test]
    fn oversized_reply_is_sent_as_null() {
        let limit = IpcConfig::isolated().max_message_size;
        let gui = ScriptedGui {
            selected_file: Some("p".repeat(limit + 1)),
            ..Default::default()
        };
        let (mut dispatcher, mut peer) = in_process(gui);
        let worker = thread::spawn(move || {
            let answer = peer.show_file_selector(&FileSelector::default());
            (answer, peer.is_poisoned())
        });

        let report = tick_until_request(&mut dispatcher);
        assert!(!report.escalated);
        let (answer, poisoned) = worker.join().unwrap();
        assert_eq!(answer.unwrap(), None);
        assert!(!poisoned);
        assert!(!dispatcher.is_aborted());
    }
}
