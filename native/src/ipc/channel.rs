// Duplex pipe pair carrying the request/reply protocol.

use log::{debug, trace};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use super::protocol::{Message, MessageKind};
use super::wire;
use crate::cancel::CancelToken;
use crate::error::{CommError, CommResult};

/// Inbound side of a control channel.
///
/// `wait_readable` is the cancellation point in front of a read: it may only
/// return once data (or EOF) is pending, or with `Err(Cancelled)`. The read
/// itself is never interrupted half way.
pub trait Inbound: Read {
    fn wait_readable(&mut self, _cancel: &CancelToken, _poll: Duration) -> CommResult<()> {
        Ok(())
    }
}

/// Read end of a pipe.
#[derive(Debug)]
pub struct PipeReader {
    file: File,
}

/// Write end of a pipe.
#[derive(Debug)]
pub struct PipeWriter {
    file: File,
}

/// Create a pipe whose ends are closed on exec.
pub fn pipe() -> CommResult<(PipeReader, PipeWriter)> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;
    Ok((PipeReader::from(read_end), PipeWriter::from(write_end)))
}

impl From<OwnedFd> for PipeReader {
    fn from(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }
}

impl From<OwnedFd> for PipeWriter {
    fn from(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }
}

impl AsRawFd for PipeReader {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsRawFd for PipeWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Inbound for PipeReader {
    fn wait_readable(&mut self, cancel: &CancelToken, poll_interval: Duration) -> CommResult<()> {
        let millis = poll_interval.as_millis().clamp(1, u16::MAX as u128) as u16;
        loop {
            cancel.check()?;
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) => continue,
                // POLLHUP also ends up here; the read that follows reports EOF.
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Inbound for &[u8] {}

/// One end of the control channel: where requests (or replies) come from and
/// where the other kind goes.
pub struct ControlChannel<R, W> {
    reader: R,
    writer: W,
    max_message_size: usize,
    poll_interval: Duration,
}

impl<R: Inbound, W: Write> ControlChannel<R, W> {
    pub fn new(reader: R, writer: W, max_message_size: usize, poll_interval: Duration) -> Self {
        Self {
            reader,
            writer,
            max_message_size,
            poll_interval,
        }
    }

    /// Encode `message` and write it in one go.
    pub fn write_message(&mut self, message: &Message) -> CommResult<()> {
        let bytes = self.encode(message)?;
        self.write_encoded(&bytes)?;
        trace!("[IPC] Sent {:?}", message.kind());
        Ok(())
    }

    /// Encode `message` within this channel's size limit without sending it.
    pub fn encode(&self, message: &Message) -> CommResult<Vec<u8>> {
        message.encode(self.max_message_size)
    }

    /// Write a message produced by [`encode`](Self::encode).
    pub fn write_encoded(&mut self, bytes: &[u8]) -> CommResult<()> {
        wire::write_full(&mut self.writer, bytes)?;
        trace!("[IPC] Wrote {} bytes", bytes.len());
        Ok(())
    }

    /// Read one complete message. With a token, waiting for the first byte is
    /// cancellable; once bytes flow the transfer runs to completion.
    pub fn read_message(&mut self, cancel: Option<&CancelToken>) -> CommResult<Message> {
        if let Some(token) = cancel {
            self.reader.wait_readable(token, self.poll_interval)?;
        }
        let message = Message::read_from(&mut self.reader, self.max_message_size)?;
        trace!("[IPC] Received {:?}", message.kind());
        Ok(message)
    }

    /// Read one message that must be of kind `expected`.
    pub fn read_expected(
        &mut self,
        expected: MessageKind,
        cancel: Option<&CancelToken>,
    ) -> CommResult<Message> {
        let message = self.read_message(cancel)?;
        if message.kind() != expected {
            debug!(
                "[IPC] Expected {:?} but peer sent {:?}",
                expected,
                message.kind()
            );
            return Err(CommError::UnexpectedKind {
                expected,
                actual: message.kind(),
            });
        }
        Ok(message)
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::Choices;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(5);

    /// Two channels wired back to back, as the two processes see them.
    fn wired() -> (
        ControlChannel<PipeReader, PipeWriter>,
        ControlChannel<PipeReader, PipeWriter>,
    ) {
        let (request_rx, request_tx) = pipe().unwrap();
        let (reply_rx, reply_tx) = pipe().unwrap();
        let controller = ControlChannel::new(request_rx, reply_tx, 4096, POLL);
        let worker = ControlChannel::new(reply_rx, request_tx, 4096, POLL);
        (controller, worker)
    }

    #[test]
    fn request_and_reply_cross_the_pipes() {
        let (mut controller, mut worker) = wired();
        let request = Message::ShowChoices(Choices {
            text: "Pick one".into(),
            labels: vec!["A".into(), "B".into(), "C".into(), "D".into()],
            default: 1,
        });

        let handle = std::thread::spawn(move || {
            worker.write_message(&request).unwrap();
            let token = CancelToken::new();
            worker
                .read_expected(MessageKind::Int, Some(&token))
                .unwrap()
        });

        let received = controller.read_message(None).unwrap();
        assert_eq!(received.kind(), MessageKind::ShowChoices);
        controller.write_message(&Message::Int(2)).unwrap();

        assert_eq!(handle.join().unwrap(), Message::Int(2));
    }

    #[test]
    fn waiting_for_a_reply_is_cancellable() {
        let (_controller, mut worker) = wired();
        let token = CancelToken::new();
        let remote = token.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        let started = Instant::now();
        let result = worker.read_message(Some(&token));
        canceller.join().unwrap();

        assert!(matches!(result, Err(CommError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn closed_peer_is_detected() {
        let (controller, mut worker) = wired();
        drop(controller);
        let token = CancelToken::new();
        assert!(matches!(
            worker.read_message(Some(&token)),
            Err(CommError::PeerGone { transferred: 0, .. })
        ));
        assert!(matches!(
            worker.write_message(&Message::Print("late".into())),
            Err(CommError::BrokenPipe)
        ));
    }

    #[test]
    fn wrong_reply_kind_is_rejected() {
        let (mut controller, mut worker) = wired();
        controller
            .write_message(&Message::Str(Some("path".into())))
            .unwrap();
        assert!(matches!(
            worker.read_expected(MessageKind::Int, None),
            Err(CommError::UnexpectedKind {
                expected: MessageKind::Int,
                actual: MessageKind::Str,
            })
        ));
    }

    #[test]
    fn slices_serve_as_inbound() {
        let bytes = Message::Freeze(true).encode(64).unwrap();
        let mut channel = ControlChannel::new(bytes.as_slice(), Vec::new(), 64, POLL);
        assert_eq!(channel.read_message(None).unwrap(), Message::Freeze(true));
    }
}
