use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Outcome of one readiness notification on a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    OnError,
    DataEnough,
    Continue,
}

/// What a stage handler wants next once its bytes have arrived.
#[derive(Debug)]
pub enum Advance<S> {
    /// Wait for `needed` more bytes and hand them to `stage`.
    Next(S, usize),
    /// The exchange is complete; close the connection.
    Done,
    /// Protocol failure; close the connection.
    Fail,
}

/// Consumer of completed fixed-length reads.
pub trait StageHandler {
    type Stage;

    /// Stage installed on every freshly accepted connection, with its length.
    fn first_stage(&self) -> (Self::Stage, usize);

    fn on_data(&self, fd: RawFd, stage: Self::Stage, data: Vec<u8>) -> Advance<Self::Stage>;
}

enum ReadOutcome {
    Progress,
    Pending,
    Failed,
}

/// Accumulates exactly `needed` bytes from a non-blocking stream before
/// passing them to the current stage.
#[derive(Debug)]
pub struct FixedLengthReceiver<S> {
    stream: UnixStream,
    needed: usize,
    data: Vec<u8>,
    stage: Option<S>,
}

impl<S> FixedLengthReceiver<S> {
    pub fn new(stream: UnixStream, stage: S, needed: usize) -> Self {
        Self {
            stream,
            needed,
            data: Vec::new(),
            stage: Some(stage),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn needed(&self) -> usize {
        self.needed
    }

    pub fn buffered(&self) -> usize {
        self.data.len()
    }

    /// Reads what is available and runs completed stages. A stage that asks for
    /// more bytes replaces the current one in place and reading resumes.
    pub fn run_once<H>(&mut self, handler: &H) -> ReceiverState
    where
        H: StageHandler<Stage = S>,
    {
        loop {
            if self.data.len() < self.needed {
                match self.read_more() {
                    ReadOutcome::Pending => return ReceiverState::Continue,
                    ReadOutcome::Failed => return ReceiverState::OnError,
                    ReadOutcome::Progress => {}
                }
                if self.data.len() < self.needed {
                    return ReceiverState::Continue;
                }
            }

            let Some(stage) = self.stage.take() else {
                return ReceiverState::OnError;
            };
            let data = std::mem::take(&mut self.data);
            match handler.on_data(self.fd(), stage, data) {
                Advance::Next(stage, needed) => {
                    self.stage = Some(stage);
                    self.needed = needed;
                }
                Advance::Done => return ReceiverState::DataEnough,
                Advance::Fail => return ReceiverState::OnError,
            }
        }
    }

    fn read_more(&mut self) -> ReadOutcome {
        let want = self.needed - self.data.len();
        if self.data.try_reserve_exact(want).is_err() {
            return ReadOutcome::Failed;
        }
        let start = self.data.len();
        self.data.resize(start + want, 0);
        let result = self.stream.read(&mut self.data[start..]);
        match result {
            Ok(0) => {
                self.data.truncate(start);
                ReadOutcome::Failed
            }
            Ok(count) => {
                self.data.truncate(start + count);
                ReadOutcome::Progress
            }
            Err(error) => {
                self.data.truncate(start);
                match error.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => ReadOutcome::Pending,
                    _ => ReadOutcome::Failed,
                }
            }
        }
    }
}
