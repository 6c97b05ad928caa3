use std::collections::BTreeMap;
use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::warn;

use crate::transport::{CompletedTransfer, MultiTransport, TransportHandle};

type Finished = (usize, Box<dyn TransportHandle>, Option<Bytes>);

/// [`MultiTransport`] that performs each added handle on its own thread.
///
/// Handles are started on the next [`MultiTransport::perform`] call after
/// being added; completions are reported back over a channel.
pub struct ThreadMulti {
    queued: Vec<(usize, Box<dyn TransportHandle>)>,
    running: usize,
    finished: BTreeMap<usize, CompletedTransfer>,
    sender: Sender<Finished>,
    receiver: Receiver<Finished>,
}

impl ThreadMulti {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            queued: Vec::new(),
            running: 0,
            finished: BTreeMap::new(),
            sender,
            receiver,
        }
    }

    fn start_queued(&mut self) {
        for (token, mut handle) in self.queued.drain(..) {
            let sender = self.sender.clone();
            self.running += 1;
            thread::spawn(move || {
                let content = match catch_unwind(AssertUnwindSafe(|| handle.perform())) {
                    Ok(content) => content,
                    Err(_) => {
                        warn!(token, "transfer panicked; reporting it as failed");
                        None
                    }
                };
                let _ = sender.send((token, handle, content));
            });
        }
    }

    fn record(&mut self, (token, handle, content): Finished) {
        self.running = self.running.saturating_sub(1);
        self.finished
            .insert(token, CompletedTransfer { handle, content });
    }
}

impl Default for ThreadMulti {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiTransport for ThreadMulti {
    fn add(&mut self, token: usize, handle: Box<dyn TransportHandle>) {
        self.finished.remove(&token);
        self.queued.push((token, handle));
    }

    fn perform(&mut self) -> usize {
        self.start_queued();
        loop {
            match self.receiver.try_recv() {
                Ok(finished) => self.record(finished),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.running
    }

    fn poll(&mut self, timeout: Duration) -> io::Result<()> {
        if self.running == 0 {
            return Ok(());
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(finished) => {
                self.record(finished);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transfer completion channel closed",
            )),
        }
    }

    fn remove(&mut self, token: usize) -> Option<CompletedTransfer> {
        self.finished.remove(&token)
    }
}
