//! Scripted in-memory transport.
//!
//! Reads replay a queue of scripted events; writes are recorded and may
//! release canned replies. Clones share the same state, like a second handle
//! on a real port.

use super::Adapter;
use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

enum MockEvent {
    Data(Vec<u8>),
    Silence,
    Error(String),
    Disconnect,
}

#[derive(Default)]
struct MockState {
    incoming: VecDeque<MockEvent>,
    written: Vec<u8>,
    replies: Vec<(Vec<u8>, Vec<u8>)>,
    disconnected: bool,
    idle_wait: Duration,
}

/// A scripted device.
#[derive(Clone)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// An adapter with an empty script. Reads on an empty script wait 1 ms and time out.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                idle_wait: Duration::from_millis(1),
                ..MockState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues bytes to be returned by the next reads.
    pub fn push_bytes(&self, bytes: impl Into<Vec<u8>>) -> &Self {
        self.lock().incoming.push_back(MockEvent::Data(bytes.into()));
        self
    }

    /// Queues one read that times out.
    pub fn push_silence(&self) -> &Self {
        self.lock().incoming.push_back(MockEvent::Silence);
        self
    }

    /// Queues one failing read.
    pub fn push_error(&self, message: impl Into<String>) -> &Self {
        self.lock()
            .incoming
            .push_back(MockEvent::Error(message.into()));
        self
    }

    /// Queues the loss of the link; every read after it fails.
    pub fn push_disconnect(&self) -> &Self {
        self.lock().incoming.push_back(MockEvent::Disconnect);
        self
    }

    /// When `command` is written, queue `reply` for reading.
    pub fn reply_to(&self, command: impl Into<Vec<u8>>, reply: impl Into<Vec<u8>>) -> &Self {
        self.lock().replies.push((command.into(), reply.into()));
        self
    }

    /// How long a read waits when nothing is scripted.
    pub fn set_idle_wait(&self, wait: Duration) {
        self.lock().idle_wait = wait;
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Number of scripted events not yet consumed.
    pub fn pending(&self) -> usize {
        self.lock().incoming.len()
    }
}

impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(anyhow!("mock device disconnected"));
        }
        match state.incoming.pop_front() {
            Some(MockEvent::Data(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    let rest = bytes.split_off(n);
                    state.incoming.push_front(MockEvent::Data(rest));
                }
                Ok(n)
            }
            Some(MockEvent::Error(message)) => Err(anyhow!(message)),
            Some(MockEvent::Disconnect) => {
                state.disconnected = true;
                Err(anyhow!("mock device disconnected"))
            }
            Some(MockEvent::Silence) | None => {
                let wait = state.idle_wait.min(timeout);
                drop(state);
                std::thread::sleep(wait);
                Ok(0)
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(anyhow!("mock device disconnected"));
        }
        state.written.extend_from_slice(bytes);
        let replies: Vec<Vec<u8>> = state
            .replies
            .iter()
            .filter(|(command, _)| command.as_slice() == bytes)
            .map(|(_, reply)| reply.clone())
            .collect();
        for reply in replies {
            state.incoming.push_back(MockEvent::Data(reply));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.lock().disconnected
    }

    fn try_clone(&self) -> Result<Box<dyn Adapter>> {
        Ok(Box::new(self.clone()))
    }
}
