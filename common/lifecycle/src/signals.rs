use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitSignal {
    Terminate,
    Interrupt,
}

impl ExitSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitSignal::Terminate => "SIGTERM",
            ExitSignal::Interrupt => "SIGINT",
        }
    }
}

impl fmt::Display for ExitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of process exit requests watched by the supervisor.
#[async_trait]
pub trait ExitSignals: Send {
    /// Wait for the next exit request. `None` means the source is exhausted and
    /// will never produce one.
    async fn recv(&mut self) -> Option<ExitSignal>;
}

/// SIGTERM and SIGINT delivered to this process.
pub struct OsSignals {
    terminate: Signal,
    interrupt: Signal,
}

impl OsSignals {
    /// Install the handlers. Must be called within a tokio runtime.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }
}

#[async_trait]
impl ExitSignals for OsSignals {
    async fn recv(&mut self) -> Option<ExitSignal> {
        tokio::select! {
            received = self.terminate.recv() => received.map(|_| ExitSignal::Terminate),
            received = self.interrupt.recv() => received.map(|_| ExitSignal::Interrupt),
        }
    }
}

/// Exit requests sent through a channel, for embedding and tests.
pub struct ChannelSignals {
    rx: mpsc::UnboundedReceiver<ExitSignal>,
}

impl ChannelSignals {
    pub fn new() -> (mpsc::UnboundedSender<ExitSignal>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl ExitSignals for ChannelSignals {
    async fn recv(&mut self) -> Option<ExitSignal> {
        self.rx.recv().await
    }
}
