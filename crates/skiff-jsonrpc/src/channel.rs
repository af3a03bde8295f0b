//! Message-framed duplex byte transport.
//!
//! Framing itself (length prefix, line-delimited JSON, ...) is the
//! implementation's business; the engines only require that one `send`
//! corresponds to exactly one `recv` on the far side, with no partial-frame
//! semantics. The [`direct`] constructor provides an in-process pair used by
//! the test suites and by embeddings that run both endpoints in one process.

use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A framed, bidirectional message channel.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Transmit one framed message. Blocks until the frame is handed to the
    /// transport.
    async fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Receive the next framed message. Returns `Ok(None)` on orderly close
    /// of the remote end.
    async fn recv(&self) -> io::Result<Option<Vec<u8>>>;

    /// Close the channel, unblocking any pending `recv` on either side.
    async fn close(&self) -> io::Result<()>;
}

/// One endpoint of an in-process channel pair.
pub struct Direct {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: CancellationToken,
}

/// Create a connected pair of in-process channels. Frames sent on one side
/// arrive, in order, on the other.
pub fn direct() -> (Direct, Direct) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = Direct {
        tx: Mutex::new(Some(a_tx)),
        rx: tokio::sync::Mutex::new(b_rx),
        closed: CancellationToken::new(),
    };
    let b = Direct {
        tx: Mutex::new(Some(b_tx)),
        rx: tokio::sync::Mutex::new(a_rx),
        closed: CancellationToken::new(),
    };
    (a, b)
}

#[async_trait]
impl Channel for Direct {
    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx
                .send(frame.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")),
        }
    }

    async fn recv(&self) -> io::Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            frame = rx.recv() => Ok(frame),
        }
    }

    async fn close(&self) -> io::Result<()> {
        // Dropping the sender lets the peer drain already-queued frames and
        // then observe EOF; the local token unblocks our own reader now.
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.closed.cancel();
        Ok(())
    }
}
