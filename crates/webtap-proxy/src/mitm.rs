//! MITM session: the two decrypted legs of an intercepted CONNECT.
//!
//! Client→server bytes are checked against the adapter's record trigger until
//! it matches once; from then on every server→client chunk is also handed to
//! the capture loop. The first direction to hit EOF, an error, or a read that
//! starts with the chunked terminator fires the disconnect signal, which stops
//! the other direction as well.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use webtap_core::ProtocolAdapter;

use crate::capture::{self, CAPTURE_CHANNEL_CAPACITY};
use crate::sniff::SniffControl;
use crate::tunnel::PUMP_BUFFER_SIZE;

/// Trailing request bytes kept for the record trigger check.
const FINGERPRINT_WINDOW: usize = 8 * 1024;

/// Chunked-encoding terminator that ends a session when a read starts with it.
const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Upper bound on closing a writer once its direction has ended.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Byte counts and capture outcome of a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Client→server bytes.
    pub sent: u64,
    /// Server→client bytes.
    pub received: u64,
    /// Whether the record trigger matched.
    pub recorded: bool,
    /// Events handed to the queue.
    pub queued: usize,
}

/// Relays one intercepted session until either side ends.
pub async fn run<C, S>(
    client: C,
    server: S,
    adapter: Option<Arc<dyn ProtocolAdapter>>,
    control: SniffControl,
) -> SessionStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (disconnect_tx, disconnect_rx) = watch::channel(false);
    let recording = AtomicBool::new(false);

    let (chunk_tx, chunk_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
    let capture = adapter.clone().map(|adapter| {
        tokio::spawn(capture::run(
            adapter,
            chunk_rx,
            disconnect_rx.clone(),
            control,
        ))
    });

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let upstream = Pump {
        disconnect: &disconnect_tx,
        stop: disconnect_rx.clone(),
    }
    .client_to_server(
        &mut client_read,
        &mut server_write,
        adapter.as_deref(),
        &recording,
    );
    let downstream = Pump {
        disconnect: &disconnect_tx,
        stop: disconnect_rx,
    }
    .server_to_client(&mut server_read, &mut client_write, &recording, chunk_tx);

    let (sent, received) = tokio::join!(upstream, downstream);

    let queued = match capture {
        Some(task) => task.await.unwrap_or_else(|e| {
            tracing::warn!("capture task failed: {}", e);
            0
        }),
        None => 0,
    };

    let stats = SessionStats {
        sent,
        received,
        recorded: recording.load(Ordering::SeqCst),
        queued,
    };
    tracing::debug!(?stats, "mitm session closed");
    stats
}

/// Resolves once the disconnect signal has fired or its sender is gone.
pub(crate) async fn disconnected(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|fired| *fired).await;
}

fn fire(tx: &watch::Sender<bool>) {
    tx.send_if_modified(|fired| !std::mem::replace(fired, true));
}

/// Shuts a writer down, giving up on a peer that no longer reads.
async fn close<W: AsyncWrite + Unpin>(writer: &mut W) {
    match tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::trace!("shutdown failed: {}", e),
        Err(_) => tracing::debug!("shutdown timed out, dropping connection"),
    }
}

struct Pump<'a> {
    disconnect: &'a watch::Sender<bool>,
    stop: watch::Receiver<bool>,
}

impl Pump<'_> {
    async fn client_to_server<R, W>(
        mut self,
        reader: &mut R,
        writer: &mut W,
        adapter: Option<&dyn ProtocolAdapter>,
        recording: &AtomicBool,
    ) -> u64
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = [0u8; PUMP_BUFFER_SIZE];
        let mut fingerprint = Vec::new();
        let mut total = 0u64;

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!("client read ended: {}", e);
                        break;
                    }
                },
                _ = disconnected(&mut self.stop) => break,
            };

            if let Some(adapter) = adapter {
                if !recording.load(Ordering::SeqCst) {
                    fingerprint.extend_from_slice(&buf[..n]);
                    if adapter.should_record(&fingerprint) {
                        recording.store(true, Ordering::SeqCst);
                        fingerprint = Vec::new();
                        tracing::debug!(adapter = adapter.name(), "recording session");
                    } else if fingerprint.len() > FINGERPRINT_WINDOW {
                        fingerprint.drain(..fingerprint.len() - FINGERPRINT_WINDOW);
                    }
                }
            }

            tokio::select! {
                written = writer.write_all(&buf[..n]) => {
                    if let Err(e) = written {
                        tracing::debug!("server write failed: {}", e);
                        break;
                    }
                }
                _ = disconnected(&mut self.stop) => break,
            }
            total += n as u64;
        }

        fire(self.disconnect);
        close(writer).await;
        total
    }

    async fn server_to_client<R, W>(
        mut self,
        reader: &mut R,
        writer: &mut W,
        recording: &AtomicBool,
        chunks: mpsc::Sender<Vec<u8>>,
    ) -> u64
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = [0u8; PUMP_BUFFER_SIZE];
        let mut total = 0u64;

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        tracing::debug!("server read ended: {}", e);
                        break;
                    }
                },
                _ = disconnected(&mut self.stop) => break,
            };
            let data = &buf[..n];

            if recording.load(Ordering::SeqCst) && chunks.send(data.to_vec()).await.is_err() {
                tracing::debug!("capture loop gone, forwarding only");
            }

            tokio::select! {
                written = writer.write_all(data) => {
                    if let Err(e) = written {
                        tracing::debug!("client write failed: {}", e);
                        break;
                    }
                }
                _ = disconnected(&mut self.stop) => break,
            }
            total += n as u64;

            if data.starts_with(CHUNKED_TERMINATOR) {
                tracing::trace!("chunked terminator seen");
                break;
            }
        }

        fire(self.disconnect);
        close(writer).await;
        total
    }
}
