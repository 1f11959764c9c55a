//! Blind tunnel for CONNECT targets outside the sniff policy.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Pump buffer size.
pub(crate) const PUMP_BUFFER_SIZE: usize = 4096;

/// Copies bytes both ways until each side has ended.
///
/// Each direction stops on EOF or error and shuts down the write half of the
/// opposite side. Returns `(client_to_target, target_to_client)` byte counts.
pub async fn forward<C, T>(client: C, target: T) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);

    let upstream = pump(&mut client_read, &mut target_write);
    let downstream = pump(&mut target_read, &mut client_write);
    let (sent, received) = tokio::join!(upstream, downstream);

    tracing::debug!(sent, received, "tunnel closed");
    (sent, received)
}

async fn pump<R, W>(reader: &mut R, writer: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; PUMP_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("tunnel read ended: {}", e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            tracing::debug!("tunnel write ended: {}", e);
            break;
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_both_directions_untouched() {
        let (client, mut client_peer) = tokio::io::duplex(64);
        let (target, mut target_peer) = tokio::io::duplex(64);

        let tunnel = tokio::spawn(forward(client, target));

        // Larger than the duplex buffer and the pump buffer together.
        let request: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let expected = request.clone();

        let writer = tokio::spawn(async move {
            client_peer.write_all(&request).await.unwrap();
            client_peer.shutdown().await.unwrap();
            let mut reply = Vec::new();
            client_peer.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let mut seen = Vec::new();
        target_peer.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, expected);

        target_peer.write_all(b"\x16\x03\x01binary reply").await.unwrap();
        target_peer.shutdown().await.unwrap();
        drop(target_peer);

        assert_eq!(writer.await.unwrap(), b"\x16\x03\x01binary reply");
        assert_eq!(tunnel.await.unwrap(), (10_000, 15));
    }
}
