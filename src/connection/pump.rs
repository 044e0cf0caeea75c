//! Connection pump: the read/write loop bound to one open stream

use super::attempt::AttemptHandle;
use super::manager::Shared;
use crate::transport::{close_stream, BoxedStream};
use btlink_shared::{LinkError, PeerIdentity};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A single write forwarded from the manager
pub(crate) struct WriteRequest {
    pub payload: Bytes,
    pub done: oneshot::Sender<Result<(), LinkError>>,
}

/// The live pump as held in the manager's slot
pub(crate) struct PumpHandle {
    pub attempt: AttemptHandle,
    pub writer: mpsc::Sender<WriteRequest>,
    pub peer: PeerIdentity,
}

/// Errors after which the endpoint cannot carry more data
fn endpoint_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read until the peer closes or the stream fails; returns the loss reason
async fn read_loop<R: AsyncRead + Unpin>(
    shared: &Shared,
    id: u64,
    reader: &mut R,
    buffer_size: usize,
) -> LinkError {
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return LinkError::StreamLost("peer closed the stream".into()),
            Ok(n) => shared.pump_received(id, Bytes::copy_from_slice(&buf[..n])),
            Err(e) => {
                warn!("[PUMP] Read failed: {}", e);
                return LinkError::StreamLost(e.to_string());
            }
        }
    }
}

/// Serve write requests; returns only when the endpoint reports itself closed
async fn write_loop<W: AsyncWrite + Unpin>(
    shared: &Shared,
    id: u64,
    writer: &mut W,
    requests: &mut mpsc::Receiver<WriteRequest>,
) -> LinkError {
    while let Some(request) = requests.recv().await {
        match write_chunk(writer, &request.payload).await {
            Ok(()) => {
                debug!("[PUMP] Wrote {} bytes", request.payload.len());
                let _ = request.done.send(Ok(()));
            }
            Err(e) => {
                warn!("[PUMP] Write failed: {}", e);
                let err = LinkError::WriteFailed(e.to_string());
                shared.pump_write_failed(id, err.clone());
                let _ = request.done.send(Err(err));
                if endpoint_closed(&e) {
                    return LinkError::StreamLost(e.to_string());
                }
            }
        }
    }
    // The manager dropped its writer; reading carries on until cancelled
    std::future::pending().await
}

/// Run the pump until the stream ends or the token is cancelled.
///
/// Reads and writes progress independently on the two halves of the stream.
/// The stream is shut down exactly once on exit. Loss is reported to the
/// manager only after the stream is closed; cancellation is never reported.
pub(crate) async fn run(
    shared: Arc<Shared>,
    id: u64,
    stream: BoxedStream,
    mut requests: mpsc::Receiver<WriteRequest>,
    token: CancellationToken,
    buffer_size: usize,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let lost = {
        let reading = read_loop(&shared, id, &mut reader, buffer_size);
        let writing = write_loop(&shared, id, &mut writer, &mut requests);
        tokio::select! {
            _ = token.cancelled() => None,
            reason = reading => Some(reason),
            reason = writing => Some(reason),
        }
    };

    close_stream(reader.unsplit(writer)).await;

    match lost {
        Some(reason) => {
            info!("[PUMP] Stream ended: {}", reason);
            shared.pump_ended(id, reason);
        }
        None => debug!("[PUMP] Pump {} cancelled", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_error_kinds() {
        assert!(endpoint_closed(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(endpoint_closed(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!endpoint_closed(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!endpoint_closed(&io::Error::from(io::ErrorKind::Other)));
    }

    #[tokio::test]
    async fn test_write_chunk_flushes_exact_bytes() {
        let mut out = Vec::new();
        write_chunk(&mut out, b"ping").await.unwrap();
        assert_eq!(out, b"ping");
    }
}
