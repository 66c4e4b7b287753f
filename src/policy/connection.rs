//! Per-connection policy request handling.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use super::request::RequestAttributes;
use crate::ratelimit::{Action, PolicyBackend};

/// A request ends with an empty line.
const REQUEST_TERMINATOR: &[u8] = b"\n\n";
const READ_CHUNK: usize = 256;
const INITIAL_CAPACITY: usize = 2048;

/// Read until the buffer ends with the request terminator.
///
/// There is no size cap or timeout; a client that never finishes its
/// request holds the task.
pub async fn read_request<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(INITIAL_CAPACITY);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of request",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.ends_with(REQUEST_TERMINATOR) {
            return Ok(buf);
        }
    }
}

/// Turn a raw request into a decision.
///
/// A missing or unparsable `recipient_count` is answered with
/// [`Action::Accept`] without consulting the backend.
pub fn evaluate<B>(backend: &B, raw: &[u8]) -> Action
where
    B: PolicyBackend + ?Sized,
{
    let request = RequestAttributes::parse(raw);
    debug!(request = %request, "Received policy request");

    let Some(recipients) = request.recipient_count() else {
        debug!(
            recipient_count = request.get(super::request::RECIPIENT_COUNT),
            "No usable recipient count, accepting"
        );
        return Action::Accept;
    };

    backend.decide(request.sender_identity(), recipients)
}

/// Serve one request on `stream` and close it.
#[instrument(skip_all, fields(peer = %peer))]
pub async fn handle_connection<S, B>(mut stream: S, peer: SocketAddr, backend: Arc<B>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    B: PolicyBackend + ?Sized,
{
    let raw = read_request(&mut stream).await?;
    let action = evaluate(backend.as_ref(), &raw);

    stream.write_all(action.to_response().as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
