//! One-shot request exchange: connect, send one frame, read one frame, close.
//!
//! Neither function returns an error. Any transport or protocol failure is
//! folded into a `CompletionResponse::Error` starting with "Request failed:",
//! so a failing sub-call never takes down the code that issued it.

use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use rlm_core::ProtocolError;
use tracing::debug;

use crate::frame::{read_frame, read_frame_blocking, write_frame, write_frame_blocking};
use crate::message::{CompletionRequest, CompletionResponse};

/// Bound on a whole exchange when the caller has no better value.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

fn failed(e: ProtocolError) -> CompletionResponse {
    debug!(error = %e, "Completion request failed");
    CompletionResponse::error(format!("Request failed: {e}"))
}

/// Blocking exchange for callers without a runtime (subprocess helpers,
/// the `query` command). Name resolution counts against `timeout`.
pub fn send_request<A: ToSocketAddrs + Send + 'static>(
    addr: A,
    request: &CompletionRequest,
    timeout: Duration,
) -> CompletionResponse {
    exchange_blocking(addr, request, timeout).unwrap_or_else(failed)
}

fn exchange_blocking<A: ToSocketAddrs + Send + 'static>(
    addr: A,
    request: &CompletionRequest,
    timeout: Duration,
) -> Result<CompletionResponse, ProtocolError> {
    let payload = request.to_value()?;
    let deadline = Instant::now() + timeout;
    let remaining = || {
        deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(ProtocolError::Timeout(timeout))
    };

    let target = resolve(addr, remaining()?, timeout)?;

    let mut stream = TcpStream::connect_timeout(&target, remaining()?).map_err(|e| timed(e, timeout))?;
    stream.set_write_timeout(Some(remaining()?))?;
    write_frame_blocking(&mut stream, &payload).map_err(|e| timed_protocol(e, timeout))?;

    stream.set_read_timeout(Some(remaining()?))?;
    let reply = read_frame_blocking(&mut stream).map_err(|e| timed_protocol(e, timeout))?;
    let _ = stream.shutdown(Shutdown::Both);

    let value = reply.ok_or(ProtocolError::NoResponse)?;
    CompletionResponse::from_value(value)
}

/// Look `addr` up on a helper thread so a slow resolver cannot outlive
/// the caller's deadline.
fn resolve<A: ToSocketAddrs + Send + 'static>(
    addr: A,
    within: Duration,
    timeout: Duration,
) -> Result<SocketAddr, ProtocolError> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(addr.to_socket_addrs().map(|mut addrs| addrs.next()));
    });
    match rx.recv_timeout(within) {
        Ok(Ok(Some(target))) => Ok(target),
        Ok(Ok(None)) => Err(ProtocolError::Io(std::io::Error::new(
            ErrorKind::InvalidInput,
            "no address",
        ))),
        Ok(Err(e)) => Err(ProtocolError::Io(e)),
        Err(_) => Err(ProtocolError::Timeout(timeout)),
    }
}

fn timed(e: std::io::Error, timeout: Duration) -> ProtocolError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ProtocolError::Timeout(timeout),
        _ => ProtocolError::Io(e),
    }
}

fn timed_protocol(e: ProtocolError, timeout: Duration) -> ProtocolError {
    match e {
        ProtocolError::Io(io) => timed(io, timeout),
        other => other,
    }
}

/// Async exchange, bounded as a whole by `timeout`.
pub async fn send_request_async<A>(
    addr: A,
    request: &CompletionRequest,
    timeout: Duration,
) -> CompletionResponse
where
    A: tokio::net::ToSocketAddrs,
{
    let exchange = async {
        let payload = request.to_value()?;
        let mut stream = tokio::net::TcpStream::connect(addr).await?;
        write_frame(&mut stream, &payload).await?;
        let reply = read_frame(&mut stream).await?;
        let value = reply.ok_or(ProtocolError::NoResponse)?;
        CompletionResponse::from_value(value)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result.unwrap_or_else(failed),
        Err(_) => failed(ProtocolError::Timeout(timeout)),
    }
}
