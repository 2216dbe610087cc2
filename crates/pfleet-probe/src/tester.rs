//! Protocol Tester
//!
//! Judges a node from its control port alone. No data tunnel is built:
//!
//! 1. **PingLight**: bare TCP connect
//! 2. **PingAuth**: Start-Control-Connection, then an Outgoing-Call carrying
//!    the login
//! 3. **SpeedEstimate**: see [`SpeedResult`](crate::SpeedResult)
//!
//! Each step runs sequentially on its own connection with explicit
//! timeouts. Transient failures get one retry with a longer timeout;
//! protocol and credential failures are final.

use crate::config::ProbeConfig;
use crate::error::{ProbeError, ProbeErrorKind};
use crate::pptp::{
    OutgoingCallReply, OutgoingCallRequest, StartControlReply, StartControlRequest,
    MAX_MESSAGE_LEN, OUTGOING_CALL_REPLY_LEN, START_CONTROL_LEN,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Result of an authenticated ping
#[derive(Debug, Clone, PartialEq)]
pub struct PingResult {
    /// Call accepted
    pub success: bool,
    /// Wall time of the successful attempt (ms)
    pub elapsed_ms: u64,
    /// Human-readable outcome
    pub message: String,
    /// Failure class, when failed
    pub reason: Option<ProbeErrorKind>,
    /// Outgoing-Call-Reply result code, when one was read
    pub result_code: Option<u8>,
}

impl PingResult {
    fn accepted(elapsed: Duration, start_result: u8, call_result: u8) -> Self {
        Self {
            success: true,
            elapsed_ms: elapsed.as_millis() as u64,
            message: format!(
                "Call established (control result {}, call result {})",
                start_result, call_result
            ),
            reason: None,
            result_code: Some(call_result),
        }
    }

    fn failed(error: &ProbeError, elapsed: Duration) -> Self {
        let result_code = match error {
            ProbeError::CallRejected(code) => Some(*code),
            _ => None,
        };
        Self {
            success: false,
            elapsed_ms: elapsed.as_millis() as u64,
            message: error.to_string(),
            reason: Some(error.kind()),
            result_code,
        }
    }
}

/// PPTP control-connection tester
pub struct ProtocolTester {
    config: ProbeConfig,
    next_call_id: AtomicU16,
}

impl ProtocolTester {
    /// Create a tester
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            next_call_id: AtomicU16::new(1),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(ProbeConfig::default())
    }

    /// Get configuration
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Bare TCP connect; no protocol bytes are exchanged
    pub async fn ping_light(&self, ip: IpAddr, port: u16, connect_timeout: Duration) -> bool {
        let addr = SocketAddr::new(ip, port);
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {
                debug!(%addr, "Control port open");
                true
            }
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "Control port closed");
                false
            }
            Err(_) => {
                debug!(%addr, "Control port connect timed out");
                false
            }
        }
    }

    /// Control handshake plus an outgoing call carrying `login`
    ///
    /// `password` never goes on the wire: the control channel has no field
    /// for it. It is accepted so callers treat this as the credential
    /// check it approximates.
    pub async fn ping_auth(
        &self,
        ip: IpAddr,
        port: u16,
        login: &str,
        _password: &str,
        base_timeout: Duration,
    ) -> PingResult {
        let addr = SocketAddr::new(ip, port);
        let mut attempt = 0;

        loop {
            let scaled = base_timeout.mul_f64(self.config.scale(attempt));
            let started = Instant::now();

            match self.handshake(addr, login, scaled).await {
                Ok((start_result, call_result)) => {
                    let result = PingResult::accepted(started.elapsed(), start_result, call_result);
                    info!(%addr, elapsed_ms = result.elapsed_ms, call_result, "PPTP call established");
                    return result;
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.config.attempts => {
                    attempt += 1;
                    let delay = self.config.backoff(attempt);
                    debug!(%addr, error = %e, ?delay, "Transient failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    debug!(%addr, error = %e, kind = %e.kind(), "PPTP ping failed");
                    return PingResult::failed(&e, started.elapsed());
                }
            }
        }
    }

    /// One full handshake attempt; returns both result codes
    async fn handshake(
        &self,
        addr: SocketAddr,
        login: &str,
        step_timeout: Duration,
    ) -> Result<(u8, u8), ProbeError> {
        let mut stream = timeout(step_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProbeError::Timeout("connect"))??;
        stream.set_nodelay(true)?;

        // Start-Control-Connection
        let request = StartControlRequest::default().encode();
        timeout(step_timeout, stream.write_all(&request))
            .await
            .map_err(|_| ProbeError::Timeout("start-control write"))??;

        let reply = read_message(&mut stream, START_CONTROL_LEN, step_timeout, "start-control reply")
            .await?;
        let start = StartControlReply::parse(&reply)?;
        if !start.is_success() {
            // Some servers report failure here and still accept calls
            warn!(
                %addr,
                result_code = start.result_code,
                error_code = start.error_code,
                "Start-control reply not successful, continuing"
            );
        }

        // Outgoing-Call
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let request = OutgoingCallRequest::for_login(call_id, login).encode();
        timeout(step_timeout, stream.write_all(&request))
            .await
            .map_err(|_| ProbeError::Timeout("outgoing-call write"))??;

        let reply = read_message(
            &mut stream,
            OUTGOING_CALL_REPLY_LEN,
            step_timeout,
            "outgoing-call reply",
        )
        .await?;
        let call = OutgoingCallReply::parse(&reply)?;

        if !call.is_established() {
            return Err(ProbeError::CallRejected(call.result_code));
        }

        Ok((start.result_code, call.result_code))
    }
}

/// Read one length-prefixed control message
async fn read_message(
    stream: &mut TcpStream,
    expected: usize,
    step_timeout: Duration,
    stage: &'static str,
) -> Result<Vec<u8>, ProbeError> {
    let read = async {
        let mut len_buf = [0u8; 2];
        stream
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| ProbeError::from_read(e, expected))?;

        let len = u16::from_be_bytes(len_buf) as usize;
        if !(12..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(ProbeError::Malformed(format!("{} declares length {}", stage, len)));
        }

        let mut msg = vec![0u8; len];
        msg[..2].copy_from_slice(&len_buf);
        read_fully(stream, &mut msg[2..], len).await?;
        Ok(msg)
    };

    timeout(step_timeout, read)
        .await
        .map_err(|_| ProbeError::Timeout(stage))?
}

/// `read_exact` that reports how much actually arrived on EOF
async fn read_fully(stream: &mut TcpStream, buf: &mut [u8], declared: usize) -> Result<(), ProbeError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(ProbeError::ShortResponse {
                expected: declared,
                got: filled + 2,
            });
        }
        filled += n;
    }
    Ok(())
}
