//! Throughput Estimate
//!
//! A best-effort approximation, not a certified measurement:
//!
//! 1. Sample connect round-trips to the control port for latency and
//!    jitter (mean absolute difference between consecutive samples).
//! 2. Write a fixed-size buffer on a fresh connection and time it:
//!    `upload = bits_written / seconds`.
//! 3. Derive download as `upload * factor`, with the factor picked from
//!    latency/jitter buckets.
//!
//! When no connection can be made the result is a failure with zeroed
//! figures; nothing is invented.

use crate::tester::ProtocolTester;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Chunk size for the upload phase
const WRITE_CHUNK: usize = 16 * 1024;

/// Floor on measured elapsed time, avoids dividing by zero
const MIN_ELAPSED: Duration = Duration::from_millis(1);

/// Result of a speed estimate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeedResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub jitter_ms: f64,
    pub success: bool,
    pub message: String,
}

impl SpeedResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "DL: {:.2}Mbps, UL: {:.2}Mbps, ping: {:.1}ms, jitter: {:.1}ms",
            self.download_mbps, self.upload_mbps, self.ping_ms, self.jitter_ms
        )
    }
}

/// Download/upload ratio for the observed latency and jitter
pub fn download_factor(ping_ms: f64, jitter_ms: f64) -> f64 {
    if ping_ms < 50.0 && jitter_ms < 20.0 {
        1.5
    } else if ping_ms < 100.0 && jitter_ms < 50.0 {
        1.3
    } else if ping_ms < 200.0 {
        1.2
    } else {
        1.1
    }
}

/// Mean absolute difference between consecutive samples
pub fn jitter(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let total: f64 = samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    total / (samples.len() - 1) as f64
}

impl ProtocolTester {
    /// Estimate throughput against the control port
    pub async fn speed_estimate(
        &self,
        ip: IpAddr,
        port: u16,
        sample_size_bytes: usize,
        step_timeout: Duration,
    ) -> SpeedResult {
        let addr = SocketAddr::new(ip, port);

        let latencies = self.sample_latency(addr, step_timeout).await;
        if latencies.is_empty() {
            debug!(%addr, "Speed estimate: no connection could be established");
            return SpeedResult::failed("No connection could be established");
        }

        let ping_ms = latencies.iter().sum::<f64>() / latencies.len() as f64;
        let jitter_ms = jitter(&latencies);

        let (written, elapsed) = match upload_sample(addr, sample_size_bytes, step_timeout).await {
            Ok(measured) => measured,
            Err(message) => return SpeedResult::failed(message),
        };

        let seconds = elapsed.max(MIN_ELAPSED).as_secs_f64();
        let upload_mbps = (written as f64 * 8.0) / seconds / 1_000_000.0;
        let download_mbps = upload_mbps * download_factor(ping_ms, jitter_ms);

        let result = SpeedResult {
            download_mbps,
            upload_mbps,
            ping_ms,
            jitter_ms,
            success: true,
            message: format!("Estimated from {} bytes in {:.3}s", written, seconds),
        };
        info!(%addr, "Speed estimate: {}", result.format());
        result
    }

    /// Connect round-trip samples in milliseconds (failed attempts skipped)
    async fn sample_latency(&self, addr: SocketAddr, step_timeout: Duration) -> Vec<f64> {
        let mut samples = Vec::with_capacity(self.config().latency_samples as usize);

        for _ in 0..self.config().latency_samples {
            let started = Instant::now();
            match timeout(step_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    samples.push(started.elapsed().as_secs_f64() * 1000.0);
                    drop(stream);
                }
                Ok(Err(e)) => debug!(%addr, error = %e, "Latency sample failed"),
                Err(_) => debug!(%addr, "Latency sample timed out"),
            }
        }

        samples
    }
}

/// Write `size` bytes and return how many went out and how long it took
///
/// A peer that resets midway still yields a measurement for the bytes
/// already accepted; zero bytes is a failure.
async fn upload_sample(
    addr: SocketAddr,
    size: usize,
    step_timeout: Duration,
) -> Result<(usize, Duration), String> {
    let mut stream = match timeout(step_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(format!("Upload connect failed: {}", e)),
        Err(_) => return Err("Upload connect timed out".to_string()),
    };
    let _ = stream.set_nodelay(true);

    let chunk = vec![0u8; WRITE_CHUNK.min(size)];
    let mut written = 0usize;
    let started = Instant::now();
    let deadline = started + step_timeout;

    while written < size {
        let n = chunk.len().min(size - written);
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, stream.write_all(&chunk[..n])).await {
            Ok(Ok(())) => written += n,
            Ok(Err(e)) => {
                debug!(%addr, written, error = %e, "Upload interrupted");
                break;
            }
            Err(_) => {
                debug!(%addr, written, "Upload hit the time limit");
                break;
            }
        }
    }
    let _ = timeout(Duration::from_millis(200), stream.flush()).await;
    let elapsed = started.elapsed();

    if written == 0 {
        return Err("Upload phase transferred no data".to_string());
    }
    Ok((written, elapsed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_download_factor_buckets() {
        assert_eq!(download_factor(10.0, 5.0), 1.5);
        assert_eq!(download_factor(40.0, 30.0), 1.3);
        assert_eq!(download_factor(80.0, 40.0), 1.3);
        assert_eq!(download_factor(150.0, 90.0), 1.2);
        assert_eq!(download_factor(350.0, 5.0), 1.1);
    }

    #[test]
    fn test_jitter() {
        assert_eq!(jitter(&[]), 0.0);
        assert_eq!(jitter(&[12.0]), 0.0);
        assert_eq!(jitter(&[10.0, 20.0, 10.0]), 10.0);
    }

    #[tokio::test]
    async fn test_estimate_against_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });

        let tester = ProtocolTester::new(ProbeConfig {
            latency_samples: 3,
            ..Default::default()
        });
        let result = tester
            .speed_estimate(addr.ip(), addr.port(), 256 * 1024, Duration::from_secs(2))
            .await;

        assert!(result.success, "{}", result.message);
        assert!(result.upload_mbps > 0.0);
        assert!(result.download_mbps >= result.upload_mbps);
    }

    #[tokio::test]
    async fn test_no_connection_is_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = ProtocolTester::with_defaults()
            .speed_estimate(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                port,
                1024,
                Duration::from_millis(300),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.upload_mbps, 0.0);
        assert_eq!(result.download_mbps, 0.0);
    }
}
