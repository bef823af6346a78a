/// Host availability probing (ICMP ping plus SSH port check)
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use super::command::CommandBuilder;
use super::polling::PollingConfig;
use crate::robot::error::Result;

pub const SSH_PORT: u16 = 22;

/// Answers whether a host is up right now
#[async_trait]
pub trait HostProber: Send + Sync {
    async fn is_reachable(&self, host: &str) -> bool;
}

/// Probes with the system `ping` binary, then a TCP connect to the SSH port
#[derive(Debug, Clone)]
pub struct NetworkProber {
    ping_timeout_secs: u64,
    connect_timeout: Duration,
    port: u16,
    use_ping: bool,
}

impl Default for NetworkProber {
    fn default() -> Self {
        Self {
            ping_timeout_secs: 5,
            connect_timeout: Duration::from_secs(5),
            port: SSH_PORT,
            use_ping: true,
        }
    }
}

impl NetworkProber {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Skip ICMP, for networks that drop it
    pub fn without_ping(mut self) -> Self {
        self.use_ping = false;
        self
    }

    async fn ping(&self, host: &str) -> bool {
        let wait = self.ping_timeout_secs.to_string();
        match CommandBuilder::new("ping")
            .args(["-c", "1", "-W", wait.as_str(), host])
            .context(format!("Failed to run ping for {host}"))
            .deadline(Duration::from_secs(self.ping_timeout_secs + 5))
            .output()
            .await
        {
            Ok(output) if output.success => true,
            Ok(output) => {
                if !output.stderr.is_empty() {
                    debug!(host = %host, stderr = %output.stderr, "ping failed");
                }
                false
            }
            Err(e) => {
                debug!(host = %host, error = %e, "ping unavailable");
                false
            }
        }
    }

    async fn port_open(&self, host: &str) -> bool {
        let connect = TcpStream::connect((host, self.port));
        matches!(
            tokio::time::timeout(self.connect_timeout, connect).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl HostProber for NetworkProber {
    async fn is_reachable(&self, host: &str) -> bool {
        if self.use_ping && !self.ping(host).await {
            debug!(host = %host, "no ping reply");
            return false;
        }
        let open = self.port_open(host).await;
        if !open {
            debug!(host = %host, port = self.port, "port closed");
        }
        open
    }
}

/// Wait until the host answers
pub async fn wait_for_host<P>(prober: &P, host: &str, polling: &PollingConfig) -> Result<()>
where
    P: HostProber + ?Sized,
{
    polling
        .poll_until(|| async move { Ok(prober.is_reachable(host).await) })
        .await
}

/// Wait until the host stops answering
pub async fn wait_for_host_down<P>(prober: &P, host: &str, polling: &PollingConfig) -> Result<()>
where
    P: HostProber + ?Sized,
{
    polling
        .poll_until(|| async move { Ok(!prober.is_reachable(host).await) })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    /// Becomes reachable on the n-th probe
    struct CountingProber {
        calls: AtomicU32,
        up_after: u32,
    }

    #[async_trait]
    impl HostProber for CountingProber {
        async fn is_reachable(&self, _host: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst) + 1 >= self.up_after
        }
    }

    fn fast(description: &str) -> PollingConfig {
        PollingConfig::from_durations(
            Duration::from_millis(500),
            Duration::from_millis(5),
            description,
        )
    }

    #[tokio::test]
    async fn test_open_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let prober = NetworkProber::new().without_ping().with_port(port);
        assert!(prober.is_reachable("127.0.0.1").await);
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = NetworkProber::new().without_ping().with_port(port);
        assert!(!prober.is_reachable("127.0.0.1").await);
    }

    #[tokio::test]
    async fn test_wait_for_host_polls_until_up() {
        let prober = CountingProber {
            calls: AtomicU32::new(0),
            up_after: 3,
        };

        wait_for_host(&prober, "10.0.0.1", &fast("waiting for host"))
            .await
            .unwrap();
        assert_eq!(prober.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_for_host_down_times_out_while_up() {
        let prober = CountingProber {
            calls: AtomicU32::new(0),
            up_after: 0,
        };

        let polling = PollingConfig::from_durations(
            Duration::from_millis(30),
            Duration::from_millis(5),
            "waiting for shutdown",
        );
        let result = wait_for_host_down(&prober, "10.0.0.1", &polling).await;
        assert!(result.is_err());
    }
}
