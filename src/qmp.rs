//! QMP client for a VM's monitor socket.
//!
//! One [`QmpClient`] owns one unix-socket session. The session is ready for
//! commands once the greeting was read and `qmp_capabilities` accepted.

use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

pub use qmp_protocol as protocol;

use protocol::{Command, CpuInfoFast, ServerMessage, QMP_CAPABILITIES, QUERY_CPUS_FAST};

use crate::{Error, Result};

/// An open, negotiated monitor session.
pub struct QmpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Connect to `path` and negotiate capabilities.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (read, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer,
        };

        match client.read_message().await? {
            ServerMessage::Greeting(greeting) => {
                debug!("qmp greeting from {}: {}", path.display(), greeting.qmp.version);
            }
            other => {
                return Err(Error::Qmp(format!(
                    "expected greeting from {}, got {:?}",
                    path.display(),
                    other
                )))
            }
        }
        client.execute(QMP_CAPABILITIES).await?;
        Ok(client)
    }

    /// Connect to `path`, retrying until the monitor accepts or `timeout`
    /// elapses. Retry delay starts small and backs off up to `interval`.
    pub async fn wait_ready(path: &Path, timeout: Duration, interval: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let mut delay = interval.min(Duration::from_millis(100));
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match Self::connect(path).await {
                Ok(client) => {
                    debug!("qmp[{}]: ready after {} attempt(s)", path.display(), attempt);
                    return Ok(client);
                }
                Err(e) => {
                    if Instant::now() + delay >= deadline {
                        return Err(Error::Timeout(format!(
                            "monitor {} not ready after {:?} ({} attempts, last error: {})",
                            path.display(),
                            timeout,
                            attempt,
                            e
                        )));
                    }
                    debug!(
                        "qmp[{}]: attempt {} failed: {} (retry in {:?})",
                        path.display(),
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, interval.max(delay));
                }
            }
        }
    }

    /// Run `command` without arguments and return its `return` value.
    pub async fn execute(&mut self, command: &str) -> Result<Value> {
        self.send(Command::new(command)).await
    }

    /// Send `command` and wait for its reply, skipping interleaved events.
    pub async fn send(&mut self, command: Command) -> Result<Value> {
        let line = command.to_line()?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        loop {
            let msg = self.read_message().await?;
            if let ServerMessage::Event { ref event, .. } = msg {
                debug!("qmp: skipping event {}", event);
                continue;
            }
            return Ok(msg.into_result()?);
        }
    }

    /// Live vCPUs and their host thread ids.
    pub async fn query_cpus_fast(&mut self) -> Result<Vec<CpuInfoFast>> {
        let ret = self.execute(QUERY_CPUS_FAST).await?;
        Ok(protocol::parse_cpus_fast(ret)?)
    }

    async fn read_message(&mut self) -> Result<ServerMessage> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(Error::Qmp("monitor closed the connection".into()));
            }
            if !line.trim().is_empty() {
                return Ok(ServerMessage::parse(&line)?);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_ready_times_out_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("qemu-monitor.sock");
        let err = QmpClient::wait_ready(&sock, Duration::from_millis(200), Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_greeting() {
        use tokio::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("mon.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"{\"return\": {}}\n").await.unwrap();
        });
        let err = QmpClient::connect(&sock).await.err().unwrap();
        assert!(matches!(err, Error::Qmp(_)));
    }
}
