//! A minimal QMP server on a unix socket, standing in for a VM's monitor.

use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

pub const GREETING: &str =
    r#"{"QMP": {"version": {"qemu": {"micro": 0, "minor": 2, "major": 8}, "package": ""}, "capabilities": ["oob"]}}"#;

/// Serve one session at `path`: greet, accept `qmp_capabilities`, answer
/// `query-cpus-fast` with `num_cpus` vCPUs whose thread ids start at
/// `first_tid`. An event is sent before every reply. Returns the commands
/// received.
pub fn spawn(path: &Path, num_cpus: u32, first_tid: i64) -> JoinHandle<Vec<String>> {
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        write
            .write_all(format!("{}\n", GREETING).as_bytes())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            let cmd: serde_json::Value = serde_json::from_str(&line).unwrap();
            let execute = cmd["execute"].as_str().unwrap_or_default().to_string();
            let reply = match execute.as_str() {
                "qmp_capabilities" => serde_json::json!({"return": {}}),
                "query-cpus-fast" => {
                    let cpus: Vec<serde_json::Value> = (0..num_cpus)
                        .map(|i| {
                            serde_json::json!({
                                "cpu-index": i,
                                "thread-id": first_tid + i as i64,
                                "qom-path": format!("/machine/unattached/device[{}]", i),
                                "target": "x86_64",
                                "props": {"core-id": i, "thread-id": 0, "socket-id": 0}
                            })
                        })
                        .collect();
                    serde_json::json!({"return": cpus})
                }
                other => serde_json::json!({
                    "error": {"class": "CommandNotFound", "desc": format!("The command {} has not been found", other)}
                }),
            };
            seen.push(execute);
            let event = r#"{"event": "RTC_CHANGE", "data": {"offset": 0}, "timestamp": {"seconds": 1, "microseconds": 0}}"#;
            write.write_all(format!("{}\n{}\n", event, reply).as_bytes()).await.unwrap();
        }
        seen
    })
}
