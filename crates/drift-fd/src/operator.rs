//! Operator TCP service.
//!
//! Line-oriented text protocol on the loopback interface. Multi-line
//! replies are framed `211-` ... `200`; unknown commands answer `500`,
//! I/O trouble `520`.
//!
//! Commands: `JL [BLUR]`, `SL`, `TL`, `DF <log-file>`, `QUIT`.

use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use drift_config::Layout;
use drift_ipc::operator as proto;
use drift_log::{LogKind, SignRing};
use drift_registry::{show_job_list, CurrentJobList, JobRegistry};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::supervisor::ActiveTransfer;

pub struct OperatorService {
    pub layout: Layout,
    pub bind: String,
    pub port: u16,
    pub active: Arc<DashMap<i32, ActiveTransfer>>,
}

impl OperatorService {
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind((self.bind.as_str(), self.port)).await?;
        info!(bind = %self.bind, port = self.port, "operator service listening");
        let service = Arc::new(self);

        loop {
            let (stream, peer) = service_accept(&listener).await?;
            debug!(%peer, "operator connected");
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                if let Err(e) = service.handle_client(stream).await {
                    warn!(error = %e, "operator session error");
                }
            });
        }
    }

    async fn handle_client(&self, stream: TcpStream) -> Result<()> {
        let (rd, mut wr) = stream.into_split();
        let mut lines = BufReader::new(rd).lines();

        wr.write_all(b"211- drift operator service ready\n").await?;

        while let Some(line) = lines.next_line().await? {
            let mut words = line.split_whitespace();
            let cmd = words.next().unwrap_or("").to_ascii_uppercase();
            let reply = match cmd.as_str() {
                "" => continue,
                "QUIT" => break,
                "JL" => {
                    let blur = words.next().map(str::to_ascii_uppercase).as_deref()
                        == Some("BLUR");
                    self.job_list(blur)
                }
                "SL" => self.ring_history(LogKind::System, "System log history"),
                "TL" => self.transfer_view(),
                "DF" => self.display_log_file(words.next()),
                _ => {
                    let mut out = Vec::new();
                    let _ = proto::write_unknown(&mut out);
                    Ok(out)
                }
            };

            match reply {
                Ok(bytes) => wr.write_all(&bytes).await?,
                Err(e) => {
                    warn!(error = %e, cmd = %cmd, "operator command failed");
                    let mut out = Vec::new();
                    let _ = proto::write_io_error(&mut out);
                    wr.write_all(&out).await?;
                }
            }
        }
        Ok(())
    }

    fn job_list(&self, blur: bool) -> Result<Vec<u8>> {
        let registry =
            JobRegistry::open(&self.layout.fifodir.join(drift_registry::JOB_ID_DATA_FILE))?;
        // An empty current list means nothing is in flight; show the
        // whole registry then, which is what operators want to see.
        let current_path = self.layout.fifodir.join(drift_registry::CURRENT_JOB_LIST_FILE);
        let current = if current_path.exists() {
            CurrentJobList::open(&current_path)
                .ok()
                .filter(|c| !c.ids().is_empty())
        } else {
            None
        };
        let mut out = Vec::new();
        show_job_list(&mut out, &registry, current.as_ref(), blur)?;
        proto::write_end(&mut out)?;
        Ok(out)
    }

    fn ring_history(&self, kind: LogKind, title: &str) -> Result<Vec<u8>> {
        let ring = SignRing::open_passive(&self.layout.fifodir)?;
        let mut out = Vec::new();
        proto::write_banner(&mut out, title)?;
        let history: String = ring.history(kind).into_iter().collect();
        out.extend_from_slice(format!("{} {}\n", tag_for(kind), history).as_bytes());
        proto::write_end(&mut out)?;
        Ok(out)
    }

    /// Transfer ring plus the live transfer slots.
    fn transfer_view(&self) -> Result<Vec<u8>> {
        let ring = SignRing::open_passive(&self.layout.fifodir)?;
        let mut out = Vec::new();
        proto::write_banner(&mut out, "Transfer log history")?;
        let history: String = ring.history(LogKind::Transfer).into_iter().collect();
        out.extend_from_slice(format!("TL {}\n", history).as_bytes());
        for item in self.active.iter() {
            out.extend_from_slice(
                format!(
                    "AT {} {} {} {}\n",
                    item.key(),
                    item.host_alias,
                    item.msg_name,
                    item.started
                )
                .as_bytes(),
            );
        }
        proto::write_end(&mut out)?;
        Ok(out)
    }

    fn display_log_file(&self, name: Option<&str>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let Some(name) = name else {
            proto::write_unknown(&mut out)?;
            return Ok(out);
        };
        // Only bare file names inside the log directory.
        if name.contains('/') || name.contains("..") {
            proto::write_unknown(&mut out)?;
            return Ok(out);
        }
        proto::display_file(&mut out, &self.layout.log_dir.join(name))?;
        Ok(out)
    }
}

fn tag_for(kind: LogKind) -> &'static str {
    match kind {
        LogKind::System => "SL",
        LogKind::Transfer => "TL",
        _ => "XL",
    }
}

async fn service_accept(
    listener: &TcpListener,
) -> Result<(TcpStream, std::net::SocketAddr)> {
    Ok(listener.accept().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_registry::{JobSpec, DEFAULT_PRIORITY};
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    async fn start_service(dir: &std::path::Path) -> u16 {
        let layout = Layout::new(dir);
        layout.ensure().unwrap();

        let mut registry =
            JobRegistry::open(&layout.fifodir.join(drift_registry::JOB_ID_DATA_FILE)).unwrap();
        registry
            .lookup_job_id(&JobSpec {
                recipient: "ftp://u@h/in".to_string(),
                loptions: Vec::new(),
                soptions: String::new(),
                host_alias: "h".to_string(),
                priority: DEFAULT_PRIORITY,
                dir_id: 1,
                file_mask_id: 2,
                dir_config_id: 3,
                dir_id_pos: 0,
            })
            .unwrap();

        // Pick a free port by binding port 0 first.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let service = OperatorService {
            layout,
            bind: "127.0.0.1".to_string(),
            port,
            active: Arc::new(DashMap::new()),
        };
        tokio::spawn(async move {
            let _ = service.run().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        port
    }

    async fn roundtrip(port: u16, cmd: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(cmd.as_bytes()).await.unwrap();
        stream.write_all(b"\nQUIT\n").await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_job_list_over_the_wire() {
        let temp = tempdir().unwrap();
        let port = start_service(temp.path()).await;

        let reply = roundtrip(port, "JL").await;
        assert!(reply.contains("NJ 1"));
        assert!(reply.contains("ftp://u@h/in"));
        assert!(reply.contains("200 "));
    }

    #[tokio::test]
    async fn test_unknown_command_answers_500() {
        let temp = tempdir().unwrap();
        let port = start_service(temp.path()).await;

        let reply = roundtrip(port, "NONSENSE").await;
        assert!(reply.contains("500 "));
    }

    #[tokio::test]
    async fn test_display_file_rejects_traversal() {
        let temp = tempdir().unwrap();
        let port = start_service(temp.path()).await;

        let reply = roundtrip(port, "DF ../etc/config.toml").await;
        assert!(reply.contains("500 "));

        std::fs::write(Layout::new(temp.path()).log_dir.join("x.log"), "hi\n").unwrap();
        let reply = roundtrip(port, "DF x.log").await;
        assert!(reply.contains("hi"));
        assert!(reply.contains("200 "));
    }
}
