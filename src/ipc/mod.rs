//! Loopback control protocol server.
//!
//! One command per connection: read a single newline-terminated line,
//! dispatch it into the [`Supervisor`], write a reply (`OK`, a value, or
//! `ERR <reason>`) and close.

pub mod command;

use anyhow::Result;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::supervisor::Supervisor;
pub use command::Command;

/// 한 줄 요청의 최대 길이
const MAX_REQUEST_BYTES: u64 = 8 * 1024;

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
    pub read_timeout: Duration,
}

impl IPCServer {
    pub fn new(supervisor: Arc<Supervisor>, listen_addr: &str, read_timeout: Duration) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
            read_timeout,
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("Control server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept until the supervisor's shutdown token is cancelled.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let shutdown = self.supervisor.shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Control server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            tracing::debug!("Connection {} ended with error: {}", peer, e);
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if !is_loopback_peer(&peer) {
            tracing::warn!("Refused control connection from non-loopback peer {}", peer);
            stream.write_all(b"ERR forbidden\n").await?;
            stream.shutdown().await?;
            return Ok(());
        }

        let (rd, mut wr) = stream.split();
        let mut reader = BufReader::new(rd).take(MAX_REQUEST_BYTES);
        let mut buf = Vec::new();

        let reply = match tokio::time::timeout(self.read_timeout, reader.read_until(b'\n', &mut buf)).await {
            Err(_) => {
                tracing::debug!("{}: no request within {:?}", peer, self.read_timeout);
                "ERR timeout".to_string()
            }
            Ok(Err(e)) => {
                tracing::debug!("{}: read failed: {}", peer, e);
                format!("ERR {}", e)
            }
            Ok(Ok(n)) if n as u64 >= MAX_REQUEST_BYTES && !buf.ends_with(b"\n") => {
                tracing::warn!("{}: request exceeds {} bytes, rejected", peer, MAX_REQUEST_BYTES);
                // 남은 입력을 비워야 응답 전에 RST 가 나가지 않음
                let _ = tokio::time::timeout(self.read_timeout, discard_line(reader.get_mut())).await;
                "ERR request too long".to_string()
            }
            Ok(Ok(_)) => match String::from_utf8(buf) {
                Ok(line) => {
                    let cmd = Command::parse(&line);
                    tracing::debug!("{} -> {}", peer, cmd.verb());
                    dispatch(&self.supervisor, cmd).await
                }
                Err(_) => "ERR request is not valid UTF-8".to_string(),
            },
        };

        wr.write_all(reply.as_bytes()).await?;
        wr.write_all(b"\n").await?;
        wr.flush().await?;
        wr.shutdown().await?;
        Ok(())
    }
}

/// Execute one command and render its single reply.
pub async fn dispatch(supervisor: &Arc<Supervisor>, cmd: Command) -> String {
    match cmd {
        Command::Status => supervisor.status().await,
        Command::Activate => supervisor.active_app().await,
        Command::List | Command::AppOrder => match supervisor.app_order().await {
            Ok(order) => order.join("\n"),
            Err(e) => e.to_reply(),
        },
        Command::Info(name) => match supervisor.app_info(name.as_deref()).await {
            Ok(app) => format!("{}|||{}|||{}", app.name, app.path, app.args.join(" ")),
            Err(e) => e.to_reply(),
        },
        Command::GetAppInfo => match supervisor.app_info(None).await {
            Ok(app) => format!("{}|||{}", app.path, app.args.join(" ")),
            Err(e) => e.to_reply(),
        },
        Command::Run(args) => {
            // 비동기 실행: 결과는 status 로 확인
            let sup = supervisor.clone();
            tokio::spawn(async move {
                if let Err(e) = sup.run(args).await {
                    tracing::warn!("run: {}", e);
                }
            });
            "OK".to_string()
        }
        Command::Switch(None) => "ERR need app name".to_string(),
        Command::Switch(Some(name)) => reply_of(supervisor.switch(&name).await, "switch"),
        Command::Restart => reply_of(supervisor.restart().await, "restart"),
        Command::Stop => reply_of(supervisor.stop().await, "stop"),
        Command::Reload => match supervisor.reload().await {
            Ok(()) => {
                tracing::info!("Configuration reloaded");
                "OK".to_string()
            }
            Err(e) => {
                tracing::warn!("Reload failed: {}", e);
                format!("ERR reload failed: {}", e)
            }
        },
        Command::Exit => {
            supervisor.request_exit();
            "OK".to_string()
        }
        Command::Empty => "ERR empty command".to_string(),
        Command::Unknown(verb) => {
            tracing::debug!("Unknown command '{}'", verb);
            "ERR unknown command".to_string()
        }
    }
}

fn reply_of<T>(result: Result<T, crate::supervisor::SupervisorError>, verb: &str) -> String {
    match result {
        Ok(_) => "OK".to_string(),
        Err(e) => {
            tracing::warn!("{} failed [{}]: {}", verb, e.error_code(), e);
            e.to_reply()
        }
    }
}

/// Consume input up to and including the next newline, or to EOF.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        if let Some(i) = chunk.iter().position(|&b| b == b'\n') {
            reader.consume(i + 1);
            return Ok(());
        }
        let n = chunk.len();
        reader.consume(n);
    }
}

fn is_loopback_peer(peer: &SocketAddr) -> bool {
    match peer.ip() {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().map(|v4| v4.is_loopback()).unwrap_or(false),
    }
}
