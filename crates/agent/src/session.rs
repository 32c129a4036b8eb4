//! The host side of an agent session.
//!
//! One session owns the stdio of one guest `pid1d` process. Requests are
//! synchronous and serialised by the session lock, so responses pair with
//! requests in FIFO order. The session is fail-closed: a malformed line or a
//! closed transport marks it dead and every subsequent operation errors until
//! the engine establishes a fresh one.

use crate::protocol::{Request, Response};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use common::{Error, Result};
use log::{debug, error, trace};
use std::{
    fmt::Debug,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout},
    sync::Mutex,
    time,
};

/// The deadline for the initial `ping` after session startup.
pub const PING_DEADLINE: Duration = Duration::from_secs(5);

#[async_trait]
/// A bidirectional line transport to the guest agent.
pub trait Transport: Debug + Send + Sync {
    /// Write one LF-terminated line.
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Read one line, without its terminator.
    async fn recv_line(&mut self) -> Result<String>;
}

#[derive(Debug)]
/// Transport over the stdio of a spawned guest process.
pub struct ChildStdioTransport {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl ChildStdioTransport {
    /// Take the stdio pipes of `child`. The caller keeps the `Child` itself
    /// for lifecycle control.
    pub fn from_child(child: &mut Child) -> Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::invalid("agent process has no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::invalid("agent process has no stdout pipe"))?;
        Ok(Self {
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }
}

#[async_trait]
impl Transport for ChildStdioTransport {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::from_io("write to agent", e))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| Error::from_io("flush to agent", e))
    }

    async fn recv_line(&mut self) -> Result<String> {
        self.stdout
            .next_line()
            .await
            .map_err(|e| Error::from_io("read from agent", e))?
            .ok_or_else(|| Error::io("agent closed the session"))
    }
}

#[derive(Debug)]
/// One live session against a guest agent.
pub struct AgentSession {
    transport: Mutex<Box<dyn Transport>>,
    dead: AtomicBool,
}

impl AgentSession {
    /// Establish a session over `transport`. The guest must answer a `ping`
    /// within [`PING_DEADLINE`] or startup fails with `timeout`.
    pub async fn start(transport: Box<dyn Transport>) -> Result<Self> {
        let session = Self {
            transport: Mutex::new(transport),
            dead: AtomicBool::new(false),
        };

        match time::timeout(PING_DEADLINE, session.call(&Request::Ping)).await {
            Ok(Ok(_)) => {
                debug!("Agent session established");
                Ok(session)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                session.dead.store(true, Ordering::SeqCst);
                Err(Error::timeout("agent did not answer the startup ping"))
            }
        }
    }

    /// Whether this session has been marked dead.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Issue one request and read its response. Callers are serialised; a
    /// transport or parse failure kills the session.
    pub async fn call(&self, request: &Request) -> Result<Response> {
        if self.is_dead() {
            return Err(Error::io("agent session is dead"));
        }

        let mut transport = self.transport.lock().await;
        if self.is_dead() {
            return Err(Error::io("agent session is dead"));
        }

        let line = request.to_line()?;
        trace!("agent request: {}", line.trim_end());
        if let Err(e) = transport.send_line(&line).await {
            self.dead.store(true, Ordering::SeqCst);
            return Err(e);
        }

        let answer = match transport.recv_line().await {
            Ok(answer) => answer,
            Err(e) => {
                self.dead.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };
        trace!("agent response: {}", answer);

        let response = match Response::from_line(&answer) {
            Ok(response) => response,
            Err(e) => {
                self.dead.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        if !response.ok {
            let message = response
                .error
                .clone()
                .unwrap_or_else(|| "agent returned an unspecified failure".to_string());
            error!("agent operation failed: {}", message);
            return Err(Error::io(message));
        }
        Ok(response)
    }

    /// Liveness probe.
    pub async fn ping(&self) -> Result<()> {
        self.call(&Request::Ping).await.map(|_| ())
    }

    /// Start a guest process and return its opaque id.
    pub async fn spawn(
        &self,
        command: &str,
        args: &[String],
        env: &[String],
        wait: bool,
    ) -> Result<u64> {
        let response = self
            .call(&Request::Spawn {
                command: command.to_string(),
                args: args.to_vec(),
                env: env.to_vec(),
                wait,
            })
            .await?;
        response
            .id
            .ok_or_else(|| Error::protocol("spawn response is missing the id"))
    }

    /// Block until the guest process exits and return its exit code.
    pub async fn wait(&self, id: u64) -> Result<i32> {
        let response = self.call(&Request::Wait { id }).await?;
        response
            .exit_code
            .ok_or_else(|| Error::protocol("wait response is missing the exit code"))
    }

    /// Terminate a guest process.
    pub async fn kill(&self, id: u64, reap: bool) -> Result<()> {
        self.call(&Request::Kill { id, reap }).await.map(|_| ())
    }

    /// Read a chunk of a guest file. Returns the bytes and whether the end
    /// of the file was reached.
    pub async fn file_read(
        &self,
        path: &str,
        offset: u64,
        max_bytes: u64,
    ) -> Result<(Vec<u8>, bool)> {
        let response = self
            .call(&Request::FileReadB64 {
                path: path.to_string(),
                offset,
                max_bytes,
            })
            .await?;
        let data = response
            .data
            .ok_or_else(|| Error::protocol("read response is missing the data"))?;
        let bytes = BASE64
            .decode(data)
            .map_err(|e| Error::protocol(format!("read response data is not base64: {}", e)))?;
        Ok((bytes, response.eof.unwrap_or(false)))
    }

    /// Write bytes to a guest file.
    pub async fn file_write(
        &self,
        path: &str,
        bytes: &[u8],
        append: bool,
        mkdirs: bool,
    ) -> Result<()> {
        self.call(&Request::FileWriteB64 {
            path: path.to_string(),
            data: BASE64.encode(bytes),
            append,
            mkdirs,
        })
        .await
        .map(|_| ())
    }
}
