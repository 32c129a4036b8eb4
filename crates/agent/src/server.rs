//! The guest side of the agent protocol.
//!
//! One server instance owns the stdio protocol stream of the guest process
//! and a table of spawned jobs. The loop is single threaded by contract:
//! requests are handled strictly in arrival order and a blocking `wait` is
//! the only waiter a job can have.

use crate::protocol::{Request, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use common::{Error, Result};
use log::{debug, warn};
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{BufRead, Read, Seek, SeekFrom, Write},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
};

struct Job {
    child: Child,
    status: Option<i32>,
}

#[derive(Default)]
/// Executes agent requests against the local system.
pub struct AgentServer {
    jobs: HashMap<u64, Job>,
    next_id: u64,
}

impl AgentServer {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            next_id: 0,
        }
    }

    /// Serve requests until the reader reaches end of file. A malformed
    /// request is answered with a failure and then kills the session.
    pub fn serve<R: BufRead, W: Write>(&mut self, reader: R, mut writer: W) -> Result<()> {
        for line in reader.lines() {
            let line = line.map_err(|e| Error::from_io("read request line", e))?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            self.reap_exited();

            let request: Request = match serde_json::from_str(line) {
                Ok(request) => request,
                Err(e) => {
                    let failure = Response::failure(format!("malformed request: {}", e));
                    Self::respond(&mut writer, &failure)?;
                    return Err(Error::protocol(format!("malformed request line: {}", e)));
                }
            };

            let response = self.handle(request);
            Self::respond(&mut writer, &response)?;
        }
        debug!("agent stream closed, leaving serve loop");
        Ok(())
    }

    fn respond<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
        writer
            .write_all(response.to_line()?.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| Error::from_io("write response line", e))
    }

    fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::Ping => Response::success(),
            Request::Spawn {
                command,
                args,
                env,
                wait,
            } => self.spawn(&command, &args, &env, wait),
            Request::Wait { id } => self.wait(id),
            Request::Kill { id, reap } => self.kill(id, reap),
            Request::FileReadB64 {
                path,
                offset,
                max_bytes,
            } => Self::file_read(&path, offset, max_bytes),
            Request::FileWriteB64 {
                path,
                data,
                append,
                mkdirs,
            } => Self::file_write(&path, &data, append, mkdirs),
        }
    }

    /// Record exit statuses of tracked children and collect orphan zombies
    /// reparented to this process. Runs between requests only; the loop is
    /// the sole reaper, so a blocking `wait` cannot lose a status.
    fn reap_exited(&mut self) {
        for job in self.jobs.values_mut() {
            if job.status.is_none() {
                if let Ok(Some(status)) = job.child.try_wait() {
                    job.status = Some(exit_code_of(status));
                }
            }
        }

        // Only an init process owns every child in its pid namespace; a wide
        // waitpid from anything else would steal children it does not track.
        #[cfg(unix)]
        if std::process::id() != 1 {
            return;
        }

        #[cfg(unix)]
        loop {
            use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
            use nix::unistd::Pid;

            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.record_stolen(pid.as_raw() as u32, code);
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.record_stolen(pid.as_raw() as u32, 128 + signal as i32);
                }
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    #[cfg(unix)]
    fn record_stolen(&mut self, pid: u32, code: i32) {
        for job in self.jobs.values_mut() {
            if job.child.id() == pid && job.status.is_none() {
                job.status = Some(code);
                return;
            }
        }
        debug!("reaped orphan process {} (exit {})", pid, code);
    }

    fn spawn(&mut self, command: &str, args: &[String], env: &[String], wait: bool) -> Response {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for entry in env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        // Children must not share the protocol stream.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("spawn {} failed: {}", command, e);
                return Response::failure(format!("spawn {}: {}", command, e));
            }
        };

        self.next_id += 1;
        let id = self.next_id;

        if wait {
            return match child.wait() {
                Ok(status) => Response {
                    ok: true,
                    id: Some(id),
                    exit_code: Some(exit_code_of(status)),
                    ..Response::default()
                },
                Err(e) => Response::failure(format!("wait for {}: {}", command, e)),
            };
        }

        self.jobs.insert(id, Job { child, status: None });
        Response {
            ok: true,
            id: Some(id),
            ..Response::default()
        }
    }

    fn wait(&mut self, id: u64) -> Response {
        let mut job = match self.jobs.remove(&id) {
            Some(job) => job,
            None => return Response::failure(format!("no such job {}", id)),
        };

        let code = match job.status {
            Some(code) => code,
            None => match job.child.wait() {
                Ok(status) => exit_code_of(status),
                Err(e) => return Response::failure(format!("wait for job {}: {}", id, e)),
            },
        };

        Response {
            ok: true,
            exit_code: Some(code),
            ..Response::default()
        }
    }

    fn kill(&mut self, id: u64, reap: bool) -> Response {
        let job = match self.jobs.get_mut(&id) {
            Some(job) => job,
            None => return Response::failure(format!("no such job {}", id)),
        };

        if job.status.is_none() {
            if let Err(e) = job.child.kill() {
                // Already exited children are fine to "kill".
                debug!("kill job {}: {}", id, e);
            }
        }

        if reap {
            if let Some(mut job) = self.jobs.remove(&id) {
                if job.status.is_none() {
                    let _ = job.child.wait();
                }
            }
        }
        Response::success()
    }

    fn file_read(path: &str, offset: u64, max_bytes: u64) -> Response {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => return Response::failure(format!("open {}: {}", path, e)),
        };
        if let Err(e) = file.seek(SeekFrom::Start(offset)) {
            return Response::failure(format!("seek {}: {}", path, e));
        }

        let mut buffer = Vec::new();
        if let Err(e) = file.take(max_bytes).read_to_end(&mut buffer) {
            return Response::failure(format!("read {}: {}", path, e));
        }

        Response {
            ok: true,
            bytes: Some(buffer.len() as u64),
            eof: Some((buffer.len() as u64) < max_bytes),
            data: Some(BASE64.encode(&buffer)),
            ..Response::default()
        }
    }

    fn file_write(path: &str, data: &str, append: bool, mkdirs: bool) -> Response {
        let bytes = match BASE64.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => return Response::failure(format!("data is not base64: {}", e)),
        };

        if mkdirs {
            if let Some(parent) = Path::new(path).parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return Response::failure(format!("mkdirs for {}: {}", path, e));
                }
            }
        }

        let mut options = OpenOptions::new();
        options.write(true).create(true);
        if append {
            options.append(true);
        } else {
            options.truncate(true);
        }

        let result = options
            .open(path)
            .and_then(|mut file| file.write_all(&bytes).map(|_| file))
            .and_then(|mut file| file.flush());
        match result {
            Ok(()) => Response {
                ok: true,
                bytes: Some(bytes.len() as u64),
                ..Response::default()
            },
            Err(e) => Response::failure(format!("write {}: {}", path, e)),
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn run(requests: &[String]) -> Result<Vec<Response>> {
        let input = requests.join("");
        let mut output = Vec::new();
        let mut server = AgentServer::new();
        server.serve(Cursor::new(input), &mut output)?;

        String::from_utf8(output)?
            .lines()
            .map(|line| Ok(Response::from_line(line)?))
            .collect()
    }

    #[test]
    fn ping() -> Result<()> {
        let responses = run(&[Request::Ping.to_line()?])?;
        assert_eq!(responses, vec![Response::success()]);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn spawn_then_wait() -> Result<()> {
        let responses = run(&[
            Request::Spawn {
                command: "true".into(),
                args: vec![],
                env: vec![],
                wait: false,
            }
            .to_line()?,
            Request::Wait { id: 1 }.to_line()?,
        ])?;

        assert!(responses[0].ok);
        assert_eq!(responses[0].id, Some(1));
        assert!(responses[1].ok);
        assert_eq!(responses[1].exit_code, Some(0));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn spawn_with_wait_inline() -> Result<()> {
        let responses = run(&[Request::Spawn {
            command: "sh".into(),
            args: vec!["-c".into(), "exit 3".into()],
            env: vec![],
            wait: true,
        }
        .to_line()?])?;

        assert!(responses[0].ok);
        assert_eq!(responses[0].exit_code, Some(3));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn kill_with_reap_forgets_the_job() -> Result<()> {
        let responses = run(&[
            Request::Spawn {
                command: "sleep".into(),
                args: vec!["30".into()],
                env: vec![],
                wait: false,
            }
            .to_line()?,
            Request::Kill { id: 1, reap: true }.to_line()?,
            Request::Wait { id: 1 }.to_line()?,
        ])?;

        assert!(responses[0].ok);
        assert!(responses[1].ok);
        assert!(!responses[2].ok, "reaped job must be unknown");
        Ok(())
    }

    #[test]
    fn wait_for_unknown_job_fails() -> Result<()> {
        let responses = run(&[Request::Wait { id: 99 }.to_line()?])?;
        assert!(!responses[0].ok);
        assert!(responses[0].error.as_ref().unwrap().contains("99"));
        Ok(())
    }

    #[test]
    fn file_write_then_read() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("deep/nested/out.bin");
        let path_str = path.display().to_string();

        let responses = run(&[
            Request::FileWriteB64 {
                path: path_str.clone(),
                data: BASE64.encode(b"payload"),
                append: false,
                mkdirs: true,
            }
            .to_line()?,
            Request::FileWriteB64 {
                path: path_str.clone(),
                data: BASE64.encode(b" more"),
                append: true,
                mkdirs: false,
            }
            .to_line()?,
            Request::FileReadB64 {
                path: path_str.clone(),
                offset: 0,
                max_bytes: 1024,
            }
            .to_line()?,
            Request::FileReadB64 {
                path: path_str,
                offset: 8,
                max_bytes: 2,
            }
            .to_line()?,
        ])?;

        assert!(responses.iter().all(|r| r.ok));
        assert_eq!(responses[0].bytes, Some(7));
        assert_eq!(
            BASE64.decode(responses[2].data.as_ref().unwrap())?,
            b"payload more"
        );
        assert_eq!(responses[2].eof, Some(true));
        assert_eq!(responses[3].eof, Some(false));
        Ok(())
    }

    #[test]
    fn malformed_request_kills_session() -> Result<()> {
        let mut output = Vec::new();
        let mut server = AgentServer::new();
        let err = server
            .serve(Cursor::new("this is not json\n"), &mut output)
            .unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Protocol);

        let response = Response::from_line(std::str::from_utf8(&output)?.trim_end())?;
        assert!(!response.ok);
        Ok(())
    }
}
