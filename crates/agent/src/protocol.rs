//! Wire format of the agent protocol: one JSON object per line, LF
//! terminated, CR silently ignored. Requests are tagged by `op`; every
//! response carries `ok`.

use common::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
/// A request issued by the host.
pub enum Request {
    /// Session liveness probe.
    Ping,
    /// Start a process in the guest; the response names it with an `id`.
    Spawn {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<String>,
        #[serde(default)]
        wait: bool,
    },
    /// Block until the named process exits.
    Wait { id: u64 },
    /// Terminate the named process; `reap` drops all tracking for it.
    Kill {
        id: u64,
        #[serde(default)]
        reap: bool,
    },
    /// Read up to `max_bytes` from a guest file starting at `offset`.
    FileReadB64 {
        path: String,
        #[serde(default)]
        offset: u64,
        max_bytes: u64,
    },
    /// Write base64 `data` to a guest file.
    FileWriteB64 {
        path: String,
        data: String,
        #[serde(default)]
        append: bool,
        #[serde(default)]
        mkdirs: bool,
    },
}

impl Request {
    /// Serialize to one LF-terminated wire line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| Error::protocol(format!("serialize request: {}", e)))?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
/// A response sent by the guest. Fields beyond `ok` are op-dependent.
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eof: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Response {
    /// A bare success.
    pub fn success() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    /// A failure carrying a message.
    pub fn failure<S: Into<String>>(message: S) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Parse one wire line, ignoring a trailing CR.
    pub fn from_line(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(&['\n', '\r'][..]);
        serde_json::from_str(line)
            .map_err(|e| Error::protocol(format!("malformed response line: {}", e)))
    }

    /// Serialize to one LF-terminated wire line.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)
            .map_err(|e| Error::protocol(format!("serialize response: {}", e)))?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn request_wire_shape() -> Result<()> {
        assert_eq!(Request::Ping.to_line()?, "{\"op\":\"ping\"}\n");

        let line = Request::Spawn {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), "true".into()],
            env: vec![],
            wait: false,
        }
        .to_line()?;
        assert!(line.starts_with("{\"op\":\"spawn\""));
        assert!(line.ends_with('\n'));
        Ok(())
    }

    #[test]
    fn request_defaults() -> Result<()> {
        let request: Request =
            serde_json::from_str("{\"op\":\"spawn\",\"command\":\"/bin/true\"}")?;
        assert_eq!(
            request,
            Request::Spawn {
                command: "/bin/true".into(),
                args: vec![],
                env: vec![],
                wait: false,
            }
        );
        Ok(())
    }

    #[test]
    fn response_roundtrip() -> Result<()> {
        let response = Response {
            ok: true,
            id: Some(7),
            ..Response::default()
        };
        let parsed = Response::from_line(&response.to_line()?)?;
        assert_eq!(parsed, response);
        Ok(())
    }

    #[test]
    fn response_tolerates_cr() -> Result<()> {
        let parsed = Response::from_line("{\"ok\":true}\r\n")?;
        assert!(parsed.ok);
        Ok(())
    }

    #[test]
    fn malformed_response_is_protocol_error() {
        let err = Response::from_line("{not json").unwrap_err();
        assert_eq!(err.kind(), common::ErrorKind::Protocol);
    }
}
