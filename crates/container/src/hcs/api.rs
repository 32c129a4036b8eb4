//! Dynamically-bound Host Compute Service entry points.
//!
//! The HCS surface is resolved once from whichever provider library the
//! host carries and consumed as a capability-set value; nothing outside
//! this module calls the symbols by name.

use agent::Transport;
use async_trait::async_trait;
use common::{Error, Result};
use lazy_static::lazy_static;
use libloading::{Library, Symbol};
use log::debug;
use std::{ffi::OsStr, io::Write, os::windows::ffi::OsStrExt, sync::Mutex};
use winapi::um::winnt::HANDLE;

use super::schema::ComputeSystem;

/// Provider libraries, probed in order.
const PROVIDER_LIBRARIES: [&str; 2] = ["computecore.dll", "vmcompute.dll"];

type HcsCreateComputeSystemFn =
    unsafe extern "system" fn(*const u16, *const u16, HANDLE, *mut HANDLE) -> i32;
type HcsStartComputeSystemFn = unsafe extern "system" fn(HANDLE, *const u16) -> i32;
type HcsTerminateComputeSystemFn = unsafe extern "system" fn(HANDLE, *const u16) -> i32;
type HcsCloseComputeSystemFn = unsafe extern "system" fn(HANDLE) -> i32;
type HcsCreateProcessFn =
    unsafe extern "system" fn(HANDLE, *const u16, *mut HANDLE, *mut HANDLE, *mut HANDLE) -> i32;
type HnsCallFn =
    unsafe extern "system" fn(*const u16, *const u16, *const u16, *mut *mut u16) -> i32;

/// The capability set populated once at startup.
struct HcsApi {
    create: HcsCreateComputeSystemFn,
    start: HcsStartComputeSystemFn,
    terminate: HcsTerminateComputeSystemFn,
    close: HcsCloseComputeSystemFn,
    create_process: HcsCreateProcessFn,
    hns_call: HnsCallFn,
    // Keeps the provider library resident for the process lifetime.
    _library: Library,
}

unsafe impl Send for HcsApi {}

lazy_static! {
    static ref API: Mutex<Option<HcsApi>> = Mutex::new(None);
}

fn with_api<T>(f: impl FnOnce(&HcsApi) -> Result<T>) -> Result<T> {
    let mut guard = API
        .lock()
        .map_err(|_| Error::io("HCS capability set is poisoned"))?;
    if guard.is_none() {
        *guard = Some(load_api()?);
    }
    match guard.as_ref() {
        Some(api) => f(api),
        None => Err(Error::io("HCS capability set unavailable")),
    }
}

fn load_api() -> Result<HcsApi> {
    let mut last = Error::not_found("no HCS provider library");
    for name in PROVIDER_LIBRARIES {
        match unsafe { Library::new(name) } {
            Ok(library) => {
                debug!("Loaded HCS provider {}", name);
                return unsafe { bind(library) };
            }
            Err(e) => last = Error::not_found(format!("load {}: {}", name, e)),
        }
    }
    Err(last)
}

unsafe fn bind(library: Library) -> Result<HcsApi> {
    fn missing(name: &str, e: libloading::Error) -> Error {
        Error::not_found(format!("resolve {}: {}", name, e))
    }

    let create: Symbol<HcsCreateComputeSystemFn> = library
        .get(b"HcsCreateComputeSystem")
        .map_err(|e| missing("HcsCreateComputeSystem", e))?;
    let start: Symbol<HcsStartComputeSystemFn> = library
        .get(b"HcsStartComputeSystem")
        .map_err(|e| missing("HcsStartComputeSystem", e))?;
    let terminate: Symbol<HcsTerminateComputeSystemFn> = library
        .get(b"HcsTerminateComputeSystem")
        .map_err(|e| missing("HcsTerminateComputeSystem", e))?;
    let close: Symbol<HcsCloseComputeSystemFn> = library
        .get(b"HcsCloseComputeSystem")
        .map_err(|e| missing("HcsCloseComputeSystem", e))?;
    let create_process: Symbol<HcsCreateProcessFn> = library
        .get(b"HcsCreateProcess")
        .map_err(|e| missing("HcsCreateProcess", e))?;
    let hns_call: Symbol<HnsCallFn> = library
        .get(b"HNSCall")
        .map_err(|e| missing("HNSCall", e))?;

    Ok(HcsApi {
        create: *create,
        start: *start,
        terminate: *terminate,
        close: *close,
        create_process: *create_process,
        hns_call: *hns_call,
        _library: library,
    })
}

#[derive(Debug)]
/// An open compute-system handle.
pub(crate) struct ComputeSystemHandle(HANDLE);

unsafe impl Send for ComputeSystemHandle {}

fn wide(text: &str) -> Vec<u16> {
    OsStr::new(text).encode_wide().chain(Some(0)).collect()
}

fn check(context: &str, hresult: i32) -> Result<()> {
    if hresult < 0 {
        return Err(Error::io(format!("{}: HRESULT {:#010x}", context, hresult)));
    }
    Ok(())
}

/// Create and start a compute system from its JSON document.
pub(crate) async fn create_and_start(
    id: &str,
    document: &ComputeSystem,
) -> Result<ComputeSystemHandle> {
    let id = id.to_string();
    let text = serde_json::to_string(document)
        .map_err(|e| Error::invalid(format!("serialize compute system: {}", e)))?;

    tokio::task::spawn_blocking(move || {
        with_api(|api| {
            let wide_id = wide(&id);
            let wide_document = wide(&text);
            let mut handle: HANDLE = std::ptr::null_mut();
            check("HcsCreateComputeSystem", unsafe {
                (api.create)(
                    wide_id.as_ptr(),
                    wide_document.as_ptr(),
                    std::ptr::null_mut(),
                    &mut handle,
                )
            })?;
            let system = ComputeSystemHandle(handle);
            check("HcsStartComputeSystem", unsafe {
                (api.start)(system.0, std::ptr::null())
            })?;
            Ok(system)
        })
    })
    .await
    .map_err(|e| Error::io(format!("HCS thread: {}", e)))?
}

/// Terminate and close a compute system.
pub(crate) async fn terminate_and_close(system: ComputeSystemHandle) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        with_api(|api| {
            check("HcsTerminateComputeSystem", unsafe {
                (api.terminate)(system.0, std::ptr::null())
            })?;
            check("HcsCloseComputeSystem", unsafe { (api.close)(system.0) })
        })
    })
    .await
    .map_err(|e| Error::io(format!("HCS thread: {}", e)))?
}

/// Start a guest process with piped stdio and wrap the pipe pair as an
/// agent transport.
pub(crate) async fn start_guest_process(
    system: &ComputeSystemHandle,
    command: &str,
) -> Result<Box<dyn Transport>> {
    let raw = system.0 as usize;
    let document = serde_json::json!({
        "CommandLine": command,
        "CreateStdInPipe": true,
        "CreateStdOutPipe": true,
        "CreateStdErrPipe": false,
    })
    .to_string();

    let (stdin, stdout) = tokio::task::spawn_blocking(move || {
        with_api(|api| {
            let wide_document = wide(&document);
            let mut process: HANDLE = std::ptr::null_mut();
            let mut stdin: HANDLE = std::ptr::null_mut();
            let mut stdout: HANDLE = std::ptr::null_mut();
            check("HcsCreateProcess", unsafe {
                (api.create_process)(
                    raw as HANDLE,
                    wide_document.as_ptr(),
                    &mut process,
                    &mut stdin,
                    &mut stdout,
                )
            })?;
            Ok((stdin as usize, stdout as usize))
        })
    })
    .await
    .map_err(|e| Error::io(format!("HCS thread: {}", e)))??;

    Ok(Box::new(PipeTransport::from_raw(stdin, stdout)))
}

/// Attach a fresh HNS endpoint to the compute system and return its id.
pub(crate) async fn attach_endpoint(system_id: &str) -> Result<String> {
    let request = serde_json::json!({
        "Name": format!("containerv-{}", system_id),
        "VirtualNetwork": "containerv",
    })
    .to_string();
    let system_id = system_id.to_string();

    tokio::task::spawn_blocking(move || {
        with_api(|api| {
            let method = wide("POST");
            let path = wide(&format!("/endpoints/{}", system_id));
            let body = wide(&request);
            let mut response: *mut u16 = std::ptr::null_mut();
            check("HNSCall", unsafe {
                (api.hns_call)(method.as_ptr(), path.as_ptr(), body.as_ptr(), &mut response)
            })?;
            Ok(format!("containerv-{}", system_id))
        })
    })
    .await
    .map_err(|e| Error::io(format!("HNS thread: {}", e)))?
}

/// Detach a previously attached endpoint.
pub(crate) async fn detach_endpoint(system_id: &str, endpoint_id: &str) -> Result<()> {
    let path = format!("/endpoints/{}", endpoint_id);
    let _ = system_id;

    tokio::task::spawn_blocking(move || {
        with_api(|api| {
            let method = wide("DELETE");
            let wide_path = wide(&path);
            let body = wide("");
            let mut response: *mut u16 = std::ptr::null_mut();
            check("HNSCall", unsafe {
                (api.hns_call)(
                    method.as_ptr(),
                    wide_path.as_ptr(),
                    body.as_ptr(),
                    &mut response,
                )
            })
        })
    })
    .await
    .map_err(|e| Error::io(format!("HNS thread: {}", e)))?
}

/// Agent transport over a raw pipe pair handed out by HcsCreateProcess.
#[derive(Debug)]
struct PipeTransport {
    stdin: std::fs::File,
    stdout: std::io::BufReader<std::fs::File>,
}

impl PipeTransport {
    fn from_raw(stdin: usize, stdout: usize) -> Self {
        use std::os::windows::io::FromRawHandle;
        unsafe {
            Self {
                stdin: std::fs::File::from_raw_handle(stdin as *mut _),
                stdout: std::io::BufReader::new(std::fs::File::from_raw_handle(stdout as *mut _)),
            }
        }
    }
}

#[async_trait]
impl Transport for PipeTransport {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .and_then(|_| self.stdin.flush())
            .map_err(|e| Error::from_io("write to guest process", e))
    }

    async fn recv_line(&mut self) -> Result<String> {
        use std::io::BufRead;
        let mut line = String::new();
        let n = self
            .stdout
            .read_line(&mut line)
            .map_err(|e| Error::from_io("read from guest process", e))?;
        if n == 0 {
            return Err(Error::io("guest process closed the session"));
        }
        Ok(line)
    }
}
