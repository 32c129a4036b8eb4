//! Windows side of the supervisor service.
//!
//! A single Job Object configured with kill-on-close owns every tracked
//! process; closing its handle during teardown terminates anything that is
//! still alive.

use crate::{SpawnOptions, State};
use common::{Error, Result};
use std::{
    mem,
    ptr,
    sync::{Arc, Mutex},
};
use tokio::process::{Child, Command};
use winapi::{
    shared::minwindef::{DWORD, FALSE, LPVOID},
    um::{
        handleapi::CloseHandle,
        jobapi2::{AssignProcessToJobObject, CreateJobObjectW, SetInformationJobObject, TerminateJobObject},
        processthreadsapi::{OpenProcess, TerminateProcess},
        winnt::{
            JobObjectExtendedLimitInformation, HANDLE, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
            JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, PROCESS_TERMINATE,
        },
    },
};

pub(crate) struct PlatformService {
    job: HANDLE,
}

// The job handle is only touched under the supervisor mutex.
unsafe impl Send for PlatformService {}

impl PlatformService {
    /// Create the kill-on-close Job Object.
    pub(crate) fn init(_state: Arc<Mutex<State>>) -> Result<Self> {
        unsafe {
            let job = CreateJobObjectW(ptr::null_mut(), ptr::null());
            if job.is_null() {
                return Err(Error::io("create job object"));
            }

            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = mem::zeroed();
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
            let ok = SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                &mut info as *mut _ as LPVOID,
                mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as DWORD,
            );
            if ok == FALSE {
                CloseHandle(job);
                return Err(Error::io("configure job object"));
            }
            Ok(Self { job })
        }
    }

    /// Closing the handle terminates every process still in the job.
    pub(crate) fn teardown(self) {
        unsafe {
            TerminateJobObject(self.job, 1);
            CloseHandle(self.job);
        }
    }

    fn assign(&self, child: &Child) -> Result<()> {
        let handle = child
            .raw_handle()
            .ok_or_else(|| Error::io("child has no process handle"))?;
        if unsafe { AssignProcessToJobObject(self.job, handle as HANDLE) } == FALSE {
            return Err(Error::io("assign process to job object"));
        }
        Ok(())
    }
}

/// No Unix-only preparation on Windows.
pub(crate) fn prepare_command(_command: &mut Command, _options: &SpawnOptions) {}

/// Put the freshly spawned child into the supervisor's Job Object.
pub(crate) fn register_with_service(state: &Arc<Mutex<State>>, child: &Child) -> Result<()> {
    let state = state
        .lock()
        .map_err(|_| Error::io("supervisor state is poisoned"))?;
    match state.service.as_ref() {
        Some(service) => service.assign(child),
        None => Err(Error::invalid("supervisor service is not initialised")),
    }
}

/// Terminate one process by pid.
pub(crate) fn kill_tree(pid: u32) {
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, FALSE, pid as DWORD);
        if !handle.is_null() {
            TerminateProcess(handle, 1);
            CloseHandle(handle);
        }
    }
}

/// Windows has no signal forwarding; a forwarded termination request simply
/// terminates the process.
pub(crate) fn forward_signal(pid: u32, _signum: i32) {
    kill_tree(pid);
}
