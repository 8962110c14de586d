use std::{fs, path::Path, time::Duration};

use crate::error::{Error, Result};

pub struct ProcessProbe {
    pid: u32,
}

impl ProcessProbe {
    pub fn new(pid: u32) -> Result<Self> {
        let proc_path = format!("/proc/{}", pid);
        let path = Path::new(&proc_path);
        if !path.exists() {
            let err = std::io::Error::new(std::io::ErrorKind::NotFound, "process does not exists");
            return Err(err.into());
        }
        Ok(Self { pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn wait(&self, options: libc::c_int) -> Result<Option<ProcessBio>> {
        let mut status: libc::c_int = 0;
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::wait4(self.pid as libc::pid_t, &mut status, options, &mut ru) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if rc == 0 {
            return Ok(None);
        }
        Ok(Some(ProcessBio {
            status,
            utime: (ru.ru_utime.tv_sec * 1000 + ru.ru_utime.tv_usec / 1000) as u64,
            stime: (ru.ru_stime.tv_sec * 1000 + ru.ru_stime.tv_usec / 1000) as u64,
            maxrss: ru.ru_maxrss as u64 * 1024,
        }))
    }

    /// Reap the process if it already stopped, without blocking.
    pub fn try_watching(&self) -> Result<Option<ProcessBio>> {
        self.wait(libc::WNOHANG)
    }

    /// Wait the process to stop and get whole usage status
    pub fn watching(&self) -> Result<ProcessBio> {
        self.wait(0)?
            .ok_or_else(|| Error::Sandbox("wait4 returned without a status".into()))
    }
}

#[derive(Debug, Clone)]
pub struct ProcessBio {
    status: i32,
    utime: u64,
    stime: u64,
    maxrss: u64,
}

impl ProcessBio {
    /// Get time usage(ms), user and system.
    pub fn get_time_usage(&self) -> u64 {
        self.utime + self.stime
    }

    pub fn get_exit_code(&self) -> Option<i32> {
        if libc::WIFEXITED(self.status) {
            Some(libc::WEXITSTATUS(self.status))
        } else {
            None
        }
    }

    pub fn get_signal(&self) -> Option<i32> {
        if libc::WIFSIGNALED(self.status) {
            Some(libc::WTERMSIG(self.status))
        } else {
            None
        }
    }

    /// Exit code, or `128 + signal` like a shell reports it.
    pub fn get_status(&self) -> i32 {
        match (self.get_exit_code(), self.get_signal()) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        }
    }

    /// Peak resident set size (bytes).
    pub fn get_peak_memory(&self) -> u64 {
        self.maxrss
    }
}

/// Send `sig` to every process in the group led by `pgid`.
pub fn signal_group(pgid: u32, sig: libc::c_int) {
    // ESRCH only means everyone is gone already.
    unsafe {
        libc::kill(-(pgid as libc::pid_t), sig);
    }
}

/// CPU time consumed by the calling thread.
pub fn thread_cpu_time() -> Duration {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Current resident set size of this process (bytes).
pub fn resident_memory() -> u64 {
    statm_bytes(1)
}

/// Current size of this process's address space (bytes).
pub fn virtual_memory() -> u64 {
    statm_bytes(0)
}

fn statm_bytes(field: usize) -> u64 {
    let content = match fs::read_to_string("/proc/self/statm") {
        Ok(content) => content,
        Err(_) => return 0,
    };
    let pages: u64 = content
        .split_whitespace()
        .nth(field)
        .and_then(|f| f.parse().ok())
        .unwrap_or(0);
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    pages * page_size.max(0) as u64
}

/// Hand free heap pages back to the kernel.
pub fn release_free_memory() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    unsafe {
        libc::malloc_trim(0);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Rlimit {
    AddressSpace,
    CpuSeconds,
    FileSize,
    OpenFiles,
    Processes,
    CoreSize,
}

impl Rlimit {
    pub fn apply(self, soft: u64, hard: u64) -> Result<()> {
        let ctx = libc::rlimit {
            rlim_cur: soft as libc::rlim_t,
            rlim_max: hard as libc::rlim_t,
        };
        let rc = unsafe {
            match self {
                Rlimit::AddressSpace => libc::setrlimit(libc::RLIMIT_AS, &ctx),
                Rlimit::CpuSeconds => libc::setrlimit(libc::RLIMIT_CPU, &ctx),
                Rlimit::FileSize => libc::setrlimit(libc::RLIMIT_FSIZE, &ctx),
                Rlimit::OpenFiles => libc::setrlimit(libc::RLIMIT_NOFILE, &ctx),
                Rlimit::Processes => libc::setrlimit(libc::RLIMIT_NPROC, &ctx),
                Rlimit::CoreSize => libc::setrlimit(libc::RLIMIT_CORE, &ctx),
            }
        };
        if rc != 0 {
            return Err(Error::Environment(format!(
                "setrlimit {:?}: {}",
                self,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}
