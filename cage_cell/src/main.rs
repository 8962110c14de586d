use std::{
    io::{self, Read, Write},
    process,
    time::Duration,
};

use cage_core::{
    backend::process::{CELL_EXIT_BAD_REQUEST, CELL_EXIT_ENVIRONMENT},
    cancel::CancelToken,
    error::{Error, Result},
    probe::{virtual_memory, Rlimit},
    script::{Prepared, ScriptLimits, ScriptRequest},
};
use clap::Parser;
use landlock::{
    Access, AccessFs, BitFlags, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreatedAttr,
    RulesetStatus, ABI,
};

/// Address space granted on top of the ceiling, measured from the cell as it
/// stands once the job is compiled: interpreter stack and bookkeeping.
const RUNTIME_HEADROOM: u64 = 16 * 1024 * 1024;
const OPEN_FILES: u64 = 8;
/// The only file the cell may open once locked: its own memory counters.
const STATM: &str = "/proc/self/statm";

#[derive(Parser, Debug)]
#[command(
    name = "cage_cell",
    version = "0.1.0",
    author = "Kanari <iovo7c@gmail.com>",
    about = "Limit loader: runs one script job read from stdin"
)]
struct Opts {
    /// wall clock limit(ms)
    #[arg(short = 't', long)]
    time_limit: u64,
    /// cpu time budget(ms)
    #[arg(short = 'c', long)]
    cpu_limit: u64,
    /// memory ceiling(bytes)
    #[arg(short = 'm', long)]
    memory_limit: u64,
    /// captured output limit per stream(bytes)
    #[arg(short = 'o', long, default_value_t = 64 * 1024)]
    output_limit: usize,
    /// move into fresh user and network namespaces
    #[arg(long)]
    isolate_network: bool,
    /// fail instead of running without network isolation
    #[arg(long)]
    require_network_isolation: bool,
    /// fail instead of running with filesystem access
    #[arg(long)]
    require_filesystem_isolation: bool,
}

fn main() {
    let opts = Opts::parse();

    let request = match read_request() {
        Ok(request) => request,
        Err(err) => {
            eprintln!("cell: bad request: {}", err);
            process::exit(CELL_EXIT_BAD_REQUEST);
        }
    };

    let limits = ScriptLimits {
        timeout: Duration::from_millis(opts.time_limit),
        cpu_budget: Duration::from_millis(opts.cpu_limit),
        memory_bytes: opts.memory_limit,
        output_limit: opts.output_limit,
    };
    let cancel = CancelToken::new();
    let prepared = Prepared::new(&request, &limits, &cancel);

    if let Err(err) = lock_down(&opts) {
        eprintln!("cell: {}", err);
        process::exit(CELL_EXIT_ENVIRONMENT);
    }
    let report = prepared.run();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let written = serde_json::to_writer(&mut out, &report)
        .map_err(Error::from)
        .and_then(|_| out.flush().map_err(Error::from));
    if let Err(err) = written {
        eprintln!("cell: failed to write report: {}", err);
        process::exit(1);
    }
}

fn read_request() -> Result<ScriptRequest> {
    let mut content = String::new();
    io::stdin().read_to_string(&mut content)?;
    Ok(serde_json::from_str(&content)?)
}

/// Drop what the script could use against the host. Order matters: the
/// namespace needs a free hand, the rlimits come last.
fn lock_down(opts: &Opts) -> Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(os_error("prctl(PR_SET_NO_NEW_PRIVS)"));
    }

    if opts.isolate_network || opts.require_network_isolation {
        let rc = unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) };
        if rc != 0 {
            let err = os_error("unshare(CLONE_NEWUSER | CLONE_NEWNET)");
            if opts.require_network_isolation {
                return Err(err);
            }
            eprintln!("cell: running without network namespace: {}", err);
        }
    }

    if !deny_filesystem()? {
        if opts.require_filesystem_isolation {
            return Err(Error::Environment("landlock is not available".into()));
        }
        eprintln!("cell: running without filesystem restrictions");
    }

    let in_use = virtual_memory();
    if in_use == 0 {
        return Err(Error::Environment(format!("cannot read {}", STATM)));
    }
    let cpu_seconds = (opts.cpu_limit + 999) / 1000;
    Rlimit::CoreSize.apply(0, 0)?;
    Rlimit::FileSize.apply(0, 0)?;
    Rlimit::OpenFiles.apply(OPEN_FILES, OPEN_FILES)?;
    Rlimit::Processes.apply(0, 0)?;
    Rlimit::CpuSeconds.apply(cpu_seconds + 1, cpu_seconds + 2)?;
    let address_space = in_use
        .saturating_add(opts.memory_limit)
        .saturating_add(RUNTIME_HEADROOM);
    Rlimit::AddressSpace.apply(address_space, address_space)?;
    Ok(())
}

/// Landlock ruleset handling every filesystem access, with a single read
/// rule for the memory counters. Applies to the calling thread and whatever
/// it starts later. `false` when the kernel enforces none of it.
fn deny_filesystem() -> Result<bool> {
    let statm = PathFd::new(STATM)
        .map_err(|e| Error::Environment(format!("open {}: {}", STATM, e)))?;
    let read: BitFlags<AccessFs> = AccessFs::ReadFile.into();
    let status = Ruleset::default()
        .handle_access(AccessFs::from_all(ABI::V3))
        .and_then(|ruleset| ruleset.create())
        .and_then(|ruleset| ruleset.add_rule(PathBeneath::new(statm, read)))
        .and_then(|ruleset| ruleset.restrict_self())
        .map_err(|e| Error::Environment(format!("landlock: {}", e)))?;
    Ok(!matches!(status.ruleset, RulesetStatus::NotEnforced))
}

fn os_error(call: &str) -> Error {
    Error::Environment(format!("{}: {}", call, io::Error::last_os_error()))
}
