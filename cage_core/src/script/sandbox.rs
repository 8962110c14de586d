use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::{Duration, Instant},
};

use log::warn;
use rhai::{
    module_resolvers::DummyModuleResolver,
    packages::{Package, StandardPackage},
    Dynamic, Engine, EvalAltResult, Position, Scope,
};

use super::{ScriptLimits, ScriptReport, ScriptStatus, Trip, STDIN_CONSTANT};
use crate::{
    cancel::CancelToken,
    probe::{release_free_memory, resident_memory, thread_cpu_time},
    CaseFault, LimitBreach,
};

const MAX_CALL_LEVELS: usize = 64;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_FN_EXPR_DEPTH: usize = 32;
/// Operations between two looks at the clocks.
const CLOCK_INTERVAL: u64 = 128;
/// Operations between two RSS samples. Multiple of `CLOCK_INTERVAL`.
const MEMORY_INTERVAL: u64 = 8192;

/// Bounded text sink; anything past the limit is dropped and remembered.
pub(crate) struct BoundedText {
    buf: String,
    limit: usize,
    truncated: bool,
}

impl BoundedText {
    fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.buf.len() + line.len() + 1 <= self.limit {
            self.buf.push_str(line);
            self.buf.push('\n');
            return;
        }
        let room = self.limit.saturating_sub(self.buf.len());
        let mut cut = room.min(line.len());
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buf.push_str(&line[..cut]);
        self.truncated = true;
    }
}

/// Caller-local output of one run. Stdio test cases temporarily redirect
/// `print` into their own buffer.
pub(crate) struct Streams {
    stdout: BoundedText,
    stderr: BoundedText,
    redirect: Option<BoundedText>,
}

impl Streams {
    fn print(&mut self, text: &str) {
        match self.redirect.as_mut() {
            Some(case) => case.push_line(text),
            None => self.stdout.push_line(text),
        }
    }

    fn debug(&mut self, text: &str, pos: Position) {
        match pos.line() {
            Some(line) => self.stderr.push_line(&format!("[line {}] {}", line, text)),
            None => self.stderr.push_line(text),
        }
    }
}

/// Checked from the engine's progress hook between operations.
pub(crate) struct Watchdog {
    deadline: Instant,
    cpu_start: Duration,
    cpu_budget: Duration,
    rss_baseline: Cell<u64>,
    memory_bytes: u64,
    peak_growth: Cell<u64>,
    tripped: Cell<Option<Trip>>,
    cancel: CancelToken,
}

impl Watchdog {
    fn new(limits: &ScriptLimits, cancel: CancelToken) -> Self {
        Self {
            deadline: Instant::now() + limits.timeout,
            cpu_start: thread_cpu_time(),
            cpu_budget: limits.cpu_budget,
            rss_baseline: Cell::new(resident_memory()),
            memory_bytes: limits.memory_bytes,
            peak_growth: Cell::new(0),
            tripped: Cell::new(None),
            cancel,
        }
    }

    fn poll(&self, ops: u64) -> Option<Trip> {
        if let Some(trip) = self.tripped.get() {
            return Some(trip);
        }
        if ops % CLOCK_INTERVAL != 0 {
            return None;
        }
        let trip = self.inspect(ops);
        if let Some(trip) = trip {
            warn!("watchdog tripped after {} operations: {:?}", ops, trip);
            self.tripped.set(Some(trip));
        }
        trip
    }

    fn inspect(&self, ops: u64) -> Option<Trip> {
        if self.cancel.is_cancelled() {
            return Some(Trip::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Some(Trip::Breach(LimitBreach::Timeout));
        }
        if self.cpu_time() >= self.cpu_budget {
            return Some(Trip::Breach(LimitBreach::Timeout));
        }
        if ops % MEMORY_INTERVAL == 0 {
            let growth = resident_memory().saturating_sub(self.rss_baseline.get());
            self.peak_growth.set(self.peak_growth.get().max(growth));
            if growth > self.memory_bytes {
                return Some(Trip::Breach(LimitBreach::MemoryExceeded));
            }
        }
        None
    }

    fn cpu_time(&self) -> Duration {
        thread_cpu_time().saturating_sub(self.cpu_start)
    }
}

pub(crate) enum Failure {
    Trip(Trip),
    Fault(CaseFault),
}

/// A freshly built interpreter plus the state its hooks write into.
pub(crate) struct Sandbox {
    pub engine: Engine,
    streams: Rc<RefCell<Streams>>,
    watchdog: Rc<Watchdog>,
    output_limit: usize,
}

impl Sandbox {
    pub fn new(limits: &ScriptLimits, cancel: CancelToken) -> Self {
        let streams = Rc::new(RefCell::new(Streams {
            stdout: BoundedText::new(limits.output_limit),
            stderr: BoundedText::new(limits.output_limit),
            redirect: None,
        }));
        let watchdog = Rc::new(Watchdog::new(limits, cancel));

        let mut engine = Engine::new_raw();
        engine.register_global_module(StandardPackage::new().as_shared_module());
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");

        engine.set_max_call_levels(MAX_CALL_LEVELS);
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH);
        // Zero would mean unlimited to the engine.
        let ceiling = usize::try_from(limits.memory_bytes).unwrap_or(usize::MAX);
        engine.set_max_string_size(ceiling.max(1));
        engine.set_max_array_size((ceiling / 16).max(1));
        engine.set_max_map_size((ceiling / 64).max(1));

        let out = streams.clone();
        engine.on_print(move |text| out.borrow_mut().print(text));
        let err = streams.clone();
        engine.on_debug(move |text, _source, pos| err.borrow_mut().debug(text, pos));
        let dog = watchdog.clone();
        engine.on_progress(move |ops| dog.poll(ops).map(|_| Dynamic::UNIT));

        Self {
            engine,
            streams,
            watchdog,
            output_limit: limits.output_limit,
        }
    }

    /// Start charging memory to the script from here on. Pages the allocator
    /// kept from earlier runs are handed back first, so reusing them shows up
    /// as growth again.
    pub fn arm(&self) {
        release_free_memory();
        let baseline = resident_memory();
        self.watchdog.rss_baseline.set(baseline);
        self.watchdog.peak_growth.set(0);
    }

    /// A new scope holding only the read-only input.
    pub fn scope(&self, stdin: Option<&str>) -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push_constant(STDIN_CONSTANT, stdin.unwrap_or_default().to_string());
        scope
    }

    /// Look at the clocks outside the engine, between two test cases.
    pub fn checkpoint(&self) -> Result<(), Trip> {
        match self.watchdog.poll(0) {
            Some(trip) => Err(trip),
            None => Ok(()),
        }
    }

    pub fn output_limit(&self) -> usize {
        self.output_limit
    }

    pub fn begin_capture(&self) {
        self.streams.borrow_mut().redirect = Some(BoundedText::new(self.output_limit));
    }

    pub fn end_capture(&self) -> String {
        self.streams
            .borrow_mut()
            .redirect
            .take()
            .map(|f| f.buf)
            .unwrap_or_default()
    }

    /// Split an engine error into a limit trip or a user-visible fault.
    pub fn interpret(&self, err: &EvalAltResult) -> Failure {
        match root_cause(err) {
            EvalAltResult::ErrorTerminated(..) => Failure::Trip(
                self.watchdog
                    .tripped
                    .get()
                    .unwrap_or(Trip::Breach(LimitBreach::Timeout)),
            ),
            EvalAltResult::ErrorTooManyOperations(..) => {
                Failure::Trip(Trip::Breach(LimitBreach::Timeout))
            }
            EvalAltResult::ErrorDataTooLarge(..) => {
                Failure::Trip(Trip::Breach(LimitBreach::MemoryExceeded))
            }
            root => Failure::Fault(CaseFault {
                kind: fault_kind(root).to_string(),
                message: err.to_string(),
            }),
        }
    }

    pub fn finish(self, status: ScriptStatus) -> ScriptReport {
        let cpu_time_ms = self.watchdog.cpu_time().as_millis() as u64;
        let growth = resident_memory().saturating_sub(self.watchdog.rss_baseline.get());
        let memory_growth_bytes = self.watchdog.peak_growth.get().max(growth);

        let mut streams = self.streams.borrow_mut();
        let output_truncated = streams.stdout.truncated || streams.stderr.truncated;
        ScriptReport {
            status,
            stdout: std::mem::take(&mut streams.stdout.buf),
            stderr: std::mem::take(&mut streams.stderr.buf),
            output_truncated,
            cpu_time_ms,
            memory_growth_bytes,
        }
    }
}

fn root_cause(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => root_cause(inner),
        EvalAltResult::ErrorInModule(_, inner, _) => root_cause(inner),
        other => other,
    }
}

fn fault_kind(err: &EvalAltResult) -> &'static str {
    match err {
        EvalAltResult::ErrorRuntime(..) => "Exception",
        EvalAltResult::ErrorArithmetic(..) => "ArithmeticError",
        EvalAltResult::ErrorVariableNotFound(..) => "VariableNotFound",
        EvalAltResult::ErrorFunctionNotFound(..) => "FunctionNotFound",
        EvalAltResult::ErrorModuleNotFound(..) => "ModuleNotFound",
        EvalAltResult::ErrorArrayBounds(..) | EvalAltResult::ErrorStringBounds(..) => {
            "IndexOutOfBounds"
        }
        EvalAltResult::ErrorMismatchDataType(..) | EvalAltResult::ErrorMismatchOutputType(..) => {
            "TypeMismatch"
        }
        EvalAltResult::ErrorIndexingType(..) => "IndexingError",
        EvalAltResult::ErrorStackOverflow(..) => "StackOverflow",
        EvalAltResult::ErrorAssignmentToConstant(..) => "AssignmentToConstant",
        _ => "RuntimeError",
    }
}
