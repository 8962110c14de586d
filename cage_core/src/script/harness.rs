use std::collections::HashSet;

use log::warn;
use rhai::{
    serde::{from_dynamic, to_dynamic},
    CallFnOptions, Dynamic, Scope, AST,
};
use serde_json::Value;

use super::{
    sandbox::{Failure, Sandbox},
    CaseOutcome, ScriptRequest, Trip,
};
use crate::{
    compare::{render_text, ComparisionMode, ComparisionResult, LineCompare, StrictCompare},
    CaseFault, TestCase, TestReport,
};

/// Run every case against the compiled script. Cases are independent: each
/// gets a fresh copy of the top-level constants and a failing case does not
/// stop the next one. Only a limit trip aborts the loop.
pub(crate) fn run_cases(
    sandbox: &Sandbox,
    ast: &AST,
    globals: &Scope<'static>,
    request: &ScriptRequest,
) -> Result<Vec<CaseOutcome>, Trip> {
    let program = CaseProgram::new(sandbox, ast, globals);
    let mut outcomes = Vec::with_capacity(request.test_cases.len());
    for case in request.test_cases.iter() {
        sandbox.checkpoint()?;
        let verdict = match target(case, request) {
            Some(name) => call_case(sandbox, &program, ast, name, case)?,
            None => stdio_case(sandbox, ast, case)?,
        };
        outcomes.push(verdict.into_outcome(sandbox.output_limit()));
    }
    Ok(outcomes)
}

/// Pair what the interpreter sent back with the cases it was given.
pub(crate) fn reports(
    request: &ScriptRequest,
    outcomes: Vec<CaseOutcome>,
    limit: usize,
) -> Vec<TestReport> {
    request
        .test_cases
        .iter()
        .zip(outcomes)
        .enumerate()
        .map(|(index, (case, outcome))| {
            let error = match outcome.error {
                Some(fault) => Some(fault),
                None if !outcome.passed => Some(CaseFault {
                    kind: "Mismatch".into(),
                    message: format!(
                        "expected {}, got {}",
                        clip(case.expected_output.clone(), limit),
                        outcome.actual_output.as_ref().unwrap_or(&Value::Null)
                    ),
                }),
                None => None,
            };
            TestReport {
                name: case.display_name(index),
                passed: outcome.passed,
                input: case.input.clone(),
                expected_output: case.expected_output.clone(),
                actual_output: outcome.actual_output,
                error,
            }
        })
        .collect()
}

fn target<'a>(case: &'a TestCase, request: &'a ScriptRequest) -> Option<&'a str> {
    case.function_name
        .as_deref()
        .or(request.entry_point.as_deref())
}

/// True when every case feeds the script through `STDIN`.
pub(crate) fn replays_script(request: &ScriptRequest) -> bool {
    !request.test_cases.is_empty()
        && request
            .test_cases
            .iter()
            .all(|case| target(case, request).is_none())
}

/// The script's functions behind a prelude that re-declares the constants
/// left by the top-level run, so `global::NAME` resolves inside a called
/// function without running the top level again.
struct CaseProgram {
    ast: AST,
    constants: Scope<'static>,
}

impl CaseProgram {
    fn new(sandbox: &Sandbox, ast: &AST, globals: &Scope<'static>) -> Self {
        let mut constants = Scope::new();
        let mut seen = HashSet::new();
        let mut prelude = String::new();
        for (name, constant, value) in globals.iter() {
            if !constant {
                continue;
            }
            if seen.insert(name.to_string()) {
                prelude.push_str(&format!("const {0} = {0};\n", name));
            }
            constants.push_constant_dynamic(name.to_string(), value);
        }

        let functions = ast.clone_functions_only();
        let ast = match sandbox.engine.compile(&prelude) {
            Ok(prelude) => prelude.merge(&functions),
            Err(err) => {
                warn!("cannot replay top-level constants: {}", err);
                functions
            }
        };
        Self { ast, constants }
    }
}

enum CaseVerdict {
    Answered { actual: Value, passed: bool },
    Faulted(CaseFault),
}

impl CaseVerdict {
    fn compared(mode: &dyn ComparisionMode, expected: &Value, actual: Value) -> Self {
        let passed = mode.compare(expected, &actual) == ComparisionResult::Same;
        CaseVerdict::Answered { actual, passed }
    }

    fn into_outcome(self, limit: usize) -> CaseOutcome {
        match self {
            CaseVerdict::Answered { actual, passed } => CaseOutcome {
                passed,
                actual_output: Some(clip(actual, limit)),
                error: None,
            },
            CaseVerdict::Faulted(mut fault) => {
                clip_text(&mut fault.message, limit);
                CaseOutcome {
                    passed: false,
                    actual_output: None,
                    error: Some(fault),
                }
            }
        }
    }
}

fn call_case(
    sandbox: &Sandbox,
    program: &CaseProgram,
    ast: &AST,
    name: &str,
    case: &TestCase,
) -> Result<CaseVerdict, Trip> {
    let args = match arguments(ast, name, &case.input) {
        Ok(args) => args,
        Err(fault) => return Ok(CaseVerdict::Faulted(fault)),
    };

    // The prelude only declares constants.
    let mut scope = program.constants.clone();
    let options = CallFnOptions::new().eval_ast(true).rewind_scope(true);
    let returned = sandbox.engine.call_fn_with_options::<Dynamic>(
        options,
        &mut scope,
        &program.ast,
        name,
        args,
    );

    match returned {
        Ok(value) => match to_json(&value) {
            Ok(actual) => Ok(CaseVerdict::compared(
                &StrictCompare,
                &case.expected_output,
                actual,
            )),
            Err(fault) => Ok(CaseVerdict::Faulted(fault)),
        },
        Err(err) => match sandbox.interpret(&err) {
            Failure::Trip(trip) => Err(trip),
            Failure::Fault(fault) => Ok(CaseVerdict::Faulted(fault)),
        },
    }
}

/// A case without a function: re-run the whole script with the input as
/// `STDIN` and compare what it printed.
fn stdio_case(sandbox: &Sandbox, ast: &AST, case: &TestCase) -> Result<CaseVerdict, Trip> {
    let stdin = render_text(&case.input);
    let mut scope = sandbox.scope(Some(&stdin));

    sandbox.begin_capture();
    let ran = sandbox.engine.run_ast_with_scope(&mut scope, ast);
    let printed = sandbox.end_capture();

    match ran {
        Ok(()) => Ok(CaseVerdict::compared(
            &LineCompare,
            &case.expected_output,
            Value::String(printed),
        )),
        Err(err) => match sandbox.interpret(&err) {
            Failure::Trip(trip) => Err(trip),
            Failure::Fault(fault) => Ok(CaseVerdict::Faulted(fault)),
        },
    }
}

/// Map a case input onto call arguments: an object by parameter name, an
/// array by position, anything else as the only argument.
fn arguments(ast: &AST, name: &str, input: &Value) -> Result<Vec<Dynamic>, CaseFault> {
    match input {
        Value::Object(fields) => {
            let function = ast
                .iter_functions()
                .find(|f| f.name == name && f.params.len() == fields.len())
                .ok_or_else(|| CaseFault {
                    kind: "FunctionNotFound".into(),
                    message: format!("no function `{}` taking {} arguments", name, fields.len()),
                })?;
            function
                .params
                .iter()
                .map(|param| match fields.get(*param) {
                    Some(value) => from_json(value),
                    None => Err(CaseFault {
                        kind: "ArgumentError".into(),
                        message: format!("missing argument `{}` for `{}`", param, name),
                    }),
                })
                .collect()
        }
        Value::Array(items) => items.iter().map(from_json).collect(),
        other => Ok(vec![from_json(other)?]),
    }
}

fn from_json(value: &Value) -> Result<Dynamic, CaseFault> {
    to_dynamic(value).map_err(|err| CaseFault {
        kind: "ArgumentError".into(),
        message: err.to_string(),
    })
}

fn to_json(value: &Dynamic) -> Result<Value, CaseFault> {
    from_dynamic::<Value>(value).map_err(|err| CaseFault {
        kind: "TypeMismatch".into(),
        message: format!("result of type {} cannot be reported: {}", value.type_name(), err),
    })
}

fn clip(value: Value, limit: usize) -> Value {
    let size = value.to_string().len();
    if size > limit {
        Value::String(format!("<{} bytes omitted>", size))
    } else {
        value
    }
}

fn clip_text(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}
