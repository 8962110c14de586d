use crate::{backend::RunReport, script::ScriptStatus, Outcome};

/// The single outcome for a set of candidates, by fixed precedence. Order of
/// arrival does not matter; no candidates means nothing went wrong.
pub fn aggregate<I>(candidates: I) -> Outcome
where
    I: IntoIterator<Item = Outcome>,
{
    candidates
        .into_iter()
        .max_by_key(|f| f.precedence())
        .unwrap_or(Outcome::Accepted)
}

/// Outcome and user-facing message for a finished backend run.
pub(crate) fn judge_run(report: &RunReport) -> (Outcome, Option<String>) {
    let mut candidates = Vec::new();
    let mut message = None;

    if let Some(breach) = report.limit_hit {
        candidates.push(Outcome::from(breach));
        message = Some(breach_message(breach.into()).to_string());
    }

    match &report.script {
        None if report.limit_hit.is_none() => {
            candidates.push(Outcome::RuntimeError);
            message = Some(report.stderr.clone());
        }
        None | Some(ScriptStatus::Breached { .. }) | Some(ScriptStatus::Cancelled) => {}
        Some(ScriptStatus::CompileError { message: reason }) => {
            candidates.push(Outcome::CompileOrSyntaxError);
            message = Some(reason.clone());
        }
        Some(ScriptStatus::Raised { fault }) => {
            candidates.push(Outcome::RuntimeError);
            message = Some(format!("{}: {}", fault.kind, fault.message));
        }
        Some(ScriptStatus::Completed { cases }) if cases.is_empty() => {
            let failed_exit = report.exit_status.map_or(false, |f| f != 0);
            if failed_exit || !report.stderr.is_empty() {
                candidates.push(Outcome::RuntimeError);
            }
        }
        Some(ScriptStatus::Completed { cases }) => {
            let failed = cases.iter().filter(|f| !f.passed).count();
            if failed > 0 {
                candidates.push(Outcome::WrongAnswer);
                message = Some(format!("{} of {} test cases failed", failed, cases.len()));
            }
        }
    }

    (aggregate(candidates), message)
}

fn breach_message(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Timeout => "time limit exceeded",
        Outcome::MemoryExceeded => "memory limit exceeded",
        _ => "limit exceeded",
    }
}
