//! Recording fake executor for unit and scenario tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::rc::Rc;

use crate::error::ExecError;
use crate::executor::{Executor, Operation, Output};
use crate::interrupt::CancelToken;

type Effect = Box<dyn Fn(&Operation) -> std::io::Result<()>>;

#[derive(Default)]
struct Inner {
    ops: Vec<Operation>,
    counts: BTreeMap<String, usize>,
    fail_contains: Vec<(String, String)>,
    fail_nth: Vec<(String, usize, String)>,
    responses: BTreeMap<String, String>,
    effects: Vec<(String, Effect)>,
    missing: BTreeSet<String>,
    cancel: Option<CancelToken>,
}

/// Executor that records every operation instead of running it.
///
/// Clones share state, so a test keeps one handle while the pipeline owns
/// another.
#[derive(Clone, Default)]
pub(crate) struct FakeExecutor {
    inner: Rc<RefCell<Inner>>,
}

impl FakeExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fail every operation whose command line contains `pattern`.
    pub(crate) fn fail_matching(&self, pattern: &str, output: &str) {
        self.inner
            .borrow_mut()
            .fail_contains
            .push((pattern.to_string(), output.to_string()));
    }

    /// Fail the `n`th (1-based) invocation of `program`.
    pub(crate) fn fail_nth(&self, program: &str, n: usize, output: &str) {
        self.inner
            .borrow_mut()
            .fail_nth
            .push((program.to_string(), n, output.to_string()));
    }

    /// Canned stdout for every invocation of `program`.
    pub(crate) fn respond(&self, program: &str, stdout: &str) {
        self.inner
            .borrow_mut()
            .responses
            .insert(program.to_string(), stdout.to_string());
    }

    /// Side effect performed when `program` runs successfully.
    pub(crate) fn on<F>(&self, program: &str, effect: F)
    where
        F: Fn(&Operation) -> std::io::Result<()> + 'static,
    {
        self.inner
            .borrow_mut()
            .effects
            .push((program.to_string(), Box::new(effect)));
    }

    /// Make `locate` (and `run`) report `program` as not installed.
    pub(crate) fn missing_tool(&self, program: &str) {
        self.inner.borrow_mut().missing.insert(program.to_string());
    }

    /// Interrupt cancellable operations once `token` is cancelled, the way
    /// the host executor does.
    pub(crate) fn honour_cancel(&self, token: CancelToken) {
        self.inner.borrow_mut().cancel = Some(token);
    }

    pub(crate) fn operations(&self) -> Vec<Operation> {
        self.inner.borrow().ops.clone()
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.inner
            .borrow()
            .ops
            .iter()
            .map(Operation::describe)
            .collect()
    }

    pub(crate) fn commands_for(&self, program: &str) -> Vec<String> {
        self.inner
            .borrow()
            .ops
            .iter()
            .filter(|op| op.program == program)
            .map(Operation::describe)
            .collect()
    }
}

impl Executor for FakeExecutor {
    fn run(&self, op: &Operation) -> Result<Output, ExecError> {
        let mut inner = self.inner.borrow_mut();
        inner.ops.push(op.clone());

        if inner.missing.contains(&op.program) {
            return Err(ExecError::NotFound {
                program: op.program.clone(),
            });
        }

        if op.cancellable && inner.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(ExecError::Interrupted {
                program: op.program.clone(),
            });
        }

        let count = {
            let count = inner.counts.entry(op.program.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let line = op.describe();
        let scripted_failure = inner
            .fail_contains
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .or_else(|| {
                inner
                    .fail_nth
                    .iter()
                    .find(|(program, n, _)| *program == op.program && *n == count)
                    .map(|(_, _, output)| output.clone())
            });
        if let Some(output) = scripted_failure {
            return Err(ExecError::NonZeroExit {
                program: op.program.clone(),
                code: Some(1),
                output,
            });
        }

        for (program, effect) in &inner.effects {
            if *program == op.program {
                effect(op).map_err(|source| ExecError::Spawn {
                    program: op.program.clone(),
                    source,
                })?;
            }
        }

        Ok(Output {
            code: Some(0),
            stdout: inner.responses.get(&op.program).cloned().unwrap_or_default(),
            stderr: String::new(),
        })
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        if self.inner.borrow().missing.contains(program) {
            None
        } else {
            Some(PathBuf::from("/usr/bin").join(program))
        }
    }
}
