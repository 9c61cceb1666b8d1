//! Stage descriptors and the linear build state machine.
//!
//! ```text
//! Uninitialized -> Bootstrapped -> Mounted -> PackagesInstalled -> Customized -> Assembled
//! ```
//!
//! Every arrow is one [`Stage`]. A [`StagePlan`] fixes the order at
//! construction time; stages cannot be reordered or repeated afterwards.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{bail, Result};

use crate::build::context::BuildContext;

/// Furthest point a run has reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BuildState {
    #[default]
    Uninitialized,
    Bootstrapped,
    Mounted,
    PackagesInstalled,
    Customized,
    Assembled,
}

impl BuildState {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Uninitialized => "uninitialized",
            BuildState::Bootstrapped => "bootstrapped",
            BuildState::Mounted => "mounted",
            BuildState::PackagesInstalled => "packages-installed",
            BuildState::Customized => "customized",
            BuildState::Assembled => "assembled",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type StageAction = Box<dyn Fn(&mut BuildContext) -> Result<()>>;

/// A named build step.
pub struct Stage {
    name: String,
    reaches: BuildState,
    always_run: bool,
    action: StageAction,
}

impl Stage {
    pub fn new<F>(name: impl Into<String>, reaches: BuildState, action: F) -> Self
    where
        F: Fn(&mut BuildContext) -> Result<()> + 'static,
    {
        Self {
            name: name.into(),
            reaches,
            always_run: false,
            action: Box::new(action),
        }
    }

    /// Never skipped on resume, because what it acquires does not outlive a run.
    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reaches(&self) -> BuildState {
        self.reaches
    }

    pub fn is_always_run(&self) -> bool {
        self.always_run
    }

    pub(crate) fn execute(&self, ctx: &mut BuildContext) -> Result<()> {
        (self.action)(ctx)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("reaches", &self.reaches)
            .field("always_run", &self.always_run)
            .finish_non_exhaustive()
    }
}

/// Ordered, immutable list of stages for one run.
#[derive(Debug)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    /// Build a plan. Names must be unique and states must only move forward.
    pub fn new(stages: Vec<Stage>) -> Result<Self> {
        if stages.is_empty() {
            bail!("stage plan must contain at least one stage");
        }

        let mut seen = BTreeSet::new();
        let mut previous = BuildState::Uninitialized;
        for stage in &stages {
            if !seen.insert(stage.name.as_str()) {
                bail!("duplicate stage name '{}' in plan", stage.name);
            }
            if stage.reaches <= previous {
                bail!(
                    "stage '{}' reaches '{}' after '{}' was already reached",
                    stage.name,
                    stage.reaches,
                    previous
                );
            }
            previous = stage.reaches;
        }

        Ok(Self { stages })
    }

    /// Stages with their 1-based ordinals.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Stage)> {
        self.stages.iter().enumerate().map(|(i, stage)| (i + 1, stage))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Outcome of running a plan.
#[derive(Debug)]
pub enum StageResult {
    Success,
    Failure { stage: String, reason: anyhow::Error },
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StageResult::Success)
    }

    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            StageResult::Success => None,
            StageResult::Failure { stage, .. } => Some(stage),
        }
    }

    pub fn reason(&self) -> Option<&anyhow::Error> {
        match self {
            StageResult::Success => None,
            StageResult::Failure { reason, .. } => Some(reason),
        }
    }
}
