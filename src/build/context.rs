//! Build context - the mutable state of one run.
//!
//! A `BuildContext` is created by the orchestrator, handed to each stage in
//! turn, and dropped at the end of the run. It owns the executor and the
//! resource tracker so that a stage cannot acquire something without the
//! runner being able to release it.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::artifact::BuildArtifact;
use crate::build::stage::BuildState;
use crate::config::BuildConfig;
use crate::error::ExecError;
use crate::executor::{Executor, Operation, Output};
use crate::interrupt::CancelToken;
use crate::resources::{ReleaseReport, ResourceHandle, ResourceTracker, TrackedResource};

pub struct BuildContext {
    pub config: BuildConfig,
    pub cancel: CancelToken,
    pub tracker: ResourceTracker,
    executor: Box<dyn Executor>,
    completed: Vec<String>,
    current_stage: String,
    state: BuildState,
    artifact: Option<BuildArtifact>,
}

impl BuildContext {
    pub fn new(config: BuildConfig, executor: Box<dyn Executor>, cancel: CancelToken) -> Self {
        Self {
            config,
            cancel,
            tracker: ResourceTracker::new(),
            executor,
            completed: Vec::new(),
            current_stage: String::new(),
            state: BuildState::Uninitialized,
            artifact: None,
        }
    }

    pub fn target_root(&self) -> &Path {
        &self.config.build.target_root
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.build.output_dir
    }

    /// Version/label string stamped into the image.
    pub fn label(&self) -> &str {
        &self.config.build.label
    }

    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    /// Run an operation through the executor.
    pub fn exec(&self, op: &Operation) -> Result<Output, ExecError> {
        debug!(stage = %self.current_stage, command = %op.describe(), "dispatch");
        self.executor.run(op)
    }

    /// Run a command inside the target root.
    pub fn exec_in_root<I, S>(&self, program: &str, args: I) -> Result<Output, ExecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let op = Operation::in_chroot(self.target_root(), program).args(args);
        self.exec(&op)
    }

    /// Register a resource on behalf of the stage currently running.
    pub fn track_mount(&mut self, path: PathBuf) -> ResourceHandle {
        let resource = TrackedResource::mount(path, &self.current_stage);
        self.tracker.acquire(resource)
    }

    pub fn track_directory(&mut self, path: PathBuf) -> ResourceHandle {
        let resource = TrackedResource::directory(path, &self.current_stage);
        self.tracker.acquire(resource)
    }

    /// Release every tracked resource. Safe to call more than once.
    pub fn release_resources(&mut self) -> ReleaseReport {
        self.tracker.release_all(self.executor.as_ref())
    }

    /// Names of stages that completed successfully, in order.
    pub fn completed(&self) -> &[String] {
        &self.completed
    }

    pub fn current_stage(&self) -> &str {
        &self.current_stage
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn artifact(&self) -> Option<&BuildArtifact> {
        self.artifact.as_ref()
    }

    /// Publish the final artifact. Only the assembler calls this.
    pub(crate) fn set_artifact(&mut self, artifact: BuildArtifact) {
        self.artifact = Some(artifact);
    }

    pub(crate) fn enter_stage(&mut self, name: &str) {
        self.current_stage = name.to_string();
    }

    pub(crate) fn complete_stage(&mut self, name: &str, reached: BuildState) {
        self.completed.push(name.to_string());
        self.state = reached;
        self.current_stage.clear();
    }

    /// Record a stage skipped on resume: its state is assumed reached.
    pub(crate) fn assume_reached(&mut self, reached: BuildState) {
        self.state = reached;
    }
}
