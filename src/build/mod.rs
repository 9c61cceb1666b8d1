//! Build core: the context threaded through stages, the stage model, and the
//! runner that executes stages in order.
//!
//! - [`context`] - [`BuildContext`](context::BuildContext), the per-run mutable state
//! - [`stage`] - [`Stage`](stage::Stage), [`StagePlan`](stage::StagePlan) and the linear [`BuildState`](stage::BuildState) machine
//! - [`runner`] - [`StageRunner`](runner::StageRunner) with guaranteed resource release
//! - [`filesystem`] - small filesystem helpers shared by stages

pub mod context;
pub mod filesystem;
pub mod runner;
pub mod stage;
