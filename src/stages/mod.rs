//! The live-image build stages, in the only order they may run.
//!
//! | # | stage       | reaches              |
//! |---|-------------|----------------------|
//! | 1 | `bootstrap` | `bootstrapped`       |
//! | 2 | `mount`     | `mounted` (always)   |
//! | 3 | `install`   | `packages-installed` |
//! | 4 | `customize` | `customized`         |
//! | 5 | `assemble`  | `assembled`          |

pub mod assemble;
pub mod bootstrap;
pub mod customize;
pub mod install;
pub mod mount;

use anyhow::Result;

use crate::build::stage::StagePlan;

/// The standard five-stage plan.
pub fn standard_plan() -> Result<StagePlan> {
    StagePlan::new(vec![
        bootstrap::stage(),
        mount::stage(),
        install::stage(),
        customize::stage(),
        assemble::stage(),
    ])
}

/// One line per stage, for `forge-builder stages`.
pub fn describe_plan(plan: &StagePlan) -> Vec<String> {
    plan.iter()
        .map(|(ordinal, stage)| {
            let always = if stage.is_always_run() {
                "  (runs on resume)"
            } else {
                ""
            };
            format!("{:>2}  {:<10} -> {}{}", ordinal, stage.name(), stage.reaches(), always)
        })
        .collect()
}
