//! Workflow orchestration
//!
//! The engine runs the agent in a loop, using a small JSON state file as
//! the only channel between the two:
//!
//! - **State**: the record the agent rewrites after every step
//! - **Sync**: detecting that the agent published a new state
//! - **Run**: one end-to-end orchestration and its status
//! - **Engine**: the loop itself
//!
//! ## State file
//!
//! ```json
//! {
//!   "current_step_description": "Wrote failing tests for the parser",
//!   "next_step_prompt": "/continue",
//!   "status": "running"
//! }
//! ```
//!
//! ## Running
//!
//! ```bash
//! # Plan first, then work in a fresh worktree
//! cadence run "add retry to the HTTP client"
//!
//! # Start directly, in place
//! cadence run "fix the flaky test" --no-plan --no-worktree
//!
//! # Pick up an interrupted run
//! cadence run --continue
//! ```

pub mod engine;
pub mod run;
pub mod state;
pub mod sync;

pub use engine::{Engine, EngineOptions, AGENT_ID};
pub use run::{Run, RunStatus};
pub use state::{
    StateStore, Status, WorkflowState, CONTINUE_PROMPT, PLAN_PROMPT, SEED_DESCRIPTION, START_PROMPT,
};
pub use sync::{wait_for_state_update, MIN_POLL_INTERVAL, POLL_INTERVAL};
