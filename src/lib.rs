//! # Keisan: Incremental Notebook Evaluation
//!
//! Keisan keeps the results of a calculator notebook up to date while its
//! text changes. A document is a set of sections, each a list of input
//! lines; every edit produces a new document snapshot, and Keisan turns the
//! difference into the smallest amount of evaluation work it can get away
//! with.
//!
//! ## Evaluation Pipeline
//!
//! ```text
//! DocumentState → diff → pending queue → budgeted fiber bursts → events
//! ```
//!
//! ### 1. Change Detection
//! The [`document`] module diffs successive snapshots and issues load and
//! unload commands for only the sections whose text differs. A unit table
//! change invalidates every cached section first.
//!
//! ### 2. Scheduling
//! The [`scheduler`] module owns a single worker task holding the pending
//! queue, the per-section result cache and at most one in-flight
//! evaluation. Sections are evaluated in load order; reloading a section
//! mid-evaluation discards the attempt and starts over with the new text.
//!
//! ### 3. Cooperative Evaluation
//! The [`fiber`] module runs the [`evaluator`] step function in budgeted
//! synchronous bursts, yielding to the async runtime whenever one
//! invocation uses up the frame budget. Each invocation reuses any number
//! of unchanged lines from the previous results but parses at most one
//! line, so a one-line edit costs roughly one parse.
//!
//! ### 4. Fixed-Point Recalculation
//! Assignments (`price = 30`) bind constants that later lines may read.
//! When a pass changes the set of bound constants, the [`evaluator`]
//! restarts the section from scratch against the corrected bindings and
//! repeats until a pass is stable, then folds the section's values into a
//! running total.
//!
//! ### 5. Calculation
//! The [`calc`] module defines the calculator seam ([`calc::Calculator`])
//! and ships a small unit-aware arithmetic implementation used by the
//! tests and benchmarks.
//!
//! ## Observing Results
//!
//! Completed evaluations are broadcast as
//! [`SchedulerEvent::SectionEvaluated`] on the [`event_bus`]; exactly one
//! event fires per completed evaluation, never for a cancelled one.
//! Non-fatal conditions such as a section hitting its recalculation pass
//! limit arrive on the separate error channel.

pub mod calc;
pub mod config;
pub mod document;
pub mod error;
pub mod evaluator;
pub mod event_bus;
pub mod fiber;
pub mod scheduler;
pub mod section;

mod cache;

// Re-exports
pub use document::*;
pub use error::*;
pub use event_bus::*;
pub use scheduler::*;
pub use section::*;
