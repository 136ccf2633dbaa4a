//! # toolflow
//!
//! Terminal front end for the toolflow engine. A flow file lists typed steps
//! (model turn, tool call, file read, approval); `toolflow run` executes it
//! with retries, policy checks, and human approval, and reports every step.
//!
//! ```bash
//! toolflow run flows/release.json --yes
//! toolflow run flows/release.toml --dry-run --events
//! toolflow translate --shell windows test -f package.json
//! ```
//!
//! The workspace splits into:
//!
//! - `toolflow-commons`: failure categories and classifiers.
//! - `toolflow-exec-events`: the observable event schema and emitters.
//! - `toolflow-bash-runner`: command translation, policy, and the retrying executor.
//! - `toolflow-llm`: provider trait, stream normalizer, tool-call accumulator.
//! - `toolflow-core`: flow definitions, context, handlers, engine, configuration.

pub mod approval;
pub mod cli;
pub mod startup;
