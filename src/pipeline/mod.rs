//! Message processing pipeline.
//!
//! Every message a source yields flows through:
//! 1. `Classifier::classify()`: LLM category, priority and action items
//! 2. `RuleEngine::evaluate()`: pure matching, no I/O
//! 3. `rules::resolve()`: conflict policy over the planned actions
//!
//! Applying the resulting actions and writing the audit record is the
//! orchestrator's job.

pub mod classifier;
pub mod rules;
pub mod text;

pub use classifier::{Classifier, ClassifierConfig};
pub use rules::{ConflictPolicy, PlannedAction, RuleConfig, RuleEngine};
