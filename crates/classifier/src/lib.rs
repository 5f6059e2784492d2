//! Severity Classifier
//!
//! Applies an ordered list of predicate -> severity rules against an alert
//! plus its contextual signals. First match wins; severity only ever
//! upgrades above the reporter's declared floor.

mod rules;

pub use rules::{Classifier, ClassifierConfig, Rule};
