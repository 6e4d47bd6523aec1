//! Optional external symbol classification.
//!
//! The detector works without any backend. When one is configured it is
//! consulted only for components the local templates left unclassified,
//! always under a timeout, and any failure keeps the local result.

pub mod http;
pub mod provider;

pub use http::{extract_json_object, parse_verdict, HttpSymbolClassifier};
pub use provider::{ClassificationRequest, ClassifierError, ClassifierVerdict, SymbolClassifier};
