//! Manifest and template engine.
//!
//! Three concerns live here: hash-stable serialization of state payloads,
//! deterministic YAML templates for the cluster resources a site deploys,
//! and the small `if/variable` template language used by the application
//! compose engine. Everything is pure; callers supply the data.

mod bundle;
mod expander;
mod hash;
mod statekey;
mod templates;

pub use bundle::{site_bundle, BundleAccessPoint, BundleLink, BundleSecret, SiteBundle};
pub use expander::{expand, parse_template, Template};
pub use hash::{hash_of_data, hash_of_object_no_children, hash_of_text};
pub use statekey::StateKey;
pub use templates::*;

use thiserror::Error;

/// Errors raised while parsing or rendering templates.
#[derive(Error, Debug, PartialEq)]
pub enum ManifestError {
    /// `end` without a matching `if`
    #[error("Template error: 'end' without matching 'if'")]
    UnmatchedEnd,

    /// An `if` clause never closed
    #[error("Template error: unclosed 'if' clause")]
    UnclosedIf,

    /// `else` outside an `if` clause
    #[error("Template error: 'else' without matching 'if'")]
    DanglingElse,

    /// A tag that is not a variable, `if`, `else`, or `end`
    #[error("Template error: unrecognized tag '{0}'")]
    BadTag(String),

    /// YAML serialization failure
    #[error("YAML error: {0}")]
    Yaml(String),
}

pub type ManifestResult<T> = Result<T, ManifestError>;
