//! Per-run log context.
//!
//! A `RunLog` is built once per run and handed to each component at
//! construction. Components attach it as the `run` field of their `tracing`
//! events so interleaved runs stay distinguishable.

use std::fmt;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct RunLog {
    prefix: Arc<str>,
}

impl RunLog {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Arc::from(prefix.into()),
        }
    }

    /// Derive a context for a sub-component (`run/component`).
    pub fn child(&self, component: &str) -> Self {
        Self::new(format!("{}/{component}", self.prefix))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl fmt::Display for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix)
    }
}
