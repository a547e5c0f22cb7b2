//! Container-to-host path translation.
//!
//! The API may run in a container that sees uploads under one prefix while
//! the worker sees the same files under another. Paths are rewritten by
//! prefix, component-wise, before they reach the pipeline.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTranslator {
    mapping: Option<(PathBuf, PathBuf)>,
}

impl PathTranslator {
    /// A translator that rewrites `from` to `to`.
    pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            mapping: Some((from.into(), to.into())),
        }
    }

    /// The identity translator.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Rewrite `path` if it lies under the source prefix; otherwise return it unchanged.
    pub fn translate(&self, path: &Path) -> PathBuf {
        match &self.mapping {
            Some((from, to)) => match path.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.clone(),
                Ok(rest) => to.join(rest),
                Err(_) => path.to_path_buf(),
            },
            None => path.to_path_buf(),
        }
    }
}
