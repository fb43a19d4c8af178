//! Logical name → file path resolution.

use std::path::PathBuf;

/// Maps a logical store name and a backend extension to a path.
///
/// Callers never build store paths themselves.
pub trait ResourceResolver: Send + Sync {
    fn resolve_path(&self, name: &str, extension: &str) -> PathBuf;
}

impl<F> ResourceResolver for F
where
    F: Fn(&str, &str) -> PathBuf + Send + Sync,
{
    fn resolve_path(&self, name: &str, extension: &str) -> PathBuf {
        self(name, extension)
    }
}

/// Resolves `<root>/<prefix><name><extension>`.
#[derive(Debug, Clone)]
pub struct DirResolver {
    root: PathBuf,
    prefix: String,
}

impl DirResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), prefix: String::new() }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

impl ResourceResolver for DirResolver {
    fn resolve_path(&self, name: &str, extension: &str) -> PathBuf {
        self.root.join(format!("{}{}{}", self.prefix, name, extension))
    }
}
