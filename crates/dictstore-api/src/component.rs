//! Store factories.
//!
//! A [`DbComponent`] glues a logical name and its backend's extension into a
//! path request to the resolver, then builds an unopened store bound to that
//! path. A [`DbRegistry`] maps extensions to factories so callers can pick a
//! backend by tag.

use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::db::Db;
use crate::error::{DbError, DbResult};
use crate::resolver::ResourceResolver;

/// A concrete backend the factory can build.
pub trait DbClass: Db + Sized + 'static {
    /// File extension identifying the backend, including the leading dot.
    const EXTENSION: &'static str;

    /// Backend-specific settings shared by every store the factory builds.
    type Options: Clone + Send + Sync + 'static;

    /// Build an unopened store bound to `file_path`.
    fn create(file_path: PathBuf, name: &str, options: Self::Options) -> Self;
}

/// Factory for stores of backend `D`.
pub struct DbComponent<D: DbClass> {
    resolver: Arc<dyn ResourceResolver>,
    options: D::Options,
    _backend: PhantomData<fn() -> D>,
}

impl<D: DbClass> DbComponent<D> {
    pub fn new(resolver: Arc<dyn ResourceResolver>, options: D::Options) -> Self {
        Self { resolver, options, _backend: PhantomData }
    }

    pub fn extension(&self) -> &'static str {
        D::EXTENSION
    }

    pub fn db_file_path(&self, name: &str) -> PathBuf {
        self.resolver.resolve_path(name, D::EXTENSION)
    }

    pub fn create(&self, name: &str) -> D {
        let path = self.db_file_path(name);
        debug!(store = name, path = %path.display(), extension = D::EXTENSION, "creating store handle");
        D::create(path, name, self.options.clone())
    }
}

impl<D: DbClass> Clone for DbComponent<D> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.resolver), self.options.clone())
    }
}

impl<D: DbClass> fmt::Debug for DbComponent<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbComponent").field("extension", &D::EXTENSION).finish()
    }
}

/// Object-safe view of a [`DbComponent`].
pub trait DbFactory: Send + Sync {
    fn extension(&self) -> &'static str;

    fn db_file_path(&self, name: &str) -> PathBuf;

    fn create(&self, name: &str) -> Box<dyn Db>;
}

impl<D: DbClass> DbFactory for DbComponent<D> {
    fn extension(&self) -> &'static str {
        D::EXTENSION
    }

    fn db_file_path(&self, name: &str) -> PathBuf {
        DbComponent::db_file_path(self, name)
    }

    fn create(&self, name: &str) -> Box<dyn Db> {
        Box::new(DbComponent::create(self, name))
    }
}

/// Factories keyed by backend extension.
#[derive(Default)]
pub struct DbRegistry {
    factories: RwLock<HashMap<&'static str, Arc<dyn DbFactory>>>,
}

impl DbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its extension, replacing any previous one.
    pub fn register(&self, factory: Arc<dyn DbFactory>) -> Option<Arc<dyn DbFactory>> {
        let extension = factory.extension();
        debug!(extension, "registering store backend");
        self.factories.write().insert(extension, factory)
    }

    pub fn get(&self, extension: &str) -> Option<Arc<dyn DbFactory>> {
        self.factories.read().get(extension).cloned()
    }

    /// Build an unopened store of the backend registered for `extension`.
    pub fn create(&self, extension: &str, name: &str) -> DbResult<Box<dyn Db>> {
        let factory = self
            .get(extension)
            .ok_or_else(|| DbError::UnknownBackend(extension.to_string()))?;
        Ok(factory.create(name))
    }

    /// Registered extensions, sorted.
    pub fn extensions(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = self.factories.read().keys().copied().collect();
        out.sort_unstable();
        out
    }
}

impl fmt::Debug for DbRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbRegistry").field("extensions", &self.extensions()).finish()
    }
}
