//! Installed application registry.
//!
//! The registry holds the immutable [`AppMetadata`] of every application
//! installed on the device.  The scheduler looks applications up here when
//! resolving launch type, mode and daemon flag.
//!
//! Backed by [`DashMap`] so lookups from concurrent creation tasks never
//! contend on a global lock.
//!
//! # Example
//!
//! ```rust
//! # use voxos_runtime::registry::AppRegistry;
//! # use voxos_runtime::types::{AppMetadata, LaunchType};
//! let registry = AppRegistry::new();
//! registry.register(AppMetadata::new("clock", LaunchType::Light));
//!
//! assert!(registry.contains("clock"));
//! assert_eq!(registry.get("clock").unwrap().launch_type, LaunchType::Light);
//! ```

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Result, RuntimeError};
use crate::types::{AppId, AppMetadata};

/// Concurrent registry of installed applications.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct AppRegistry {
    inner: Arc<DashMap<AppId, AppMetadata>>,
}

impl AppRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Build a registry from a list of descriptors.
    pub fn from_apps(apps: impl IntoIterator<Item = AppMetadata>) -> Self {
        let registry = Self::new();
        for app in apps {
            registry.register(app);
        }
        registry
    }

    /// Install an application.  An existing entry with the same id is
    /// overwritten.
    pub fn register(&self, metadata: AppMetadata) {
        tracing::info!(
            app_id = %metadata.id,
            launch_type = %metadata.launch_type,
            daemon = metadata.daemon,
            "app registered"
        );
        self.inner.insert(metadata.id.clone(), metadata);
    }

    /// Snapshot of an application's metadata.
    pub fn get(&self, app_id: &str) -> Result<AppMetadata> {
        self.inner
            .get(app_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RuntimeError::AppNotInstalled {
                app_id: app_id.to_string(),
            })
    }

    pub fn contains(&self, app_id: &str) -> bool {
        self.inner.contains_key(app_id)
    }

    /// All installed applications, sorted by id.
    pub fn list(&self) -> Vec<AppMetadata> {
        let mut apps: Vec<AppMetadata> = self.inner.iter().map(|e| e.value().clone()).collect();
        apps.sort_by(|a, b| a.id.cmp(&b.id));
        apps
    }

    /// Ids of every installed daemon application.
    pub fn daemons(&self) -> Vec<AppId> {
        let mut ids: Vec<AppId> = self
            .inner
            .iter()
            .filter(|e| e.value().daemon)
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::new()
    }
}
