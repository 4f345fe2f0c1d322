//! Application discovery — finding frontends and backends to route to
//!
//! Discovery sources produce consistent snapshots of applications; the sync
//! supervisor polls them and rebuilds the routing table. Sources compose:
//! [`MultiDiscovery`] aggregates any number of readers into one.

pub mod file;

pub use file::FileDiscovery;

use crate::config::Application;
use crate::error::Result;
use async_trait::async_trait;

/// A source of application configuration
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Returns a consistent snapshot of all applications this source knows
    async fn read_applications(&self) -> Result<Vec<Application>>;
}

/// A discovery source that can also be administered
#[async_trait]
pub trait DiscoveryWriter: Send + Sync {
    async fn update_application(&self, app: Application) -> Result<()>;
    async fn delete_application(&self, app: Application) -> Result<()>;
}

/// A fixed set of apps (tests, embedding)
pub struct StaticDiscovery {
    apps: Vec<Application>,
}

impl StaticDiscovery {
    pub fn new(apps: Vec<Application>) -> Self {
        Self { apps }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn read_applications(&self) -> Result<Vec<Application>> {
        Ok(self.apps.clone())
    }
}

/// Merges multiple discovery readers into one aggregated reader.
/// Any failing source fails the whole read, so a partial snapshot is never
/// mistaken for a complete one.
pub struct MultiDiscovery {
    readers: Vec<Box<dyn Discovery>>,
}

impl MultiDiscovery {
    pub fn new(readers: Vec<Box<dyn Discovery>>) -> Self {
        Self { readers }
    }
}

#[async_trait]
impl Discovery for MultiDiscovery {
    async fn read_applications(&self) -> Result<Vec<Application>> {
        let mut merged = Vec::new();

        for reader in &self.readers {
            merged.extend(reader.read_applications().await?);
        }

        Ok(merged)
    }
}
