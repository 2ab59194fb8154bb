//! Name-keyed registry of forwarders
//!
//! Structural changes (`add`, `remove`, `shutdown`) hold the write lock for the
//! whole operation, including the forwarder's own start/stop. Readers and the
//! per-name `start`/`stop` calls share the read lock.

use crate::forwarder::{Forwarder, ForwarderConfig, ForwarderError};
use crate::sink::LogSink;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("proxy: {0} exists")]
    AlreadyExists(String),

    #[error("proxy: {0} does not exist")]
    NotFound(String),

    #[error(transparent)]
    Forwarder(#[from] ForwarderError),
}

/// Point-in-time copy of one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detail {
    pub name: String,
    pub local: String,
    pub remote: String,
    pub running: bool,
}

impl Detail {
    fn of(forwarder: &Forwarder) -> Self {
        Self {
            name: forwarder.name().to_string(),
            local: forwarder.local().to_string(),
            remote: forwarder.remote().to_string(),
            running: forwarder.is_running(),
        }
    }
}

/// Settings applied to every forwarder the registry creates
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub forwarder: ForwarderConfig,
}

pub struct Registry {
    config: RegistryConfig,
    sink: Arc<dyn LogSink>,
    forwarders: RwLock<HashMap<String, Arc<Forwarder>>>,
}

impl Registry {
    pub fn new(config: RegistryConfig, sink: Arc<dyn LogSink>) -> Self {
        Self {
            config,
            sink,
            forwarders: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create, register and start a forwarder.
    ///
    /// If the forwarder fails to start it is removed again, so a failed `add`
    /// never leaves an entry behind.
    pub async fn add(&self, name: &str, local: &str, remote: &str) -> Result<(), RegistryError> {
        let mut forwarders = self.forwarders.write().await;
        if forwarders.contains_key(name) {
            return Err(RegistryError::AlreadyExists(name.to_string()));
        }

        let forwarder = Arc::new(
            Forwarder::create(
                name,
                local,
                remote,
                self.config.forwarder.clone(),
                self.sink.clone(),
            )
            .await?,
        );
        forwarders.insert(name.to_string(), forwarder.clone());

        if let Err(e) = forwarder.start().await {
            forwarders.remove(name);
            return Err(e.into());
        }

        self.sink.info(&format!(
            "registered {}: {} -> {}",
            name,
            forwarder.local(),
            forwarder.remote()
        ));
        Ok(())
    }

    /// Stop a forwarder and delete its entry.
    ///
    /// An entry that is already stopped is still removed. A shutdown that could
    /// not be confirmed is logged and the entry is removed anyway; its accept
    /// loop exits on its own.
    pub async fn remove(&self, name: &str) -> Result<(), RegistryError> {
        let mut forwarders = self.forwarders.write().await;
        let forwarder = forwarders
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        match forwarder.stop().await {
            Ok(()) | Err(ForwarderError::NotRunning(_)) => {}
            Err(e) => self.sink.error(&format!("removing {}: {}", name, e)),
        }

        forwarders.remove(name);
        self.sink.info(&format!("removed {}", name));
        Ok(())
    }

    /// Start a registered forwarder that is currently stopped
    pub async fn start(&self, name: &str) -> Result<(), RegistryError> {
        let forwarders = self.forwarders.read().await;
        let forwarder = forwarders
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        forwarder.start().await?;
        Ok(())
    }

    /// Stop a registered forwarder without removing it
    pub async fn stop(&self, name: &str) -> Result<(), RegistryError> {
        let forwarders = self.forwarders.read().await;
        let forwarder = forwarders
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        forwarder.stop().await?;
        Ok(())
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.forwarders.read().await.contains_key(name)
    }

    pub async fn detail(&self, name: &str) -> Option<Detail> {
        let forwarders = self.forwarders.read().await;
        forwarders.get(name).map(|f| Detail::of(f))
    }

    /// Snapshot of every entry, in no particular order
    pub async fn list_details(&self) -> Vec<Detail> {
        let forwarders = self.forwarders.read().await;
        forwarders.values().map(|f| Detail::of(f)).collect()
    }

    pub async fn len(&self) -> usize {
        self.forwarders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.forwarders.read().await.is_empty()
    }

    /// Stop and remove every forwarder
    pub async fn shutdown(&self) {
        let mut forwarders = self.forwarders.write().await;
        for (name, forwarder) in forwarders.drain() {
            match forwarder.stop().await {
                Ok(()) | Err(ForwarderError::NotRunning(_)) => {}
                Err(e) => self.sink.error(&format!("shutting down {}: {}", name, e)),
            }
        }
        self.sink.info("all forwarders stopped");
    }
}
