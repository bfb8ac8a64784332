//! Environment registry: environment kind → factory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use rlm_config::EnvironmentConfig;
use rlm_core::{Environment, EnvironmentError};

use crate::local::LocalEnvironment;
use crate::remote::RemoteEnvironment;

pub type EnvironmentFactory = Arc<
    dyn Fn(&EnvironmentConfig, SocketAddr) -> Result<Box<dyn Environment>, EnvironmentError>
        + Send
        + Sync,
>;

/// Builds environments by kind. Every factory receives the router's bound
/// address so code inside the environment can call back.
#[derive(Clone)]
pub struct EnvironmentRegistry {
    factories: HashMap<String, EnvironmentFactory>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// `local` and `remote`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("local", |config, addr| {
            Ok(Box::new(LocalEnvironment::from_config(config, addr)?) as Box<dyn Environment>)
        });
        registry.register("remote", |config, addr| {
            Ok(Box::new(RemoteEnvironment::from_config(config, addr)?) as Box<dyn Environment>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&EnvironmentConfig, SocketAddr) -> Result<Box<dyn Environment>, EnvironmentError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn create(
        &self,
        config: &EnvironmentConfig,
        handler_addr: SocketAddr,
    ) -> Result<Box<dyn Environment>, EnvironmentError> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| EnvironmentError::UnknownKind(config.kind.clone()))?;
        factory(config, handler_addr)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for EnvironmentRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
