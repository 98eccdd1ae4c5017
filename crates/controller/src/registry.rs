use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::info;
use weir_core::{ControllerConfig, Object, RemoteSource};

use crate::controller::Controller;

/// Per-namespace controller singletons for one resource type.
///
/// Share it by reference (or `Arc`) between every client of that resource so
/// they all reuse one cache and one queue per scope.
pub struct ControllerRegistry<K: Object> {
    resource: String,
    config: ControllerConfig,
    controllers: Mutex<HashMap<Option<String>, Arc<Controller<K>>>>,
}

impl<K: Object> ControllerRegistry<K> {
    pub fn new(resource: &str, config: ControllerConfig) -> Self {
        Self { resource: resource.to_string(), config, controllers: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Option<String>, Arc<Controller<K>>>> {
        self.controllers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn resource(&self) -> &str { &self.resource }

    /// Controller for `namespace` (`None` = cluster-wide), built on first use
    /// from the source `make` returns.
    pub fn controller_for(
        &self,
        namespace: Option<&str>,
        make: impl FnOnce() -> Arc<dyn RemoteSource<K>>,
    ) -> Arc<Controller<K>> {
        let mut map = self.lock();
        let scope = namespace.map(str::to_string);
        if let Some(c) = map.get(&scope) {
            return Arc::clone(c);
        }
        let controller =
            Arc::new(Controller::new(&self.resource, make(), self.config.clone()).in_namespace(namespace));
        info!(resource = %self.resource, namespace = ?namespace, "registry: controller created");
        map.insert(scope, Arc::clone(&controller));
        controller
    }

    pub fn get(&self, namespace: Option<&str>) -> Option<Arc<Controller<K>>> {
        self.lock().get(&namespace.map(str::to_string)).cloned()
    }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Start every controller created so far.
    pub fn start_all(&self, token: &CancellationToken, threadiness: usize) {
        let controllers: Vec<_> = self.lock().values().cloned().collect();
        for c in controllers {
            c.start(token, threadiness);
        }
    }

    /// Wait until every controller's tasks have exited.
    pub async fn stopped(&self) {
        let controllers: Vec<_> = self.lock().values().cloned().collect();
        for c in controllers {
            c.stopped().await;
        }
    }
}
