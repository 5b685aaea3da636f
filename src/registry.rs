//! The process-wide list of services.
//!
//! Every read and write goes through [`Registry::lock`], which yields a
//! [`Services`] guard. The list is kept sorted by ascending priority, with
//! equal priorities in insertion order, and is re-sorted before any mutation
//! returns, so no holder of the lock ever sees it half-ordered.

use crate::config::ServiceConfig;
use crate::service::{Service, ServiceState};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a service named {name} already exists (from {existing_file})")]
    DuplicateName { name: String, existing_file: String },
}

/// Point-in-time view of one service, safe to hold without the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSummary {
    pub name: String,
    pub file: String,
    pub priority: i32,
    pub state: ServiceState,
    pub restarts: u32,
}

#[derive(Clone, Default)]
pub struct Registry {
    services: Arc<Mutex<Vec<Service>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> Services<'_> {
        Services {
            list: self.services.lock().await,
        }
    }

    pub async fn snapshot(&self) -> Vec<ServiceSummary> {
        self.lock().await.snapshot()
    }
}

/// Exclusive access to the service list.
pub struct Services<'a> {
    list: MutexGuard<'a, Vec<Service>>,
}

impl Services<'_> {
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Inserts a service and re-sorts. Names are unique; a second service
    /// with a taken name is refused.
    pub fn add(&mut self, service: Service) -> Result<(), RegistryError> {
        if let Some(existing) = self.find(service.name()) {
            return Err(RegistryError::DuplicateName {
                name: service.name().to_string(),
                existing_file: existing.config().file.clone(),
            });
        }
        self.list.push(service);
        self.resort();
        Ok(())
    }

    pub fn remove_where(&mut self, pred: impl FnMut(&Service) -> bool) -> Option<Service> {
        let index = self.list.iter().position(pred)?;
        Some(self.list.remove(index))
    }

    /// Swaps the configuration of the service loaded from `file` and
    /// re-sorts, since the priority may have changed. Returns the old
    /// configuration, or `None` when no service comes from `file`.
    pub fn replace_config(&mut self, file: &str, config: ServiceConfig) -> Option<ServiceConfig> {
        let old = self.find_by_file_mut(file)?.replace_config(config);
        self.resort();
        Some(old)
    }

    /// Stable sort by priority. Must follow any change to a priority.
    fn resort(&mut self) {
        self.list.sort_by_key(|s| s.config().priority);
    }

    pub fn find(&self, name: &str) -> Option<&Service> {
        self.list.iter().find(|s| s.name() == name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Service> {
        self.list.iter_mut().find(|s| s.name() == name)
    }

    pub fn find_by_file(&self, file: &str) -> Option<&Service> {
        self.list.iter().find(|s| s.config().file == file)
    }

    pub fn find_by_file_mut(&mut self, file: &str) -> Option<&mut Service> {
        self.list.iter_mut().find(|s| s.config().file == file)
    }

    pub fn find_by_run_mut(&mut self, run_id: u64) -> Option<&mut Service> {
        self.list.iter_mut().find(|s| s.run_id() == Some(run_id))
    }

    pub fn find_by_pending_restart_mut(&mut self, id: u64) -> Option<&mut Service> {
        self.list
            .iter_mut()
            .find(|s| s.pending_restart() == Some(id))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Service> {
        self.list.get_mut(index)
    }

    /// Services in start order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Service> {
        self.list.iter()
    }

    pub fn iter_mut(&mut self) -> impl DoubleEndedIterator<Item = &mut Service> + ExactSizeIterator {
        self.list.iter_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.list.iter().map(|s| s.name().to_string()).collect()
    }

    /// Names in the order services are stopped: the reverse of start order.
    pub fn stop_order(&self) -> Vec<String> {
        self.list.iter().rev().map(|s| s.name().to_string()).collect()
    }

    pub fn snapshot(&self) -> Vec<ServiceSummary> {
        self.list
            .iter()
            .map(|s| ServiceSummary {
                name: s.name().to_string(),
                file: s.config().file.clone(),
                priority: s.config().priority,
                state: s.state().clone(),
                restarts: s.restarts(),
            })
            .collect()
    }
}
