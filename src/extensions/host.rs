//! Holder of the live extension manager
//!
//! An [`ExtensionHost`] is constructed by the application and passed to
//! whoever needs the manager. It keeps at most one manager alive and always
//! disposes the previous one before a replacement becomes visible.

use std::sync::{Arc, RwLock};
use tracing::debug;

use super::error::HostError;
use super::manager::ExtensionManager;

#[derive(Debug, Default)]
pub struct ExtensionHost {
    current: RwLock<Option<Arc<ExtensionManager>>>,
}

impl ExtensionHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `manager`, disposing the one it replaces
    pub fn install(&self, manager: ExtensionManager) -> Arc<ExtensionManager> {
        let manager = Arc::new(manager);
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());

        if let Some(previous) = current.take() {
            debug!("Disposing replaced extension manager");
            previous.dispose();
        }
        *current = Some(manager.clone());

        manager
    }

    /// Dispose and clear the installed manager
    pub fn shutdown(&self) {
        let previous = self
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(previous) = previous {
            previous.dispose();
        }
    }

    /// The installed manager
    pub fn manager(&self) -> Result<Arc<ExtensionManager>, HostError> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(HostError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
