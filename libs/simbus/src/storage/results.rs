//! The shared backend hub and its owning results storage.
//!
//! Component storages live inside their elements; what they share is
//! the hub: the backend registry, the per-class enable flags and the
//! finished bookkeeping. The hub only sees fully rendered rows.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::core::error::{Result, SimbusError};
use crate::core::port::PortInfo;
use crate::core::value::ChannelValue;
use crate::storage::backend::Backend;
use crate::storage::component_storage::{ChannelClass, StoreLevel};
use crate::storage::csv::CsvBackend;

pub struct BackendHub {
    backends: Mutex<Vec<Box<dyn Backend>>>,
    class_enabled: [bool; 4],
    store_level: StoreLevel,
    start_time: f64,
    needs_full_storage: bool,
    active: AtomicBool,
    num_components: AtomicUsize,
    num_finished: AtomicUsize,
    backends_finished: AtomicBool,
}

impl BackendHub {
    pub fn class_enabled(&self, class: ChannelClass) -> bool {
        self.class_enabled[class.index()]
    }

    pub fn store_level(&self) -> StoreLevel {
        self.store_level
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn needs_full_storage(&self) -> bool {
        self.needs_full_storage
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn register_component(&self) -> usize {
        self.num_components.fetch_add(1, Ordering::Relaxed)
    }

    pub fn setup_component(
        &self,
        component: usize,
        component_name: &str,
        class: ChannelClass,
        infos: &[PortInfo],
    ) -> Result<()> {
        let mut backends = self.backends.lock();
        for backend in backends.iter_mut() {
            backend.setup_component(component, component_name, class, infos)?;
        }
        Ok(())
    }

    /// A finalised row for the streaming backends.
    pub fn store_row(&self, component: usize, class: ChannelClass, row: &[ChannelValue]) -> Result<()> {
        if !self.class_enabled(class) {
            return Ok(());
        }
        let mut backends = self.backends.lock();
        let mut status = Ok(());
        for backend in backends.iter_mut() {
            if backend.store_at_runtime() {
                if let Err(e) = backend.store_row(component, class, row) {
                    error!("store backends: could not store successfully: {e}");
                    status = Err(SimbusError::Storage(format!(
                        "backend {} failed to store row",
                        backend.name()
                    )));
                }
            }
        }
        status
    }

    /// The retained rows of one `(component, class)` pair, for the
    /// full-storage backends at the end of the run.
    pub fn store_full_rows(
        &self,
        component: usize,
        class: ChannelClass,
        rows: &[Vec<ChannelValue>],
    ) -> Result<()> {
        if !self.class_enabled(class) {
            return Ok(());
        }
        let mut backends = self.backends.lock();
        for backend in backends.iter_mut() {
            if !backend.store_at_runtime() {
                for row in rows {
                    backend.store_row(component, class, row)?;
                }
            }
        }
        Ok(())
    }

    /// One component's storage is done; the last one finalises the
    /// backends.
    pub fn component_finished(&self) -> Result<()> {
        let finished = self.num_finished.fetch_add(1, Ordering::Relaxed) + 1;
        if finished >= self.num_components.load(Ordering::Relaxed) {
            self.finish_backends()?;
        }
        Ok(())
    }

    /// Finalise every backend exactly once.
    pub fn finish_backends(&self) -> Result<()> {
        if self.backends_finished.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let mut backends = self.backends.lock();
        let mut status = Ok(());
        for backend in backends.iter_mut() {
            if let Err(e) = backend.finish() {
                error!("finish backends: could not finish successfully: {e}");
                status = Err(SimbusError::Storage(format!(
                    "backend {} failed to finish",
                    backend.name()
                )));
            }
        }
        status
    }
}

/// Configuration and ownership wrapper around the hub.
pub struct ResultsStorage {
    hub: Option<Arc<BackendHub>>,
    result_dir: Option<PathBuf>,
    class_enabled: [bool; 4],
    store_level: StoreLevel,
    start_time: f64,
    csv_enabled: bool,
    csv_store_at_runtime: bool,
}

impl Default for ResultsStorage {
    fn default() -> Self {
        Self {
            hub: None,
            result_dir: None,
            class_enabled: [true, true, true, true],
            store_level: StoreLevel::Communication,
            start_time: 0.0,
            csv_enabled: true,
            csv_store_at_runtime: false,
        }
    }
}

impl ResultsStorage {
    pub fn set_result_dir(&mut self, dir: impl Into<PathBuf>) {
        self.result_dir = Some(dir.into());
    }

    pub fn result_dir(&self) -> Option<&PathBuf> {
        self.result_dir.as_ref()
    }

    pub fn set_class_enabled(&mut self, class: ChannelClass, enabled: bool) {
        self.class_enabled[class.index()] = enabled;
    }

    pub fn set_store_level(&mut self, level: StoreLevel) {
        self.store_level = level;
    }

    pub fn set_csv(&mut self, enabled: bool, store_at_runtime: bool) {
        self.csv_enabled = enabled;
        self.csv_store_at_runtime = store_at_runtime;
    }

    /// Build the hub and its backends. Without a result directory the
    /// storage stays inactive (a dry run).
    pub fn setup(&mut self, start_time: f64) -> Result<()> {
        self.start_time = start_time;

        let mut backends: Vec<Box<dyn Backend>> = Vec::new();
        if self.csv_enabled {
            if let Some(dir) = &self.result_dir {
                backends.push(Box::new(CsvBackend::new(dir.clone(), self.csv_store_at_runtime)?));
            } else {
                debug!("results: no result directory set, storage stays inactive");
            }
        }

        let needs_full_storage = backends.iter().any(|b| !b.store_at_runtime());
        let active = !backends.is_empty();

        self.hub = Some(Arc::new(BackendHub {
            backends: Mutex::new(backends),
            class_enabled: self.class_enabled,
            store_level: self.store_level,
            start_time,
            needs_full_storage,
            active: AtomicBool::new(active),
            num_components: AtomicUsize::new(0),
            num_finished: AtomicUsize::new(0),
            backends_finished: AtomicBool::new(false),
        }));
        Ok(())
    }

    pub fn hub(&self) -> Result<Arc<BackendHub>> {
        self.hub
            .as_ref()
            .cloned()
            .ok_or_else(|| SimbusError::Storage("results storage not set up".into()))
    }

    /// Finalise the backends regardless of per-component bookkeeping,
    /// e.g. after an aborted run.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(hub) = &self.hub {
            hub.finish_backends()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_without_dir_is_inactive() {
        let mut storage = ResultsStorage::default();
        storage.setup(0.0).unwrap();
        let hub = storage.hub().unwrap();
        assert!(!hub.is_active());
        assert!(!hub.needs_full_storage());
    }

    #[test]
    fn test_hub_requires_setup() {
        let storage = ResultsStorage::default();
        assert!(storage.hub().is_err());
    }

    #[test]
    fn test_class_enable_flags() {
        let mut storage = ResultsStorage::default();
        storage.set_class_enabled(ChannelClass::RtFactor, false);
        storage.setup(0.0).unwrap();
        let hub = storage.hub().unwrap();
        assert!(hub.class_enabled(ChannelClass::Out));
        assert!(!hub.class_enabled(ChannelClass::RtFactor));
    }
}
