//! Per-element result storage: four channel stores (inputs, outputs,
//! locals, RT-factors) behind start/end/step-time and step-count gates.

use std::sync::Arc;

use tracing::error;

use crate::core::compare::{double_eq, double_geq, double_gt, double_lt};
use crate::core::error::{Result, SimbusError};
use crate::core::port::PortInfo;
use crate::core::value::ValueCell;
use crate::storage::channel_storage::ChannelStorage;
use crate::storage::results::BackendHub;

/// The four channel classes a component stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelClass {
    In,
    Out,
    Local,
    RtFactor,
}

impl ChannelClass {
    pub const ALL: [ChannelClass; 4] = [
        ChannelClass::In,
        ChannelClass::Out,
        ChannelClass::Local,
        ChannelClass::RtFactor,
    ];

    pub fn index(&self) -> usize {
        match self {
            ChannelClass::In => 0,
            ChannelClass::Out => 1,
            ChannelClass::Local => 2,
            ChannelClass::RtFactor => 3,
        }
    }

    /// Result-file suffix of the class.
    pub fn suffix(&self) -> &'static str {
        match self {
            ChannelClass::In => "in",
            ChannelClass::Out => "res",
            ChannelClass::Local => "local",
            ChannelClass::RtFactor => "RTFactor",
        }
    }
}

/// What level of detail a store call carries. Rows above the configured
/// level are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StoreLevel {
    None,
    /// Synchronisation-step results only.
    Communication,
    /// Also intra-step coupling results.
    Coupling,
}

/// Rate-limiting configuration of one component's storage.
#[derive(Debug, Clone)]
pub struct StorageGates {
    pub store_level: Option<StoreLevel>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    /// Minimum simulated time between two stored rows.
    pub step_time: Option<f64>,
    /// Store only every n-th call.
    pub step_count: u64,
}

impl Default for StorageGates {
    fn default() -> Self {
        Self {
            store_level: None,
            start_time: None,
            end_time: None,
            step_time: None,
            step_count: 0,
        }
    }
}

impl StorageGates {
    pub fn validate(&self) -> Result<()> {
        if let Some(step_time) = self.step_time {
            if !double_eq(step_time, 0.0) && self.step_count != 0 {
                return Err(SimbusError::Config(
                    "invalid storage settings: both step time and step count defined".into(),
                ));
            }
        }
        Ok(())
    }
}

pub struct ComponentStorage {
    component: usize,
    component_name: String,
    channels: [ChannelStorage; 4],
    store_level: StoreLevel,
    start_time: f64,
    start_time_defined: bool,
    end_time: f64,
    end_time_defined: bool,
    step_time: f64,
    step_time_defined: bool,
    step_count: u64,
    time_offset: f64,
    hub: Option<Arc<BackendHub>>,
    finished: bool,
}

impl ComponentStorage {
    /// Storage that stays disabled (no hub attached).
    pub fn disabled(component_name: &str) -> Self {
        Self {
            component: 0,
            component_name: component_name.to_string(),
            channels: Default::default(),
            store_level: StoreLevel::None,
            start_time: -1.0,
            start_time_defined: false,
            end_time: -1.0,
            end_time_defined: false,
            step_time: 0.0,
            step_time_defined: false,
            step_count: 0,
            time_offset: 0.0,
            hub: None,
            finished: false,
        }
    }

    /// Configure against the shared backend hub.
    ///
    /// `step_count` is rescaled once by `ceil(coupling_step /
    /// sync_step)`: when an element's coupling steps are larger than
    /// the synchronisation step, the coupling steps take the role of
    /// the synchronisation steps and the count shrinks accordingly.
    pub fn setup(
        &mut self,
        component: usize,
        hub: Arc<BackendHub>,
        gates: &StorageGates,
        sync_step: f64,
        coupling_step: f64,
    ) -> Result<()> {
        gates.validate()?;

        self.component = component;
        self.store_level = gates.store_level.unwrap_or_else(|| hub.store_level());

        self.start_time_defined = gates.start_time.is_some();
        self.start_time = gates.start_time.unwrap_or_else(|| hub.start_time());
        self.end_time_defined = gates.end_time.is_some();
        self.end_time = gates.end_time.unwrap_or(-1.0);
        self.step_time_defined = gates.step_time.is_some();
        self.step_time = gates.step_time.unwrap_or(0.0);

        self.step_count = gates.step_count;
        if sync_step * coupling_step != 0.0 {
            self.step_count =
                (self.step_count as f64 / (coupling_step / sync_step).ceil()) as u64;
        }

        let keep_rows = hub.needs_full_storage();
        self.channels = [
            ChannelStorage::new(keep_rows),
            ChannelStorage::new(keep_rows),
            ChannelStorage::new(keep_rows),
            ChannelStorage::new(keep_rows),
        ];

        self.hub = Some(hub);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.hub.is_some() && self.store_level > StoreLevel::None
    }

    pub fn disable(&mut self) {
        self.store_level = StoreLevel::None;
    }

    pub fn set_time_offset(&mut self, offset: f64) {
        self.time_offset = offset;
    }

    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    /// Register one channel of a class for storage. Ports with the
    /// write-result flag off and classes disabled in the hub are
    /// skipped silently.
    pub fn register_channel(
        &mut self,
        class: ChannelClass,
        info: &PortInfo,
        cell: ValueCell,
    ) -> Result<()> {
        if !self.is_enabled() || !info.write_result {
            return Ok(());
        }
        let Some(hub) = &self.hub else { return Ok(()) };
        if !hub.class_enabled(class) {
            return Ok(());
        }
        self.channels[class.index()].register_channel(info.clone(), cell)
    }

    /// Announce the registered channels of every non-empty class to the
    /// backends. Called once after registration, before the first row.
    pub fn setup_backends(&mut self) -> Result<()> {
        let Some(hub) = &self.hub else { return Ok(()) };
        for class in ChannelClass::ALL {
            let store = &self.channels[class.index()];
            if store.num_channels() > 0 {
                hub.setup_component(self.component, &self.component_name, class, &store.infos())?;
            }
        }
        Ok(())
    }

    /// Store one row of `class` at `time`, subject to the gates.
    pub fn store_channels(&mut self, class: ChannelClass, time: f64, level: StoreLevel) -> Result<()> {
        let Some(hub) = self.hub.clone() else {
            return Ok(());
        };
        if !hub.is_active() {
            return Ok(());
        }

        let time = time + self.time_offset;

        if level > self.store_level {
            return Ok(());
        }

        let store = &mut self.channels[class.index()];
        if store.num_channels() == 0 {
            return Ok(());
        }

        // ignore values before start time and after end time
        if self.start_time_defined && double_lt(time, self.start_time) {
            return Ok(());
        }
        if self.end_time_defined && double_lt(self.end_time, time) {
            return Ok(());
        }

        // at least step_time between stores, unless this is the first
        if self.step_time_defined
            && double_geq(store.last_stored, self.start_time)
            && double_gt(store.last_stored + self.step_time, time)
        {
            return Ok(());
        }

        if self.step_count > 0 {
            store.store_call_num += 1;
            if (store.store_call_num - 1) % self.step_count != 0 {
                return Ok(());
            }
        }

        if double_lt(time, store.last_stored) {
            let message = format!(
                "{}: setting result for previous time ({time:.17} s < {:.17} s), ignoring value",
                self.component_name, store.last_stored
            );
            error!("{message}");
            return Err(SimbusError::Storage(message));
        }

        if let Some(row) = store.store(time)? {
            hub.store_row(self.component, class, &row)?;
        }
        Ok(())
    }

    /// Flush everything that is still buffered and notify the hub that
    /// this component is done. Idempotent.
    pub fn finished(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let Some(hub) = self.hub.clone() else {
            return Ok(());
        };

        for class in ChannelClass::ALL {
            let store = &mut self.channels[class.index()];
            if store.num_channels() == 0 {
                continue;
            }
            if let Some(pending) = store.take_pending() {
                hub.store_row(self.component, class, &pending)?;
            }
            if !store.is_empty() {
                hub.store_full_rows(self.component, class, store.rows())?;
            }
        }

        hub.component_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_time_and_step_count_exclusive() {
        let gates = StorageGates {
            step_time: Some(0.5),
            step_count: 2,
            ..Default::default()
        };
        assert!(gates.validate().is_err());

        let gates = StorageGates {
            step_time: Some(0.5),
            ..Default::default()
        };
        assert!(gates.validate().is_ok());
    }

    #[test]
    fn test_class_suffixes() {
        assert_eq!(ChannelClass::In.suffix(), "in");
        assert_eq!(ChannelClass::Out.suffix(), "res");
        assert_eq!(ChannelClass::Local.suffix(), "local");
        assert_eq!(ChannelClass::RtFactor.suffix(), "RTFactor");
    }

    #[test]
    fn test_store_level_ordering() {
        assert!(StoreLevel::Coupling > StoreLevel::Communication);
        assert!(StoreLevel::Communication > StoreLevel::None);
    }

    #[test]
    fn test_disabled_storage_ignores_stores() {
        let mut storage = ComponentStorage::disabled("e");
        assert!(!storage.is_enabled());
        assert!(
            storage
                .store_channels(ChannelClass::Out, 0.0, StoreLevel::Communication)
                .is_ok()
        );
    }
}
