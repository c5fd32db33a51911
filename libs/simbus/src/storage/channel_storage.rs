//! One column store per channel class: the registered value cells are
//! sampled at store time into rows, time first.

use crate::core::error::{Result, SimbusError};
use crate::core::port::PortInfo;
use crate::core::value::{ChannelValue, ValueCell};

#[derive(Debug)]
struct StoredChannel {
    info: PortInfo,
    cell: ValueCell,
}

/// Rows of sampled channel values. In full-storage mode all rows stay
/// in memory until the end of the run; independent of that, one pending
/// row is held back so a same-time overwrite can replace it before it
/// reaches the streaming backends.
#[derive(Debug, Default)]
pub struct ChannelStorage {
    channels: Vec<StoredChannel>,
    keep_rows: bool,
    rows: Vec<Vec<ChannelValue>>,
    pending: Option<Vec<ChannelValue>>,
    /// Simulated time of the newest stored row; negative before any.
    pub last_stored: f64,
    /// Number of store calls seen, for step-count gating.
    pub store_call_num: u64,
}

impl ChannelStorage {
    pub fn new(keep_rows: bool) -> Self {
        Self {
            channels: Vec::new(),
            keep_rows,
            rows: Vec::new(),
            pending: None,
            last_stored: -1.0,
            store_call_num: 0,
        }
    }

    pub fn register_channel(&mut self, info: PortInfo, cell: ValueCell) -> Result<()> {
        if !self.rows.is_empty() || self.pending.is_some() {
            return Err(SimbusError::Storage(format!(
                "register port {}: cannot register ports to storage after values have been stored",
                info.name
            )));
        }
        self.channels.push(StoredChannel { info, cell });
        Ok(())
    }

    /// Number of registered channels, excluding the time column.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn infos(&self) -> Vec<PortInfo> {
        self.channels.iter().map(|c| c.info.clone()).collect()
    }

    /// Sample all channels into a row at `time`. Returns a row that is
    /// now final and may be handed to streaming backends, if any.
    pub fn store(&mut self, time: f64) -> Result<Option<Vec<ChannelValue>>> {
        let mut row = Vec::with_capacity(self.channels.len() + 1);
        row.push(ChannelValue::Double(time));
        for channel in &self.channels {
            row.push(channel.cell.get());
        }

        // last-sample-wins at identical times
        let same_time = self.last_stored == time;

        if self.keep_rows {
            if same_time {
                if let Some(last) = self.rows.last_mut() {
                    *last = row.clone();
                } else {
                    self.rows.push(row.clone());
                }
            } else {
                self.rows.push(row.clone());
            }
        }

        let finalised = match self.pending.take() {
            Some(previous) if !same_time => Some(previous),
            _ => None,
        };
        self.pending = Some(row);

        self.last_stored = time;
        Ok(finalised)
    }

    /// The held-back row, finalised at the end of the run.
    pub fn take_pending(&mut self) -> Option<Vec<ChannelValue>> {
        self.pending.take()
    }

    /// All retained rows (full-storage mode only).
    pub fn rows(&self) -> &[Vec<ChannelValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::ChannelType;

    fn storage_with_one_channel(keep_rows: bool) -> (ChannelStorage, ValueCell) {
        let mut storage = ChannelStorage::new(keep_rows);
        let cell = ValueCell::double(0.0);
        storage
            .register_channel(
                PortInfo::new("y", ChannelType::Double, "e.y"),
                cell.clone(),
            )
            .unwrap();
        (storage, cell)
    }

    #[test]
    fn test_rows_sample_cells() {
        let (mut storage, cell) = storage_with_one_channel(true);
        cell.set_double(1.5).unwrap();
        storage.store(0.0).unwrap();
        cell.set_double(2.5).unwrap();
        storage.store(0.1).unwrap();

        assert_eq!(storage.len(), 2);
        assert_eq!(storage.rows()[0][0], ChannelValue::Double(0.0));
        assert_eq!(storage.rows()[0][1], ChannelValue::Double(1.5));
        assert_eq!(storage.rows()[1][1], ChannelValue::Double(2.5));
    }

    #[test]
    fn test_same_time_overwrites() {
        let (mut storage, cell) = storage_with_one_channel(true);
        cell.set_double(1.0).unwrap();
        storage.store(0.1).unwrap();
        cell.set_double(9.0).unwrap();
        storage.store(0.1).unwrap();

        assert_eq!(storage.len(), 1);
        assert_eq!(storage.rows()[0][1], ChannelValue::Double(9.0));
    }

    #[test]
    fn test_streaming_finalises_previous_row() {
        let (mut storage, cell) = storage_with_one_channel(false);
        cell.set_double(1.0).unwrap();
        assert!(storage.store(0.0).unwrap().is_none());
        cell.set_double(2.0).unwrap();
        // same time: the pending row is replaced, nothing finalised
        assert!(storage.store(0.0).unwrap().is_none());
        cell.set_double(3.0).unwrap();
        let finalised = storage.store(0.1).unwrap().unwrap();
        assert_eq!(finalised[1], ChannelValue::Double(2.0));
        let pending = storage.take_pending().unwrap();
        assert_eq!(pending[1], ChannelValue::Double(3.0));
    }

    #[test]
    fn test_no_registration_after_store() {
        let (mut storage, _cell) = storage_with_one_channel(true);
        storage.store(0.0).unwrap();
        let result = storage.register_channel(
            PortInfo::new("late", ChannelType::Double, "e.late"),
            ValueCell::double(0.0),
        );
        assert!(result.is_err());
    }
}
