//! The backend contract: backends receive fully rendered rows per
//! element and channel class and own their on-disk encoding.

use crate::core::error::Result;
use crate::core::port::PortInfo;
use crate::core::value::ChannelValue;
use crate::storage::component_storage::ChannelClass;

pub trait Backend: Send {
    fn name(&self) -> &'static str;

    /// Whether rows are handed over as they are stored (streaming) or
    /// once at the end of the run (full storage).
    fn store_at_runtime(&self) -> bool;

    /// Announce the channels of one `(element, class)` pair. Called
    /// once per pair before any row arrives; the time column is *not*
    /// part of `infos`.
    fn setup_component(
        &mut self,
        component: usize,
        component_name: &str,
        class: ChannelClass,
        infos: &[PortInfo],
    ) -> Result<()>;

    /// One complete row; `row[0]` is the time value.
    fn store_row(&mut self, component: usize, class: ChannelClass, row: &[ChannelValue]) -> Result<()>;

    /// Finalise all outputs. Always called, also when the run aborted.
    fn finish(&mut self) -> Result<()>;
}
