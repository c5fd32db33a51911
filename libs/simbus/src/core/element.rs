//! The element contract and its runtime harness.
//!
//! An [`Element`] implements the behaviour of one simulation unit; the
//! [`ElementHarness`] owns everything around it: the databus, the
//! result storage, per-element time state, finish state, input
//! evaluation flags and real-time-factor accounting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::core::compare::{double_cmp, double_geq};
use crate::core::databus::{Databus, TimeInterval};
use crate::core::dependency::DependencyMatrix;
use crate::core::error::{Result, SimbusError};
use crate::core::throttle::{Emission, RepeatLimiter};
use crate::core::value::{ChannelType, ValueCell};
use crate::storage::{BackendHub, ChannelClass, ComponentStorage, StorageGates, StoreLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishState {
    NotFinished,
    Finished,
}

/// Why the simulation is finishing, handed to every element's
/// `finish` hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinishInfo {
    pub a_component_finished: bool,
    pub stop_if_first_component_finished: bool,
    pub error_occurred: bool,
}

/// Behaviour of one simulation unit.
///
/// `setup` must bind the element's state cells to its ports via
/// [`Databus::set_in_reference`] / [`Databus::set_out_reference`].
pub trait Element: Send {
    /// Bind state references to ports.
    fn setup(&mut self, databus: &mut Databus) -> Result<()>;

    /// Reset internal state for a run starting at `start_time`. Inputs
    /// have been evaluated when this is called.
    fn initialize(&mut self, start_time: f64) -> Result<()>;

    fn exit_initialization(&mut self) -> Result<()> {
        Ok(())
    }

    /// Advance internal state over `[start, end]`.
    fn do_step(
        &mut self,
        databus: &mut Databus,
        start: f64,
        step_size: f64,
        end: f64,
        is_new_step: bool,
    ) -> Result<()>;

    /// Whether the pre/post step hooks do anything; gates the extra
    /// input evaluation around them.
    fn uses_step_update_hooks(&self) -> bool {
        false
    }

    /// Work that must run single-threaded before the step.
    fn pre_step_update(&mut self, _time: f64, _step_size: f64) -> Result<()> {
        Ok(())
    }

    /// Work that must run single-threaded after the step.
    fn post_step_update(&mut self, _time: f64, _step_size: f64) -> Result<()> {
        Ok(())
    }

    /// Recompute derived output cells before outputs are sampled.
    fn update_out_channels(&mut self) -> Result<()> {
        Ok(())
    }

    /// React to freshly evaluated inputs.
    fn update_in_channels(&mut self) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, _info: &FinishInfo) -> Result<()> {
        Ok(())
    }

    fn write_debug_info_after_simulation(&mut self) -> Result<()> {
        Ok(())
    }

    /// Whether the element has decided to end the simulation for
    /// itself (e.g. a source ran out of data).
    fn is_finished(&self) -> bool {
        false
    }

    /// Steady-loop dependencies of the (single) runtime out group on
    /// each input. The default is fully dependent.
    fn dependency_matrix(&self, num_in: usize, num_out_groups: usize) -> DependencyMatrix {
        DependencyMatrix::all_dependent(num_in, num_out_groups)
    }

    /// Initialisation-time dependencies, one out group per output
    /// port. `None` falls back to [`Element::dependency_matrix`].
    fn initial_dependency_matrix(
        &self,
        _num_in: usize,
        _num_out_groups: usize,
    ) -> Option<DependencyMatrix> {
        None
    }
}

/// Wall-clock accounting per element. The six cells back the RT-factor
/// result channels.
#[derive(Debug)]
pub struct RtFactorData {
    /// Wall time since the start of the run ("RealTime Clock").
    pub sim_time_total: ValueCell,
    /// Busy wall time of this element's steps ("RealTime Clock Calc").
    pub sim_time: ValueCell,
    /// Busy wall time over simulated time of the current
    /// synchronisation step ("RealTime Factor Calc").
    pub rt_factor: ValueCell,
    /// Busy wall time over simulated time since start
    /// ("RealTime Factor Calc (Avg)").
    pub rt_factor_avg: ValueCell,
    /// All wall time over simulated time of the current
    /// synchronisation step ("RealTime Factor").
    pub total_rt_factor: ValueCell,
    /// All wall time over simulated time since start
    /// ("RealTime Factor (Avg)").
    pub total_rt_factor_avg: ValueCell,

    start_wall: Instant,
    last_step_wall: Instant,
    last_comm_step_wall: Instant,
    busy_total: Duration,
    busy_step: Duration,
    comm_time: f64,
    start_time: f64,
}

impl RtFactorData {
    fn new(start_time: f64) -> Self {
        let now = Instant::now();
        Self {
            sim_time_total: ValueCell::double(0.0),
            sim_time: ValueCell::double(0.0),
            rt_factor: ValueCell::double(0.0),
            rt_factor_avg: ValueCell::double(0.0),
            total_rt_factor: ValueCell::double(0.0),
            total_rt_factor_avg: ValueCell::double(0.0),
            start_wall: now,
            last_step_wall: now,
            last_comm_step_wall: now,
            busy_total: Duration::ZERO,
            busy_step: Duration::ZERO,
            comm_time: 0.0,
            start_time,
        }
    }

    /// Reset the per-communication-step accumulators.
    fn enter_communication_point(&mut self) {
        self.busy_step = Duration::ZERO;
        self.comm_time = 0.0;
        self.last_comm_step_wall = self.last_step_wall;
    }

    /// Fold one step's wall-clock cost into the statistics.
    fn account_step(&mut self, step_wall: Duration, sim_from: f64, sim_to: f64) -> Result<()> {
        let now = Instant::now();
        let total_elapsed = now.duration_since(self.last_comm_step_wall);
        let since_start = now.duration_since(self.start_wall);
        self.last_step_wall = now;

        self.busy_total += step_wall;
        self.busy_step += step_wall;
        self.comm_time += sim_to - sim_from;

        let elapsed_sim = sim_to - self.start_time;

        self.sim_time.set_double(self.busy_total.as_secs_f64())?;
        self.sim_time_total.set_double(since_start.as_secs_f64())?;
        self.rt_factor
            .set_double(self.busy_step.as_secs_f64() / self.comm_time)?;
        self.rt_factor_avg
            .set_double(self.busy_total.as_secs_f64() / elapsed_sim)?;
        self.total_rt_factor
            .set_double(total_elapsed.as_secs_f64() / self.comm_time)?;
        self.total_rt_factor_avg
            .set_double(since_start.as_secs_f64() / elapsed_sim)?;
        Ok(())
    }
}

/// Runtime wrapper around one element.
pub struct ElementHarness {
    name: String,
    id: usize,
    /// Declaration order in the model file; loop breaking prefers to
    /// cut connections running against it.
    sequence_number: i32,
    element: Box<dyn Element>,
    databus: Databus,
    storage: ComponentStorage,

    time: f64,
    time_step: f64,
    has_own_time: bool,
    sum_time: bool,
    num_steps: u64,
    finish_state: FinishState,

    use_inputs_at_end_time: bool,
    store_inputs_at_end_time: Option<bool>,

    rt: Option<RtFactorData>,
    snap_warnings: RepeatLimiter,
    initialized: bool,
}

impl ElementHarness {
    pub fn new(
        name: impl Into<String>,
        id: usize,
        sequence_number: i32,
        element: Box<dyn Element>,
        databus: Databus,
    ) -> Self {
        let name = name.into();
        let storage = ComponentStorage::disabled(&name);
        Self {
            name,
            id,
            sequence_number,
            element,
            databus,
            storage,
            time: 0.0,
            time_step: 0.0,
            has_own_time: false,
            sum_time: false,
            num_steps: 0,
            finish_state: FinishState::NotFinished,
            use_inputs_at_end_time: false,
            store_inputs_at_end_time: None,
            rt: None,
            snap_warnings: RepeatLimiter::new(10),
            initialized: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn sequence_number(&self) -> i32 {
        self.sequence_number
    }

    pub fn databus(&self) -> &Databus {
        &self.databus
    }

    pub fn databus_mut(&mut self) -> &mut Databus {
        &mut self.databus
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    /// Number of element steps taken so far.
    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }

    /// Give the element its own time: it advances in steps of
    /// `time_step` rather than the synchronisation step.
    pub fn set_own_time_step(&mut self, time_step: f64) -> Result<()> {
        if time_step <= 0.0 {
            return Err(SimbusError::Config(format!(
                "[{}] illegal own time step {time_step}",
                self.name
            )));
        }
        self.has_own_time = true;
        self.time_step = time_step;
        Ok(())
    }

    pub fn has_own_time(&self) -> bool {
        self.has_own_time
    }

    pub fn set_sum_time(&mut self, sum_time: bool) {
        self.sum_time = sum_time;
    }

    pub fn finish_state(&self) -> FinishState {
        self.finish_state
    }

    pub fn set_finished(&mut self) {
        self.finish_state = FinishState::Finished;
    }

    pub fn use_inputs_at_end_time(&self) -> bool {
        self.use_inputs_at_end_time
    }

    pub fn set_use_inputs_at_end_time(&mut self, flag: bool) {
        self.use_inputs_at_end_time = flag;
        if self.store_inputs_at_end_time.is_none() {
            self.store_inputs_at_end_time = Some(flag);
        }
    }

    pub fn store_inputs_at_end_time(&self) -> Result<bool> {
        self.store_inputs_at_end_time.ok_or_else(|| {
            SimbusError::Config(format!(
                "[{}] storeInputsAtCouplingStepEndTime undefined",
                self.name
            ))
        })
    }

    pub fn set_max_time_snap_warnings(&mut self, max: usize) {
        self.snap_warnings = RepeatLimiter::new(max);
    }

    /// Let the element bind its references; add the RT-factor channels
    /// when timing output is requested.
    pub fn setup(&mut self, rt_factor_enabled: bool, start_time: f64) -> Result<()> {
        self.element.setup(&mut self.databus)?;

        if rt_factor_enabled {
            let rt = RtFactorData::new(start_time);
            let channels: [(&str, Option<&str>, &ValueCell); 6] = [
                ("RealTime Clock", Some("s"), &rt.sim_time_total),
                ("RealTime Clock Calc", Some("s"), &rt.sim_time),
                ("RealTime Factor Calc", Some("-"), &rt.rt_factor),
                ("RealTime Factor Calc (Avg)", Some("-"), &rt.rt_factor_avg),
                ("RealTime Factor", Some("-"), &rt.total_rt_factor),
                ("RealTime Factor (Avg)", Some("-"), &rt.total_rt_factor_avg),
            ];
            for (channel_name, unit, cell) in channels {
                let id = format!("{}.{channel_name}", self.name);
                self.databus.add_rt_factor_channel(
                    channel_name,
                    &id,
                    unit,
                    (*cell).clone(),
                    ChannelType::Double,
                )?;
            }
            self.rt = Some(rt);
        }

        Ok(())
    }

    /// Configure this element's result storage against the shared hub
    /// and register every storable channel.
    pub fn register_storage(
        &mut self,
        hub: Arc<BackendHub>,
        gates: &StorageGates,
        sync_step: f64,
    ) -> Result<()> {
        let component = hub.register_component();
        let coupling_step = if self.has_own_time { self.time_step } else { 0.0 };
        self.storage
            .setup(component, hub, gates, sync_step, coupling_step)?;

        if !self.storage.is_enabled() {
            return Ok(());
        }

        for i in 0..self.databus.num_in_channels() {
            let info = self.databus.in_info().info(i).expect("index in range").clone();
            let cell = self.databus.input(i).expect("index in range").value_cell().clone();
            self.storage.register_channel(ChannelClass::In, &info, cell)?;
        }
        for i in 0..self.databus.num_out_channels() {
            let info = self.databus.out_info().info(i).expect("index in range").clone();
            let cell = self.databus.output(i).expect("index in range").value_cell().clone();
            self.storage.register_channel(ChannelClass::Out, &info, cell)?;
        }
        for i in 0..self.databus.num_local_channels() {
            let info = self.databus.local_info().info(i).expect("index in range").clone();
            let cell = self.databus.local(i).expect("index in range").value_cell().clone();
            self.storage.register_channel(ChannelClass::Local, &info, cell)?;
        }
        for i in 0..self.databus.num_rt_factor_channels() {
            let info = self.databus.rt_info().info(i).expect("index in range").clone();
            let cell = self.databus.rt_port(i).expect("index in range").value_cell().clone();
            self.storage.register_channel(ChannelClass::RtFactor, &info, cell)?;
        }

        self.storage.setup_backends()
    }

    pub fn store(&mut self, class: ChannelClass, time: f64, level: StoreLevel) -> Result<()> {
        self.storage.store_channels(class, time, level)
    }

    pub fn storage_finished(&mut self) -> Result<()> {
        self.storage.finished()
    }

    pub fn initialize(&mut self, start_time: f64) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        self.time = start_time;
        self.element.initialize(start_time)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn exit_initialization(&mut self) -> Result<()> {
        self.element.exit_initialization()
    }

    pub fn uses_step_update_hooks(&self) -> bool {
        self.element.uses_step_update_hooks()
    }

    pub fn pre_step_update(&mut self, time: f64, step_size: f64) -> Result<()> {
        self.element.pre_step_update(time, step_size)
    }

    pub fn post_step_update(&mut self, time: f64, step_size: f64) -> Result<()> {
        self.element.post_step_update(time, step_size)
    }

    pub fn update_in_channels(&mut self) -> Result<()> {
        self.element.update_in_channels()
    }

    pub fn finish(&mut self, info: &FinishInfo) -> Result<()> {
        self.element.finish(info)?;
        self.element.write_debug_info_after_simulation()
    }

    pub fn dependency_matrix(&self) -> DependencyMatrix {
        self.element
            .dependency_matrix(self.databus.num_in_channels(), self.num_out_groups())
    }

    pub fn initial_dependency_matrix(&self) -> DependencyMatrix {
        self.element
            .initial_dependency_matrix(
                self.databus.num_in_channels(),
                self.num_initial_out_groups(),
            )
            .unwrap_or_else(|| {
                DependencyMatrix::all_dependent(
                    self.databus.num_in_channels(),
                    self.num_initial_out_groups(),
                )
            })
    }

    /// In the steady loop all outputs of an element form one group.
    pub fn num_out_groups(&self) -> usize {
        1
    }

    pub fn out_group_of(&self, _out_channel: usize) -> usize {
        0
    }

    /// At initialisation each output port is its own group.
    pub fn num_initial_out_groups(&self) -> usize {
        self.databus.num_out_channels()
    }

    pub fn initial_out_group_of(&self, out_channel: usize) -> usize {
        out_channel
    }

    /// Advance the element over `[start, end]` and update time and
    /// RT-factor accounting.
    pub fn do_step(
        &mut self,
        start: f64,
        step_size: f64,
        end: f64,
        is_new_step: bool,
    ) -> Result<()> {
        let rt_enabled = self.rt.is_some();
        let (sim_from, wall_start) = (self.time, rt_enabled.then(Instant::now));

        debug!("[{}] do step: {start:.16} -> {end:.16}", self.name);

        self.element
            .do_step(&mut self.databus, start, step_size, end, is_new_step)
            .map_err(|e| {
                debug!("[{}] element specific step failed", self.name);
                e
            })?;

        self.num_steps += 1;

        if self.has_own_time {
            self.update_time();

            // avoid inter/extrapolation within the epsilon range: if the
            // element time is that close to the overall time, snap to it
            let element_time = self.time;
            if element_time != end && double_cmp(element_time, end) == Some(std::cmp::Ordering::Equal)
            {
                match self.snap_warnings.next() {
                    Emission::Emit => {
                        debug!(
                            "[{}] updating the time from {element_time:.17e} s to {end:.17e} s",
                            self.name
                        );
                    }
                    Emission::EmitLast => {
                        debug!(
                            "[{}] updating the time from {element_time:.17e} s to {end:.17e} s",
                            self.name
                        );
                        debug!("[{}] this warning will not be shown anymore", self.name);
                    }
                    Emission::Suppress => {}
                }
                self.time = end;
            }
        } else {
            self.time = end;
        }

        if let Some(wall_start) = wall_start {
            let step_wall = wall_start.elapsed();
            let sim_to = self.time;
            if let Some(rt) = self.rt.as_mut() {
                rt.account_step(step_wall, sim_from, sim_to)?;
            }
        }

        if self.element.is_finished() {
            self.finish_state = FinishState::Finished;
        }

        Ok(())
    }

    fn update_time(&mut self) {
        if self.sum_time || self.has_own_time {
            self.time += self.time_step;
        } else {
            self.time = self.num_steps as f64 * self.time_step;
        }
    }

    /// Run the element's output hook and sample all output ports. An
    /// element with its own time publishes at its own time.
    pub fn update_out_channels(&mut self, interval: &TimeInterval) -> Result<()> {
        self.element.update_out_channels()?;

        let own = TimeInterval::point(self.time);
        let interval = if self.has_own_time { &own } else { interval };
        self.databus.trigger_out_channels(interval).map_err(|e| {
            warn!(
                "[{}] updating outports to time interval [{} s, {} s] failed",
                self.name, interval.start, interval.end
            );
            e
        })
    }

    /// Promote all outgoing connections to communication mode and
    /// publish the outputs of this synchronisation point.
    pub fn enter_communication_point(&mut self, interval: &TimeInterval) -> Result<()> {
        if let Some(rt) = self.rt.as_mut() {
            rt.enter_communication_point();
        }
        self.databus.enter_communication(interval.start).map_err(|e| {
            warn!(
                "[{}] cannot enter communication mode at time {:.17} s",
                self.name, interval.start
            );
            e
        })?;
        self.update_out_channels(interval)
    }

    /// Check whether the element has advanced past `time` (with the
    /// global epsilon), i.e. its synchronisation step is complete.
    pub fn reached(&self, time: f64) -> bool {
        double_geq(self.time, time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::databus::DatabusInfo;
    use crate::core::port::{NanCheck, PortInfo};

    struct Clockwork {
        ticks: ValueCell,
    }

    impl Element for Clockwork {
        fn setup(&mut self, databus: &mut Databus) -> Result<()> {
            databus.set_out_reference(0, self.ticks.clone(), ChannelType::Double)
        }

        fn initialize(&mut self, _start_time: f64) -> Result<()> {
            self.ticks.set_double(0.0)
        }

        fn do_step(
            &mut self,
            _databus: &mut Databus,
            _start: f64,
            _step_size: f64,
            _end: f64,
            _is_new_step: bool,
        ) -> Result<()> {
            let t = self.ticks.get_double()?;
            self.ticks.set_double(t + 1.0)
        }
    }

    fn harness() -> ElementHarness {
        let out_infos = vec![PortInfo::new("ticks", ChannelType::Double, "clock.ticks")];
        let databus = Databus::setup(
            DatabusInfo::default(),
            DatabusInfo::new(out_infos, Vec::new()),
            NanCheck::Always,
            0,
        )
        .unwrap();
        let element = Box::new(Clockwork {
            ticks: ValueCell::double(0.0),
        });
        ElementHarness::new("clock", 0, 0, element, databus)
    }

    #[test]
    fn test_setup_without_rt_adds_no_channels() {
        let mut h = harness();
        h.setup(false, 0.0).unwrap();
        assert_eq!(h.databus().num_rt_factor_channels(), 0);
    }

    #[test]
    fn test_setup_with_rt_adds_six_channels() {
        let mut h = harness();
        h.setup(true, 0.0).unwrap();
        assert_eq!(h.databus().num_rt_factor_channels(), 6);
        assert_eq!(
            h.databus().rt_info().info(0).unwrap().name,
            "RealTime Clock"
        );
    }

    #[test]
    fn test_step_advances_to_end_time() {
        let mut h = harness();
        h.setup(false, 0.0).unwrap();
        h.initialize(0.0).unwrap();
        h.do_step(0.0, 0.1, 0.1, true).unwrap();
        assert_eq!(h.time(), 0.1);
    }

    #[test]
    fn test_own_time_snaps_to_end() {
        let mut h = harness();
        h.setup(false, 0.0).unwrap();
        h.initialize(0.0).unwrap();
        // three steps of 0.1/3 accumulate rounding error against 0.1
        h.set_own_time_step(0.1 / 3.0).unwrap();
        h.do_step(0.0, 0.1 / 3.0, 0.1, true).unwrap();
        h.do_step(h.time(), 0.1 / 3.0, 0.1, false).unwrap();
        h.do_step(h.time(), 0.1 / 3.0, 0.1, false).unwrap();
        assert_eq!(h.time(), 0.1);
    }

    #[test]
    fn test_own_time_step_must_be_positive() {
        let mut h = harness();
        assert!(h.set_own_time_step(0.0).is_err());
        assert!(h.set_own_time_step(-0.1).is_err());
    }

    #[test]
    fn test_store_inputs_flag_undefined_errors() {
        let h = harness();
        assert!(h.store_inputs_at_end_time().is_err());
    }
}
