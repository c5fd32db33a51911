//! Directed edges between an output port and an input port.
//!
//! A connection is owned by the source port's outgoing list; the target
//! port holds a non-owning handle for lookup. Endpoints are carried as
//! element/port indices, so the connection never points back into the
//! databuses. The transported value and the filter live behind one lock
//! so that the source side (writing samples) and the target side
//! (reconstructing values) can run on different driver threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::error::{Result, SimbusError};
use crate::core::filter::{ConnectionMode, Filter};
use crate::core::value::{ChannelType, ChannelValue};

/// Whether a connection may be selected for breaking algebraic loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecouplePolicy {
    Never,
    IfNeeded(i32),
    Always,
}

impl DecouplePolicy {
    pub fn priority(&self) -> Option<i32> {
        match self {
            DecouplePolicy::IfNeeded(p) => Some(*p),
            _ => None,
        }
    }
}

/// Declared inter-/extrapolation orders of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterExtraParams {
    pub interpolation_order: usize,
    pub extrapolation_order: usize,
}

impl Default for InterExtraParams {
    fn default() -> Self {
        Self {
            interpolation_order: 0,
            extrapolation_order: 0,
        }
    }
}

/// How the filter reconstructs values for the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterExtraKind {
    Interpolating,
    Extrapolating,
    InterExtrapolating,
}

/// Resolve the declared kind against the orders: interpolation always
/// needs an extrapolation stage for times past the read window, and
/// differing orders force the combined filter.
pub fn resolve_inter_extra_kind(initial: InterExtraKind, params: &InterExtraParams) -> InterExtraKind {
    match initial {
        InterExtraKind::Extrapolating
            if params.extrapolation_order != params.interpolation_order =>
        {
            InterExtraKind::InterExtrapolating
        }
        InterExtraKind::Interpolating => InterExtraKind::InterExtrapolating,
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionEndpoints {
    pub source_element: usize,
    pub source_port: usize,
    pub target_element: usize,
    pub target_port: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub endpoints: ConnectionEndpoints,
    /// `element.port` names for log messages.
    pub source_name: String,
    pub target_name: String,
    pub decouple: DecouplePolicy,
    /// Type of the source output port; the transported value keeps it.
    pub channel_type: ChannelType,
    pub source_unit: Option<String>,
    /// Whether polynomial inter-/extrapolation was declared.
    pub polynomial: bool,
    pub inter_extra: InterExtraParams,
    pub kind: InterExtraKind,
    /// Own time step of the source element, 0 when stepping with the
    /// synchronisation step.
    pub source_time_step: f64,
    pub target_time_step: f64,
}

impl ConnectionInfo {
    pub fn connection_string(&self) -> String {
        format!("{} -> {}", self.source_name, self.target_name)
    }
}

struct ConnState {
    mode: ConnectionMode,
    filter: Option<Filter>,
    store: ChannelValue,
    source_fn: Option<Arc<dyn Fn(f64) -> f64 + Send + Sync>>,
    use_initial_value: bool,
    defined_during_init: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info.connection_string())
            .field("decoupled", &self.is_decoupled())
            .finish()
    }
}

impl std::fmt::Debug for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnState")
            .field("mode", &self.mode)
            .field("store", &self.store)
            .finish()
    }
}

pub struct Connection {
    info: ConnectionInfo,
    decoupled: AtomicBool,
    active_dependency: AtomicBool,
    state: Mutex<ConnState>,
}

impl Connection {
    pub fn new(info: ConnectionInfo, source_fn: Option<Arc<dyn Fn(f64) -> f64 + Send + Sync>>) -> Self {
        let store = ChannelValue::zero(info.channel_type);
        // `Always` forces decoupling at setup
        let decoupled = matches!(info.decouple, DecouplePolicy::Always);
        Self {
            info,
            decoupled: AtomicBool::new(decoupled),
            active_dependency: AtomicBool::new(true),
            state: Mutex::new(ConnState {
                mode: ConnectionMode::Communication,
                filter: None,
                store,
                source_fn,
                use_initial_value: false,
                defined_during_init: false,
            }),
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn is_decoupled(&self) -> bool {
        self.decoupled.load(Ordering::Relaxed)
    }

    pub fn set_decoupled(&self) {
        self.decoupled.store(true, Ordering::Relaxed);
    }

    pub fn is_active_dependency(&self) -> bool {
        self.active_dependency.load(Ordering::Relaxed)
    }

    pub fn set_active_dependency(&self, active: bool) {
        self.active_dependency.store(active, Ordering::Relaxed);
    }

    pub fn is_defined_during_init(&self) -> bool {
        self.state.lock().defined_during_init
    }

    /// Attach the filter once the model is fully wired. Which filter
    /// depends on the transported type, the declared orders and whether
    /// the connection ended up decoupled.
    pub fn add_filter(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.filter.is_some() {
            debug!("connection {}: not inserting filter", self.info.connection_string());
            return Ok(());
        }

        let filter = if self.info.channel_type == ChannelType::Double {
            if self.info.polynomial {
                let mut kind = self.info.kind;
                if kind == InterExtraKind::Interpolating && self.is_decoupled() {
                    kind = InterExtraKind::InterExtrapolating;
                }

                let params = &self.info.inter_extra;
                match kind {
                    InterExtraKind::InterExtrapolating => {
                        debug!(
                            "connection {}: dynamic filter, interpolation order {}, extrapolation order {}",
                            self.info.connection_string(),
                            params.interpolation_order,
                            params.extrapolation_order
                        );
                        Filter::inter_extrapolating(
                            params.interpolation_order,
                            params.extrapolation_order,
                        )?
                    }
                    InterExtraKind::Extrapolating => {
                        debug!(
                            "connection {}: extrapolation filter, order {}",
                            self.info.connection_string(),
                            params.extrapolation_order
                        );
                        Filter::extrapolating(params.extrapolation_order)
                    }
                    InterExtraKind::Interpolating => {
                        debug!(
                            "connection {}: interpolation filter, order {}",
                            self.info.connection_string(),
                            params.interpolation_order
                        );
                        Filter::interpolating(params.interpolation_order)?
                    }
                }
            } else {
                Filter::extrapolating(0)
            }
        } else {
            if self.info.polynomial && self.info.inter_extra != InterExtraParams::default() {
                warn!(
                    "connection {}: invalid inter/extrapolation settings for non-double connection",
                    self.info.connection_string()
                );
            }
            debug!(
                "connection {}: constant synchronisation-step extrapolation for non-double connection",
                self.info.connection_string()
            );
            Filter::discrete(self.info.channel_type)
        };

        state.filter = Some(filter);
        Ok(())
    }

    /// The transported value as the target currently sees it.
    pub fn current_value(&self) -> ChannelValue {
        self.state.lock().store.clone()
    }

    /// New value from the source port at `time`.
    ///
    /// In initialization mode the value lands directly in the store
    /// (unless an explicit initial value pins it); otherwise it is
    /// staged as a filter sample. Negative time disables filtering.
    pub fn update_from_input(&self, time: f64, value: &ChannelValue) -> Result<()> {
        let mut state = self.state.lock();
        match state.mode {
            ConnectionMode::Initialization => {
                if !state.use_initial_value {
                    state.store.set_from(value)?;
                }
                state.defined_during_init = true;
                Ok(())
            }
            mode => {
                if time >= 0.0 {
                    if let Some(filter) = state.filter.as_mut() {
                        filter.set_value(mode, time, value)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Reconstruct the transported value for the target at `time`.
    pub fn update_to_output(&self, time: f64) -> Result<()> {
        let mut state = self.state.lock();
        match state.mode {
            ConnectionMode::Initialization => Ok(()),
            _ => {
                if let Some(f) = state.source_fn.clone() {
                    let val = f(time);
                    return state.store.set_from(&ChannelValue::Double(val));
                }
                if time >= 0.0 {
                    if let Some(mut filter) = state.filter.take() {
                        let val = filter.get_value(time);
                        state.filter = Some(filter);
                        return state.store.set_from(&val);
                    }
                }
                Ok(())
            }
        }
    }

    pub fn enter_coupling_step(&self, sync_step_size: f64) -> Result<()> {
        let mut state = self.state.lock();
        let mode = state.mode;
        if let Some(filter) = state.filter.as_mut() {
            filter.enter_coupling_step(
                mode,
                sync_step_size,
                self.info.source_time_step,
                self.info.target_time_step,
            )?;
        }
        state.mode = ConnectionMode::CouplingStep;
        Ok(())
    }

    pub fn enter_communication(&self, time: f64) -> Result<()> {
        let mut state = self.state.lock();
        let mode = state.mode;
        if let Some(filter) = state.filter.as_mut() {
            filter.enter_communication(mode, time)?;
        }
        state.mode = ConnectionMode::Communication;
        Ok(())
    }

    /// Redirect value flow to the connection's own store.
    pub fn enter_initialization(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.mode == ConnectionMode::Initialization {
            return Err(SimbusError::Connection(format!(
                "connection {}: enter initialization mode: called multiple times",
                self.info.connection_string()
            )));
        }
        state.mode = ConnectionMode::Initialization;
        Ok(())
    }

    /// Resolve the initial value: the target port's initial value wins
    /// (converted to the transported type), then the source port's,
    /// else the store stays the zero of the type with a warning.
    pub fn update_initial_value(
        &self,
        target_initial: Option<&ChannelValue>,
        source_initial: Option<&ChannelValue>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.mode != ConnectionMode::Initialization {
            return Err(SimbusError::Connection(format!(
                "connection {}: update initial value: \
                 cannot update initial value outside of initialization mode",
                self.info.connection_string()
            )));
        }

        if let Some(initial) = target_initial {
            let mut value = initial.clone();
            if value.channel_type() != state.store.channel_type() {
                let conversion = crate::core::conversion::TypeConversion::new(
                    value.channel_type(),
                    state.store.channel_type(),
                )
                .map_err(|e| {
                    SimbusError::Connection(format!(
                        "connection {}: could not set up initial type conversion: {e}",
                        self.info.connection_string()
                    ))
                })?;
                conversion.apply(&mut value)?;
            }
            state.store.set_from(&value)?;
            state.use_initial_value = true;
        } else if let Some(initial) = source_initial {
            state.store.set_from(initial)?;
            state.use_initial_value = true;
        } else {
            warn!(
                "connection {}: no initial values are specified for the ports of the connection",
                self.info.connection_string()
            );
            let ty = state.store.channel_type();
            state.store = ChannelValue::zero(ty);
        }

        Ok(())
    }

    /// Leave initialization mode at `time`: after initialization all
    /// values count as defined, the source's value seeds the filter and
    /// the connection enters communication mode.
    pub fn exit_initialization(&self, time: f64, source_value: &ChannelValue) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.mode != ConnectionMode::Initialization {
                return Err(SimbusError::Connection(format!(
                    "connection {}: exit initialization mode: called multiple times",
                    self.info.connection_string()
                )));
            }
            state.defined_during_init = true;
            state.use_initial_value = false;
            // back to normal value flow before seeding the filter
            state.mode = ConnectionMode::CouplingStep;

            let seed = state.store.clone();
            let value = if self.is_decoupled() {
                // the target reads the resolved initial value first
                seed
            } else {
                source_value.clone()
            };
            if let Some(filter) = state.filter.as_mut() {
                filter.set_value(ConnectionMode::CouplingStep, time, &value)?;
            }
            state.store.set_from(&value)?;
        }
        self.enter_communication(time)?;
        Ok(())
    }

    /// Log decoupling of this connection during loop breaking.
    pub fn log_decoupled(&self) {
        info!("decoupling connection {}", self.info.connection_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info(decouple: DecouplePolicy) -> ConnectionInfo {
        ConnectionInfo {
            endpoints: ConnectionEndpoints {
                source_element: 0,
                source_port: 0,
                target_element: 1,
                target_port: 0,
            },
            source_name: "a.out".into(),
            target_name: "b.in".into(),
            decouple,
            channel_type: ChannelType::Double,
            source_unit: None,
            polynomial: false,
            inter_extra: InterExtraParams::default(),
            kind: InterExtraKind::Extrapolating,
            source_time_step: 0.0,
            target_time_step: 0.0,
        }
    }

    #[test]
    fn test_always_decouples_at_setup() {
        let conn = Connection::new(test_info(DecouplePolicy::Always), None);
        assert!(conn.is_decoupled());
        let conn = Connection::new(test_info(DecouplePolicy::Never), None);
        assert!(!conn.is_decoupled());
    }

    #[test]
    fn test_value_flow_through_filter() {
        let conn = Connection::new(test_info(DecouplePolicy::Never), None);
        conn.add_filter().unwrap();

        conn.enter_coupling_step(0.1).unwrap();
        conn.update_from_input(0.0, &ChannelValue::Double(7.5)).unwrap();
        conn.enter_communication(0.0).unwrap();

        conn.update_to_output(0.05).unwrap();
        assert_eq!(conn.current_value(), ChannelValue::Double(7.5));
    }

    #[test]
    fn test_initialization_redirects_to_store() {
        let conn = Connection::new(test_info(DecouplePolicy::Never), None);
        conn.add_filter().unwrap();
        conn.enter_initialization().unwrap();
        conn.update_initial_value(None, Some(&ChannelValue::Double(2.0)))
            .unwrap();
        // the initial value pins the store against later writes
        conn.update_from_input(0.0, &ChannelValue::Double(9.0)).unwrap();
        assert_eq!(conn.current_value(), ChannelValue::Double(2.0));

        conn.exit_initialization(0.0, &ChannelValue::Double(9.0)).unwrap();
        conn.update_to_output(0.0).unwrap();
        assert_eq!(conn.current_value(), ChannelValue::Double(9.0));
    }

    #[test]
    fn test_initial_value_type_converted() {
        let conn = Connection::new(test_info(DecouplePolicy::Never), None);
        conn.enter_initialization().unwrap();
        conn.update_initial_value(Some(&ChannelValue::Integer(3)), None)
            .unwrap();
        assert_eq!(conn.current_value(), ChannelValue::Double(3.0));
    }

    #[test]
    fn test_enter_initialization_twice_fails() {
        let conn = Connection::new(test_info(DecouplePolicy::Never), None);
        conn.enter_initialization().unwrap();
        assert!(conn.enter_initialization().is_err());
    }

    #[test]
    fn test_function_source_bypasses_filter() {
        let conn = Connection::new(
            test_info(DecouplePolicy::Never),
            Some(Arc::new(|t| 3.0 * t)),
        );
        conn.add_filter().unwrap();
        conn.update_to_output(2.0).unwrap();
        assert_eq!(conn.current_value(), ChannelValue::Double(6.0));
    }

    #[test]
    fn test_decoupled_exit_seeds_initial_value() {
        let conn = Connection::new(test_info(DecouplePolicy::Always), None);
        conn.add_filter().unwrap();
        conn.enter_initialization().unwrap();
        conn.update_initial_value(Some(&ChannelValue::Double(1.5)), None)
            .unwrap();
        conn.exit_initialization(0.0, &ChannelValue::Double(99.0)).unwrap();
        // the first communication point reads the initial value
        conn.update_to_output(0.0).unwrap();
        assert_eq!(conn.current_value(), ChannelValue::Double(1.5));
    }
}
