//! Sampled-signal filters between a source output and a target input.
//!
//! A filter collects `(time, value)` samples as the source side steps
//! (`set_value`) and reconstructs the signal when the target side
//! evaluates its inputs (`get_value`). The mode of the hosting
//! connection decides what a write means: samples arriving during
//! coupling steps are staged, and `enter_communication` promotes them
//! into the data the next synchronisation step reads from.

use tracing::{debug, warn};

use crate::core::compare::{double_eq, double_gt, double_lt};
use crate::core::error::Result;
use crate::core::interpolation::{ExtrapMethod, InterpMethod, InterpTable, PolyBuffer};
use crate::core::value::{ChannelType, ChannelValue};

/// Mode of the connection hosting a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Initialization,
    CouplingStep,
    Communication,
}

/// Bound on the interpolation write buffer. Generous heuristic; an
/// element would need more coupling steps than this inside one
/// synchronisation step to overflow.
const INTERP_BUFFER_LEN: usize = 1000;

#[derive(Debug)]
pub enum Filter {
    /// Polynomial extrapolation through the most recent committed
    /// samples. Degree 0 doubles as constant hold.
    Extrapolating(ExtrapolatingFilter),
    /// Zero-order-hold (degree 0) or piecewise-linear (degree 1)
    /// interpolation over the previous synchronisation step's samples.
    Interpolating(InterpolatingFilter),
    /// Interpolation inside the read window, extrapolation outside.
    InterExtrapolating(InterExtrapolatingFilter),
    /// Mirror latch for discrete (non-double) connections.
    Discrete(DiscreteFilter),
}

impl Filter {
    pub fn extrapolating(degree: usize) -> Self {
        Filter::Extrapolating(ExtrapolatingFilter::new(degree))
    }

    pub fn interpolating(degree: usize) -> Result<Self> {
        Ok(Filter::Interpolating(InterpolatingFilter::new(degree)?))
    }

    pub fn inter_extrapolating(interp_degree: usize, extrap_degree: usize) -> Result<Self> {
        Ok(Filter::InterExtrapolating(InterExtrapolatingFilter {
            interp: InterpolatingFilter::new(interp_degree)?,
            extrap: ExtrapolatingFilter::new(extrap_degree),
        }))
    }

    pub fn discrete(ty: ChannelType) -> Self {
        Filter::Discrete(DiscreteFilter::new(ty))
    }

    /// A new sample from the source side.
    pub fn set_value(&mut self, mode: ConnectionMode, time: f64, value: &ChannelValue) -> Result<()> {
        match self {
            Filter::Extrapolating(f) => f.set_value(mode, time, value.as_double()?),
            Filter::Interpolating(f) => f.set_value(time, value.as_double()?),
            Filter::InterExtrapolating(f) => {
                let v = value.as_double()?;
                f.interp.set_value(time, v);
                f.extrap.set_value(mode, time, v);
            }
            Filter::Discrete(f) => f.set_value(mode, value)?,
        }
        Ok(())
    }

    /// Reconstruct the signal at `time` for the target side.
    pub fn get_value(&mut self, time: f64) -> ChannelValue {
        match self {
            Filter::Extrapolating(f) => ChannelValue::Double(f.get_value(time)),
            Filter::Interpolating(f) => ChannelValue::Double(f.get_value(time)),
            Filter::InterExtrapolating(f) => ChannelValue::Double(f.get_value(time)),
            Filter::Discrete(f) => f.get_value(),
        }
    }

    pub fn enter_coupling_step(
        &mut self,
        _mode: ConnectionMode,
        _sync_step_size: f64,
        _source_step_size: f64,
        _target_step_size: f64,
    ) -> Result<()> {
        // All current variants stage samples lazily; entering the
        // coupling step carries no state of its own.
        Ok(())
    }

    /// Promote staged samples; idempotent while already in
    /// communication mode.
    pub fn enter_communication(&mut self, mode: ConnectionMode, time: f64) -> Result<()> {
        if mode == ConnectionMode::Communication {
            return Ok(());
        }
        match self {
            Filter::Extrapolating(f) => f.enter_communication(),
            Filter::Interpolating(f) => f.enter_communication(time),
            Filter::InterExtrapolating(f) => {
                f.extrap.enter_communication();
                f.interp.enter_communication(time);
            }
            Filter::Discrete(f) => f.enter_communication()?,
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ExtrapolatingFilter {
    degree: usize,
    poly: PolyBuffer,
    /// Committed window size, capped at `degree + 1`.
    committed: usize,
    /// Most recent sample seen during the running synchronisation step.
    last_time: f64,
    last_value: f64,
    /// Last evaluated value, reused when the window is still empty.
    value: f64,
}

impl ExtrapolatingFilter {
    pub fn new(degree: usize) -> Self {
        Self {
            degree,
            poly: PolyBuffer::new(),
            committed: 0,
            last_time: 0.0,
            last_value: 0.0,
            value: 0.0,
        }
    }

    fn set_value(&mut self, mode: ConnectionMode, time: f64, value: f64) {
        if mode != ConnectionMode::Communication {
            self.last_time = time;
            self.last_value = value;
        }
    }

    fn get_value(&mut self, time: f64) -> f64 {
        if self.poly.is_empty() {
            warn!("connection filter: cannot evaluate empty polynomial");
            return self.value;
        }

        // Exact hit on a stored sample returns the stored value.
        for i in (0..self.poly.len()).rev() {
            if time == self.poly.x(i) {
                return self.poly.y(i);
            }
            if time > self.poly.x(i) {
                break;
            }
        }

        self.value = self.poly.evaluate(time);
        self.value
    }

    /// The newest staged sample either replaces the last committed one
    /// (same time), grows the window (below capacity) or shifts it.
    fn enter_communication(&mut self) {
        let (time, value) = (self.last_time, self.last_value);

        if self.committed > 0 && self.poly.x(self.poly.len() - 1) == time {
            if self.poly.len() > 1 {
                self.poly.replace_last(time, value);
            } else {
                self.poly.shift(time, value);
            }
        } else if self.committed < self.degree + 1 {
            self.poly.push(time, value);
            self.committed += 1;
        } else {
            self.poly.shift(time, value);
        }

        self.poly.compute_coefficients();
    }
}

#[derive(Debug)]
pub struct InterpolatingFilter {
    table: InterpTable,
    read: Vec<(f64, f64)>,
    write: Vec<(f64, f64)>,
    /// Initialised negative so a sample at 0.0 is not ignored.
    last_coupling_time: f64,
}

impl InterpolatingFilter {
    pub fn new(degree: usize) -> Result<Self> {
        let (interp, extrap) = match degree {
            0 => (InterpMethod::StepRight, ExtrapMethod::Constant),
            1 => (InterpMethod::Linear, ExtrapMethod::Linear),
            d => {
                return Err(crate::core::error::SimbusError::Config(format!(
                    "interpolation filter: degree {d} not supported"
                )));
            }
        };
        Ok(Self {
            table: InterpTable::new(interp, extrap),
            read: Vec::new(),
            write: Vec::new(),
            last_coupling_time: -1.0,
        })
    }

    fn set_value(&mut self, time: f64, value: f64) {
        // Bit-equal repeat of the previous sample time; no operation is
        // ever performed on time, so exact comparison is intended.
        if time - self.last_coupling_time == 0.0 {
            return;
        }
        self.last_coupling_time = time;

        if let Some(last) = self.write.last() {
            if double_eq(last.0, time) {
                debug!("connection filter: value already set for time {time:.17}");
                return;
            }
        }

        if self.write.len() < INTERP_BUFFER_LEN {
            self.write.push((time, value));
        } else {
            warn!("connection filter: number of stored values larger than buffer size");
            *self.write.last_mut().expect("buffer is non-empty") = (time, value);
        }
    }

    fn get_value(&mut self, time: f64) -> f64 {
        if let (Some(first), Some(last)) = (self.read.first(), self.read.last()) {
            if double_lt(time, first.0) || double_gt(time, last.0) {
                debug!(
                    "connection filter: extrapolating with interpolation data (time={time:.4}, range=[{:.4},{:.4}])",
                    first.0, last.0
                );
            }
        }
        self.table.lookup(time)
    }

    /// Swap read and write buffers when the staged samples extend past
    /// the read range; the last committed sample seeds the next write
    /// buffer.
    fn enter_communication(&mut self, time: f64) {
        let extends = match self.read.last() {
            None => true,
            Some(last) => double_gt(time, last.0),
        };
        if extends {
            self.table.set_data(&self.write);
            std::mem::swap(&mut self.read, &mut self.write);
            self.write.clear();
            if let Some(last) = self.read.last() {
                self.write.push(*last);
            }
        }
    }

    fn read_range(&self) -> Option<(f64, f64)> {
        match (self.read.first(), self.read.last()) {
            (Some(first), Some(last)) => Some((first.0, last.0)),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct InterExtrapolatingFilter {
    interp: InterpolatingFilter,
    extrap: ExtrapolatingFilter,
}

impl InterExtrapolatingFilter {
    fn get_value(&mut self, time: f64) -> f64 {
        let outside_read = match self.interp.read_range() {
            None => true,
            Some((first, last)) => double_lt(time, first) || double_gt(time, last),
        };

        if outside_read {
            // Inside the extrapolation window nothing can be
            // extrapolated forward; fall back to the interpolation data.
            let n = self.extrap.poly.len();
            let inside_extrap = n > 0
                && double_lt(time, self.extrap.poly.x(n - 1))
                && double_gt(time, self.extrap.poly.x(0));
            if n == 0 || inside_extrap {
                warn!(
                    "connection filter: out of bounds for interpolation and extrapolation, \
                     extrapolating from interpolation data"
                );
                self.interp.get_value(time)
            } else {
                self.extrap.get_value(time)
            }
        } else {
            self.interp.get_value(time)
        }
    }
}

#[derive(Debug)]
pub struct DiscreteFilter {
    staged: ChannelValue,
    committed: ChannelValue,
}

impl DiscreteFilter {
    pub fn new(ty: ChannelType) -> Self {
        Self {
            staged: ChannelValue::zero(ty),
            committed: ChannelValue::zero(ty),
        }
    }

    fn set_value(&mut self, mode: ConnectionMode, value: &ChannelValue) -> Result<()> {
        if mode != ConnectionMode::Communication {
            self.staged.set_from(value)?;
        }
        Ok(())
    }

    fn get_value(&self) -> ChannelValue {
        self.committed.clone()
    }

    fn enter_communication(&mut self) -> Result<()> {
        self.committed.set_from(&self.staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(filter: &mut Filter, t: f64, v: f64) {
        filter
            .set_value(ConnectionMode::CouplingStep, t, &ChannelValue::Double(v))
            .unwrap();
    }

    fn commit(filter: &mut Filter, t: f64) {
        filter
            .enter_communication(ConnectionMode::CouplingStep, t)
            .unwrap();
    }

    fn get(filter: &mut Filter, t: f64) -> f64 {
        filter.get_value(t).as_double().unwrap()
    }

    #[test]
    fn test_constant_hold_via_degree_zero() {
        let mut f = Filter::extrapolating(0);
        set(&mut f, 0.0, 4.2);
        commit(&mut f, 0.0);
        assert_eq!(get(&mut f, 0.5), 4.2);
        assert_eq!(get(&mut f, 10.0), 4.2);
    }

    #[test]
    fn test_linear_extrapolation() {
        let mut f = Filter::extrapolating(1);
        set(&mut f, 0.0, 0.0);
        commit(&mut f, 0.0);
        set(&mut f, 1.0, 2.0);
        commit(&mut f, 1.0);
        assert!((get(&mut f, 2.0) - 4.0).abs() < 1e-12);
        // exact hit on a stored sample returns the sample
        assert_eq!(get(&mut f, 1.0), 2.0);
    }

    #[test]
    fn test_extrapolation_window_shifts() {
        let mut f = Filter::extrapolating(1);
        for k in 0..4 {
            let t = k as f64;
            set(&mut f, t, 3.0 * t);
            commit(&mut f, t);
        }
        // window holds the last two samples; still the same line
        assert!((get(&mut f, 5.0) - 15.0).abs() < 1e-12);
    }

    #[test]
    fn test_communication_twice_is_noop() {
        let mut f = Filter::extrapolating(1);
        set(&mut f, 0.0, 1.0);
        commit(&mut f, 0.0);
        let before = get(&mut f, 0.5);
        f.enter_communication(ConnectionMode::Communication, 0.0)
            .unwrap();
        assert_eq!(get(&mut f, 0.5), before);
    }

    #[test]
    fn test_linear_interpolation_buffer_swap() {
        let mut f = Filter::interpolating(1).unwrap();
        // first synchronisation step writes [0, 0.1]
        set(&mut f, 0.0, 0.0);
        set(&mut f, 0.1, 1.0);
        commit(&mut f, 0.1);
        // the next step reads the swapped-in data
        assert!((get(&mut f, 0.05) - 0.5).abs() < 1e-12);
        // the write buffer carries the last committed sample forward
        set(&mut f, 0.2, 2.0);
        commit(&mut f, 0.2);
        assert!((get(&mut f, 0.15) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_discrete_latch() {
        let mut f = Filter::discrete(ChannelType::Integer);
        f.set_value(ConnectionMode::CouplingStep, 0.0, &ChannelValue::Integer(7))
            .unwrap();
        // staged but not yet committed
        assert_eq!(f.get_value(0.0), ChannelValue::Integer(0));
        commit(&mut f, 0.0);
        assert_eq!(f.get_value(0.5), ChannelValue::Integer(7));
    }

    #[test]
    fn test_discrete_ignores_communication_writes() {
        let mut f = Filter::discrete(ChannelType::Bool);
        f.set_value(
            ConnectionMode::Communication,
            0.0,
            &ChannelValue::Bool(true),
        )
        .unwrap();
        commit(&mut f, 0.0);
        assert_eq!(f.get_value(0.0), ChannelValue::Bool(false));
    }

    #[test]
    fn test_inter_extrapolating_dispatch() {
        let mut f = Filter::inter_extrapolating(1, 1).unwrap();
        set(&mut f, 0.0, 0.0);
        commit(&mut f, 0.0);
        set(&mut f, 1.0, 1.0);
        commit(&mut f, 1.0);
        // inside the read window: interpolation
        assert!((get(&mut f, 0.5) - 0.5).abs() < 1e-12);
        // past the read window: extrapolation continues the line
        assert!((get(&mut f, 1.5) - 1.5).abs() < 1e-12);
    }
}
