//! Per-element container of ports.
//!
//! The databus owns the input, output, local (observable) and RT-factor
//! ports of one element together with their metadata. It is strictly a
//! container: it does not schedule and does not know the global time.

use std::sync::Arc;

use tracing::error;

use crate::core::connection::Connection;
use crate::core::error::{Result, SimbusError};
use crate::core::port::{InputPort, LocalPort, NanCheck, OutputPort, PortInfo, VectorPortInfo};
use crate::core::value::{ChannelType, ValueCell};

/// A closed time interval handed through the update protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeInterval {
    pub start: f64,
    pub end: f64,
}

impl TimeInterval {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn point(t: f64) -> Self {
        Self { start: t, end: t }
    }
}

/// Port metadata of one class (in, out, local, rt-factor), scalarised:
/// vector ports appear as their child infos, with the original vector
/// infos kept alongside.
#[derive(Debug, Default)]
pub struct DatabusInfo {
    infos: Vec<PortInfo>,
    vectors: Vec<VectorPortInfo>,
}

impl DatabusInfo {
    pub fn new(infos: Vec<PortInfo>, vectors: Vec<VectorPortInfo>) -> Self {
        Self { infos, vectors }
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn info(&self, i: usize) -> Option<&PortInfo> {
        self.infos.get(i)
    }

    pub fn infos(&self) -> &[PortInfo] {
        &self.infos
    }

    pub fn vectors(&self) -> &[VectorPortInfo] {
        &self.vectors
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.infos.iter().position(|info| info.name == name)
    }

    pub fn mark_connected(&mut self, i: usize) {
        if let Some(info) = self.infos.get_mut(i) {
            info.connected = true;
        }
    }

    /// Ports that go into result files.
    pub fn num_write_channels(&self) -> usize {
        self.infos.iter().filter(|info| info.write_result).count()
    }
}

#[derive(Debug)]
pub struct Databus {
    in_info: DatabusInfo,
    out_info: DatabusInfo,
    local_info: DatabusInfo,
    rt_info: DatabusInfo,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
    locals: Vec<LocalPort>,
    rt_ports: Vec<LocalPort>,
    nan_check: NanCheck,
    max_nan_warnings: usize,
}

impl Databus {
    /// Create all input and output ports from their metadata.
    pub fn setup(
        in_info: DatabusInfo,
        out_info: DatabusInfo,
        nan_check: NanCheck,
        max_nan_warnings: usize,
    ) -> Result<Self> {
        let inputs = in_info
            .infos()
            .iter()
            .map(InputPort::from_info)
            .collect::<Result<Vec<_>>>()?;
        let outputs = out_info
            .infos()
            .iter()
            .map(|info| OutputPort::from_info(info, nan_check, max_nan_warnings))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            in_info,
            out_info,
            local_info: DatabusInfo::default(),
            rt_info: DatabusInfo::default(),
            inputs,
            outputs,
            locals: Vec::new(),
            rt_ports: Vec::new(),
            nan_check,
            max_nan_warnings,
        })
    }

    pub fn in_info(&self) -> &DatabusInfo {
        &self.in_info
    }

    pub fn out_info(&self) -> &DatabusInfo {
        &self.out_info
    }

    pub fn local_info(&self) -> &DatabusInfo {
        &self.local_info
    }

    pub fn rt_info(&self) -> &DatabusInfo {
        &self.rt_info
    }

    pub fn num_in_channels(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_out_channels(&self) -> usize {
        self.outputs.len()
    }

    pub fn num_local_channels(&self) -> usize {
        self.locals.len()
    }

    pub fn num_rt_factor_channels(&self) -> usize {
        self.rt_ports.len()
    }

    fn in_port(&mut self, i: usize) -> Result<(&mut InputPort, &PortInfo)> {
        let info = self
            .in_info
            .infos
            .get(i)
            .ok_or_else(|| SimbusError::Port(format!("illegal inport number {i}")))?;
        Ok((&mut self.inputs[i], info))
    }

    fn out_port(&mut self, i: usize) -> Result<(&mut OutputPort, &PortInfo)> {
        let info = self
            .out_info
            .infos
            .get(i)
            .ok_or_else(|| SimbusError::Port(format!("illegal outport number {i}")))?;
        Ok((&mut self.outputs[i], info))
    }

    /// Bind an element cell to input port `i`.
    pub fn set_in_reference(&mut self, i: usize, cell: ValueCell, ty: ChannelType) -> Result<()> {
        let (port, info) = self.in_port(i)?;
        port.set_reference(info, cell, ty)
    }

    /// Bind an element cell to output port `i`.
    pub fn set_out_reference(&mut self, i: usize, cell: ValueCell, ty: ChannelType) -> Result<()> {
        let (port, info) = self.out_port(i)?;
        port.set_reference(info, cell, ty)
    }

    /// Bind a time-indexed pure function to output port `i`.
    pub fn set_out_reference_fn(
        &mut self,
        i: usize,
        function: Arc<dyn Fn(f64) -> f64 + Send + Sync>,
        ty: ChannelType,
    ) -> Result<()> {
        let (port, info) = self.out_port(i)?;
        port.set_reference_fn(info, function, ty)
    }

    /// Bulk-bind cells to the contiguous scalar family starting at
    /// input port `first`.
    pub fn set_in_ref_vector(
        &mut self,
        first: usize,
        cells: &[ValueCell],
        ty: ChannelType,
    ) -> Result<()> {
        for (k, cell) in cells.iter().enumerate() {
            self.set_in_reference(first + k, cell.clone(), ty)?;
        }
        Ok(())
    }

    /// Bulk-bind cells to the contiguous scalar family starting at
    /// output port `first`.
    pub fn set_out_ref_vector(
        &mut self,
        first: usize,
        cells: &[ValueCell],
        ty: ChannelType,
    ) -> Result<()> {
        for (k, cell) in cells.iter().enumerate() {
            self.set_out_reference(first + k, cell.clone(), ty)?;
        }
        Ok(())
    }

    fn unique_channel_name(&self, name: &str) -> String {
        let taken = |candidate: &str| {
            self.in_info.index_of(candidate).is_some()
                || self.out_info.index_of(candidate).is_some()
                || self.local_info.index_of(candidate).is_some()
        };

        if !taken(name) {
            return name.to_string();
        }
        let mut suffix = 1usize;
        loop {
            let candidate = format!("{name} {suffix}");
            if !taken(&candidate) {
                return candidate;
            }
            suffix += 1;
        }
    }

    /// Append an observable local port; the name is made unique by
    /// suffixing `" n"` until no in/out/local port carries it.
    pub fn add_local_channel(
        &mut self,
        name: &str,
        id: &str,
        unit: Option<&str>,
        cell: ValueCell,
        ty: ChannelType,
    ) -> Result<()> {
        if ty == ChannelType::Unknown {
            return Err(SimbusError::Port(format!(
                "add local channel {name}: unknown type"
            )));
        }
        let unique = self.unique_channel_name(name);
        let mut info = PortInfo::new(unique, ty, id);
        info.unit = unit.map(str::to_string);
        self.local_info.infos.push(info);
        self.locals.push(LocalPort::new(cell));
        Ok(())
    }

    /// Append an RT-factor port (wall-clock statistics channel).
    pub fn add_rt_factor_channel(
        &mut self,
        name: &str,
        id: &str,
        unit: Option<&str>,
        cell: ValueCell,
        ty: ChannelType,
    ) -> Result<()> {
        if ty == ChannelType::Unknown {
            return Err(SimbusError::Port(format!(
                "add rt-factor channel {name}: unknown type"
            )));
        }
        let mut info = PortInfo::new(name, ty, id);
        info.unit = unit.map(str::to_string);
        self.rt_info.infos.push(info);
        self.rt_ports.push(LocalPort::new(cell));
        Ok(())
    }

    /// Update every output port at `interval.start`.
    pub fn trigger_out_channels(&mut self, interval: &TimeInterval) -> Result<()> {
        for (port, info) in self.outputs.iter_mut().zip(self.out_info.infos.iter()) {
            port.update(info, interval.start).map_err(|e| {
                error!("could not update outport {}", info.name);
                e
            })?;
        }
        Ok(())
    }

    /// Update every valid input port at `interval.start`.
    pub fn trigger_in_connections(&mut self, interval: &TimeInterval) -> Result<()> {
        for (port, info) in self.inputs.iter_mut().zip(self.in_info.infos.iter()) {
            if port.is_valid(info) {
                port.update(info, interval.start).map_err(|e| {
                    error!("could not update inport {}", info.name);
                    e
                })?;
            }
        }
        Ok(())
    }

    /// Forward coupling-step entry to every outgoing connection.
    pub fn enter_coupling_step(&mut self, sync_step_size: f64) -> Result<()> {
        for port in &self.outputs {
            for connection in port.connections() {
                connection.enter_coupling_step(sync_step_size).map_err(|e| {
                    error!(
                        "cannot enter coupling step mode of connection {}",
                        connection.info().connection_string()
                    );
                    e
                })?;
            }
        }
        Ok(())
    }

    /// Forward communication entry to every outgoing connection.
    pub fn enter_communication(&mut self, time: f64) -> Result<()> {
        for port in &self.outputs {
            for connection in port.connections() {
                connection.enter_communication(time).map_err(|e| {
                    error!(
                        "cannot enter communication mode of connection {}",
                        connection.info().connection_string()
                    );
                    e
                })?;
            }
        }
        Ok(())
    }

    /// Communication entry for a subset of this databus' outgoing
    /// connections only.
    pub fn enter_communication_for(
        &mut self,
        connections: &[Arc<Connection>],
        time: f64,
    ) -> Result<()> {
        for connection in connections {
            connection.enter_communication(time)?;
        }
        Ok(())
    }

    /// Register an outgoing connection on output port `i`.
    pub fn attach_out_connection(&mut self, i: usize, connection: Arc<Connection>) -> Result<()> {
        let (port, _) = self.out_port(i)?;
        port.register_connection(connection);
        self.out_info.mark_connected(i);
        Ok(())
    }

    /// Register the incoming connection on input port `i`.
    pub fn attach_in_connection(
        &mut self,
        i: usize,
        connection: Arc<Connection>,
        source_unit: Option<&str>,
        source_type: ChannelType,
    ) -> Result<()> {
        let (port, info) = self.in_port(i)?;
        port.set_connection(info, connection, source_unit, source_type)?;
        self.in_info.mark_connected(i);
        Ok(())
    }

    pub fn input(&self, i: usize) -> Option<&InputPort> {
        self.inputs.get(i)
    }

    pub fn input_mut(&mut self, i: usize) -> Option<&mut InputPort> {
        self.inputs.get_mut(i)
    }

    pub fn output(&self, i: usize) -> Option<&OutputPort> {
        self.outputs.get(i)
    }

    pub fn output_mut(&mut self, i: usize) -> Option<&mut OutputPort> {
        self.outputs.get_mut(i)
    }

    pub fn local(&self, i: usize) -> Option<&LocalPort> {
        self.locals.get(i)
    }

    pub fn rt_port(&self, i: usize) -> Option<&LocalPort> {
        self.rt_ports.get(i)
    }

    pub fn nan_check(&self) -> NanCheck {
        self.nan_check
    }

    pub fn max_nan_warnings(&self) -> usize {
        self.max_nan_warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::ChannelValue;

    fn bus_with(inputs: &[&str], outputs: &[&str]) -> Databus {
        let in_infos = inputs
            .iter()
            .map(|n| PortInfo::new(*n, ChannelType::Double, format!("e.{n}")))
            .collect();
        let out_infos = outputs
            .iter()
            .map(|n| PortInfo::new(*n, ChannelType::Double, format!("e.{n}")))
            .collect();
        Databus::setup(
            DatabusInfo::new(in_infos, Vec::new()),
            DatabusInfo::new(out_infos, Vec::new()),
            NanCheck::Always,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_reference_binding() {
        let mut bus = bus_with(&["u"], &["y"]);
        let cell = ValueCell::double(1.0);
        bus.set_out_reference(0, cell.clone(), ChannelType::Double).unwrap();
        // double bind fails
        assert!(bus.set_out_reference(0, cell, ChannelType::Double).is_err());
        // out of range fails
        assert!(
            bus.set_out_reference(5, ValueCell::double(0.0), ChannelType::Double)
                .is_err()
        );
    }

    #[test]
    fn test_trigger_out_copies_value() {
        let mut bus = bus_with(&[], &["y"]);
        let cell = ValueCell::double(0.0);
        bus.set_out_reference(0, cell.clone(), ChannelType::Double).unwrap();

        cell.set_double(4.25).unwrap();
        bus.trigger_out_channels(&TimeInterval::point(0.0)).unwrap();
        assert_eq!(bus.output(0).unwrap().value_cell().get_double().unwrap(), 4.25);
    }

    #[test]
    fn test_unconnected_input_without_default_skipped() {
        let mut bus = bus_with(&["u"], &[]);
        let cell = ValueCell::double(0.0);
        bus.set_in_reference(0, cell.clone(), ChannelType::Double).unwrap();
        // not valid, so no update happens and no error is raised
        bus.trigger_in_connections(&TimeInterval::point(0.0)).unwrap();
        assert_eq!(cell.get_double().unwrap(), 0.0);
    }

    #[test]
    fn test_local_channel_name_uniquified() {
        let mut bus = bus_with(&["x"], &[]);
        bus.add_local_channel("x", "e.x", None, ValueCell::double(0.0), ChannelType::Double)
            .unwrap();
        bus.add_local_channel("x", "e.x", None, ValueCell::double(0.0), ChannelType::Double)
            .unwrap();
        assert_eq!(bus.local_info().info(0).unwrap().name, "x 1");
        assert_eq!(bus.local_info().info(1).unwrap().name, "x 2");
    }

    #[test]
    fn test_vector_binding() {
        let mut bus = bus_with(&[], &["v[0]", "v[1]", "v[2]"]);
        let cells: Vec<_> = (0..3).map(|i| ValueCell::double(i as f64)).collect();
        bus.set_out_ref_vector(0, &cells, ChannelType::Double).unwrap();
        bus.trigger_out_channels(&TimeInterval::point(0.0)).unwrap();
        for (i, _) in cells.iter().enumerate() {
            assert_eq!(
                bus.output(i).unwrap().value_cell().get_double().unwrap(),
                i as f64
            );
        }
    }

    #[test]
    fn test_connection_attachment() {
        use crate::core::connection::{
            Connection, ConnectionEndpoints, ConnectionInfo, DecouplePolicy, InterExtraKind,
            InterExtraParams,
        };

        let mut source = bus_with(&[], &["out"]);
        let mut target = bus_with(&["in"], &[]);

        let info = ConnectionInfo {
            endpoints: ConnectionEndpoints {
                source_element: 0,
                source_port: 0,
                target_element: 1,
                target_port: 0,
            },
            source_name: "s.out".into(),
            target_name: "t.in".into(),
            decouple: DecouplePolicy::IfNeeded(0),
            channel_type: ChannelType::Double,
            source_unit: None,
            polynomial: false,
            inter_extra: InterExtraParams::default(),
            kind: InterExtraKind::Extrapolating,
            source_time_step: 0.0,
            target_time_step: 0.0,
        };
        let connection = Arc::new(Connection::new(info, None));
        connection.add_filter().unwrap();

        source.attach_out_connection(0, Arc::clone(&connection)).unwrap();
        target
            .attach_in_connection(0, Arc::clone(&connection), None, ChannelType::Double)
            .unwrap();

        // the target port holds the back-reference
        assert!(target.input(0).unwrap().connection().is_some());
        assert!(source.out_info().info(0).unwrap().connected);
        assert!(target.in_info().info(0).unwrap().connected);

        // communication entry for an explicit connection subset
        let cell = ValueCell::double(1.25);
        source.set_out_reference(0, cell, ChannelType::Double).unwrap();
        source.enter_coupling_step(0.1).unwrap();
        source.trigger_out_channels(&TimeInterval::point(0.0)).unwrap();
        source
            .enter_communication_for(&[Arc::clone(&connection)], 0.0)
            .unwrap();
        target.trigger_in_connections(&TimeInterval::point(0.0)).unwrap();
        assert_eq!(
            target.input(0).unwrap().value_cell().get_double().unwrap(),
            1.25
        );
    }

    #[test]
    fn test_unknown_type_local_channel_rejected() {
        let mut bus = bus_with(&[], &[]);
        let result = bus.add_local_channel(
            "bad",
            "e.bad",
            None,
            ValueCell::new(ChannelValue::Unknown),
            ChannelType::Unknown,
        );
        assert!(result.is_err());
    }
}
