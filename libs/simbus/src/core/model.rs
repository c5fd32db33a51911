//! Model assembly and lifecycle.
//!
//! The model turns the declarative input into element harnesses, wires
//! the connections (rejecting inverted endpoint records), attaches
//! filters, runs the initialization protocol and produces the ordered
//! sub-model the task steps over.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::core::connection::{
    resolve_inter_extra_kind, Connection, ConnectionEndpoints, ConnectionInfo, DecouplePolicy,
    InterExtraKind, InterExtraParams,
};
use crate::core::databus::{Databus, DatabusInfo, TimeInterval};
use crate::core::element::ElementHarness;
use crate::core::error::{Result, SimbusError};
use crate::core::port::{PortInfo, VectorPortInfo};
use crate::core::submodel::{create_sub_model, DependencyPhase, ElementRef, SubModel};
use crate::core::task::Task;
use crate::core::value::ChannelType;
use crate::elements::create_element;
use crate::input::{
    split_endpoint, value_from_yaml, ComponentInput, ConnectionInput, DecoupleInput, ModelInput,
    PortInput,
};
use crate::steptypes::CouplingMethod;
use crate::storage::{ChannelClass, ResultsStorage, StorageGates, StoreLevel};

pub struct Model {
    elements: Vec<ElementRef>,
    names: Vec<String>,
    connections: Vec<Arc<Connection>>,
    gates: Vec<StorageGates>,
    sub_model: Option<SubModel>,
}

impl Model {
    /// Build all element harnesses and wire the connections.
    pub fn build(input: &ModelInput, task: &Task) -> Result<Self> {
        let mut model = Self {
            elements: Vec::new(),
            names: Vec::new(),
            connections: Vec::new(),
            gates: Vec::new(),
            sub_model: None,
        };

        for (index, component) in input.components.iter().enumerate() {
            if model.names.contains(&component.name) {
                return Err(SimbusError::Config(format!(
                    "duplicate element name \"{}\"",
                    component.name
                )));
            }
            let harness = build_harness(component, index, input, task)?;
            model.names.push(component.name.clone());
            model.gates.push(gates_from_input(component, input));
            model.elements.push(Arc::new(Mutex::new(harness)));
        }

        for connection in &input.connections {
            let built = model.wire_connection(connection, task.coupling)?;
            model.connections.push(built);
        }

        // filters go in once the model is fully connected, so they see
        // the final decoupling state of `always` connections
        for connection in &model.connections {
            connection.add_filter()?;
        }

        Ok(model)
    }

    fn element_index(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| SimbusError::Config(format!("unknown element \"{name}\"")))
    }

    fn wire_connection(
        &mut self,
        input: &ConnectionInput,
        coupling: CouplingMethod,
    ) -> Result<Arc<Connection>> {
        let (source_name, source_port_name) = split_endpoint(&input.from)?;
        let (target_name, target_port_name) = split_endpoint(&input.to)?;

        let source_element = self.element_index(source_name)?;
        let target_element = self.element_index(target_name)?;

        let (source_port, source_type, source_unit, source_fn, source_time_step) = {
            let harness = self.elements[source_element].lock();
            let databus = harness.databus();
            let Some(port) = databus.out_info().index_of(source_port_name) else {
                if databus.in_info().index_of(source_port_name).is_some() {
                    return Err(SimbusError::Config(format!(
                        "connection {} -> {}: \"{}\" is an input port; \
                         connections run from an output to an input",
                        input.from, input.to, input.from
                    )));
                }
                return Err(SimbusError::Config(format!(
                    "connection {} -> {}: unknown output port \"{}\"",
                    input.from, input.to, input.from
                )));
            };
            let info = databus.out_info().info(port).expect("index valid");
            (
                port,
                info.port_type,
                info.unit.clone(),
                databus.output(port).and_then(|p| p.function()),
                if harness.has_own_time() { harness.time_step() } else { 0.0 },
            )
        };

        let (target_port, target_time_step) = {
            let harness = self.elements[target_element].lock();
            let databus = harness.databus();
            let Some(port) = databus.in_info().index_of(target_port_name) else {
                if databus.out_info().index_of(target_port_name).is_some() {
                    return Err(SimbusError::Config(format!(
                        "connection {} -> {}: \"{}\" is an output port; \
                         connections run from an output to an input",
                        input.from, input.to, input.to
                    )));
                }
                return Err(SimbusError::Config(format!(
                    "connection {} -> {}: unknown input port \"{}\"",
                    input.from, input.to, input.to
                )));
            };
            (
                port,
                if harness.has_own_time() { harness.time_step() } else { 0.0 },
            )
        };

        let decouple = match input.decouple {
            None => DecouplePolicy::IfNeeded(0),
            Some(DecoupleInput::Never) => DecouplePolicy::Never,
            Some(DecoupleInput::Always) => DecouplePolicy::Always,
            Some(DecoupleInput::IfNeeded { priority }) => DecouplePolicy::IfNeeded(priority),
        };

        let inter_extra = input
            .interpolation
            .map(|p| InterExtraParams {
                interpolation_order: p.interpolation_order,
                extrapolation_order: p.extrapolation_order,
            })
            .unwrap_or_default();

        // sequentially coupled targets can interpolate over the data of
        // the running step; parallel targets have to extrapolate
        let initial_kind = match coupling {
            CouplingMethod::Sequential => InterExtraKind::Interpolating,
            _ => InterExtraKind::Extrapolating,
        };
        let kind = resolve_inter_extra_kind(initial_kind, &inter_extra);

        let info = ConnectionInfo {
            endpoints: ConnectionEndpoints {
                source_element,
                source_port,
                target_element,
                target_port,
            },
            source_name: input.from.clone(),
            target_name: input.to.clone(),
            decouple,
            channel_type: source_type,
            source_unit: source_unit.clone(),
            polynomial: true,
            inter_extra,
            kind,
            source_time_step,
            target_time_step,
        };

        debug!("connection: {}", info.connection_string());
        let connection = Arc::new(Connection::new(info, source_fn));

        self.elements[source_element]
            .lock()
            .databus_mut()
            .attach_out_connection(source_port, Arc::clone(&connection))?;
        self.elements[target_element]
            .lock()
            .databus_mut()
            .attach_in_connection(
                target_port,
                Arc::clone(&connection),
                source_unit.as_deref(),
                source_type,
            )?;

        Ok(connection)
    }

    /// Run the initialization protocol and produce the runtime
    /// sub-model.
    pub fn initialize(&mut self, start_time: f64) -> Result<()> {
        info!("initializing model at {start_time} s");

        let init_model = create_sub_model(&self.elements, DependencyPhase::Initial)?;

        for connection in &self.connections {
            connection.enter_initialization()?;
        }

        for connection in &self.connections {
            let endpoints = connection.info().endpoints;
            let target_initial = {
                let harness = self.elements[endpoints.target_element].lock();
                harness
                    .databus()
                    .in_info()
                    .info(endpoints.target_port)
                    .and_then(|info| info.initial_value.clone())
            };
            let source_initial = {
                let harness = self.elements[endpoints.source_element].lock();
                harness
                    .databus()
                    .out_info()
                    .info(endpoints.source_port)
                    .and_then(|info| info.initial_value.clone())
            };
            connection.update_initial_value(target_initial.as_ref(), source_initial.as_ref())?;
        }

        let at_start = TimeInterval::point(start_time);
        for (_, element) in &init_model.elements {
            let mut harness = element.lock();
            harness.databus_mut().trigger_in_connections(&at_start)?;
            harness.update_in_channels()?;
            harness.initialize(start_time).map_err(|e| {
                SimbusError::Runtime(format!(
                    "initialization of {} failed: {e}",
                    harness.name()
                ))
            })?;
            harness.update_out_channels(&at_start)?;
        }

        for element in &self.elements {
            element.lock().exit_initialization()?;
        }

        for connection in &self.connections {
            let endpoints = connection.info().endpoints;
            let source_value = {
                let harness = self.elements[endpoints.source_element].lock();
                harness
                    .databus()
                    .output(endpoints.source_port)
                    .expect("wired port exists")
                    .value_cell()
                    .get()
            };
            connection.exit_initialization(start_time, &source_value)?;
        }

        self.sub_model = Some(create_sub_model(&self.elements, DependencyPhase::Runtime)?);
        Ok(())
    }

    pub fn sub_model(&self) -> Result<&SubModel> {
        self.sub_model
            .as_ref()
            .ok_or_else(|| SimbusError::Runtime("model is not initialized".into()))
    }

    pub fn elements(&self) -> &[ElementRef] {
        &self.elements
    }

    pub fn element_by_name(&self, name: &str) -> Option<&ElementRef> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.elements[i])
    }

    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    /// Attach every element's storage to the results hub.
    pub fn register_storage(&mut self, results: &ResultsStorage, sync_step: f64) -> Result<()> {
        let hub = results.hub()?;
        for (index, element) in self.elements.iter().enumerate() {
            let mut harness = element.lock();
            harness.register_storage(Arc::clone(&hub), &self.gates[index], sync_step)?;
        }
        Ok(())
    }

    /// Store the output and local rows of the initial state.
    pub fn store_initial_results(&self, start_time: f64) -> Result<()> {
        for element in &self.elements {
            let mut harness = element.lock();
            harness.store(ChannelClass::Out, start_time, StoreLevel::Communication)?;
            harness.store(ChannelClass::Local, start_time, StoreLevel::Communication)?;
        }
        Ok(())
    }

    /// Flush every element's storage; pending rows reach the backends.
    pub fn finish_storage(&self) -> Result<()> {
        let mut status = Ok(());
        for element in &self.elements {
            if let Err(e) = element.lock().storage_finished() {
                status = Err(e);
            }
        }
        status
    }
}

fn build_harness(
    component: &ComponentInput,
    index: usize,
    input: &ModelInput,
    task: &Task,
) -> Result<ElementHarness> {
    let in_info = expand_ports(&component.name, &component.inputs)?;
    let out_info = expand_ports(&component.name, &component.outputs)?;

    let element = create_element(&component.kind, &component.parameters).map_err(|e| {
        SimbusError::Config(format!("element \"{}\": {e}", component.name))
    })?;

    let databus = Databus::setup(
        in_info,
        out_info,
        input.config.nan_check,
        input.config.nan_check_num_messages,
    )?;

    let mut harness = ElementHarness::new(
        component.name.clone(),
        index,
        index as i32,
        element,
        databus,
    );

    if let Some(time_step) = component.time_step {
        harness.set_own_time_step(time_step)?;
    }
    harness.set_sum_time(task.sum_time);
    harness.set_use_inputs_at_end_time(
        component
            .input_at_end_time
            .unwrap_or(task.use_inputs_at_end_time),
    );
    harness.set_max_time_snap_warnings(input.config.time_snap_num_messages);

    harness.setup(task.rt_factor_enabled, task.time_start)?;
    Ok(harness)
}

fn gates_from_input(component: &ComponentInput, input: &ModelInput) -> StorageGates {
    let defaults = &input.results;
    let own = component.results.as_ref();

    StorageGates {
        store_level: own
            .and_then(|r| r.result_level)
            .map(StoreLevel::from),
        start_time: own.and_then(|r| r.start_time).or(defaults.start_time),
        end_time: own.and_then(|r| r.end_time).or(defaults.end_time),
        step_time: own.and_then(|r| r.step_time).or(defaults.step_time),
        step_count: own
            .and_then(|r| r.step_count)
            .or(defaults.step_count)
            .unwrap_or(0),
    }
}

fn expand_ports(component_name: &str, ports: &[PortInput]) -> Result<DatabusInfo> {
    let mut infos: Vec<PortInfo> = Vec::new();
    let mut vectors = Vec::new();

    for port in ports {
        if port.is_vector() {
            let (Some(start), Some(end)) = (port.start_index, port.end_index) else {
                return Err(SimbusError::Config(format!(
                    "vector port {}.{} needs both start_index and end_index",
                    component_name, port.name
                )));
            };
            if end < start {
                return Err(SimbusError::Config(format!(
                    "vector port {}.{}: end_index {end} before start_index {start}",
                    component_name, port.name
                )));
            }

            let first_child = infos.len();
            for i in start..=end {
                let child_name = format!("{}[{i}]", port.name);
                let id = format!("{component_name}.{child_name}");
                infos.push(make_info(port, child_name, id)?);
            }
            vectors.push(VectorPortInfo {
                name: port.name.clone(),
                start_index: start,
                end_index: end,
                first_child,
            });
        } else {
            let id = port
                .id
                .clone()
                .unwrap_or_else(|| format!("{component_name}.{}", port.name));
            infos.push(make_info(port, port.name.clone(), id)?);
        }
    }

    for (i, info) in infos.iter().enumerate() {
        if infos[..i].iter().any(|other| other.name == info.name) {
            return Err(SimbusError::Config(format!(
                "duplicate port name \"{}\" on element \"{component_name}\"",
                info.name
            )));
        }
    }

    Ok(DatabusInfo::new(infos, vectors))
}

fn make_info(port: &PortInput, name: String, id: String) -> Result<PortInfo> {
    let ty = port.port_type;
    if ty == ChannelType::Unknown {
        return Err(SimbusError::Config(format!(
            "port \"{name}\": unknown type"
        )));
    }

    let mut info = PortInfo::new(name, ty, id);
    info.name_in_tool = port.name_in_tool.clone();
    info.description = port.description.clone();
    info.unit = port.unit.clone();
    info.initial_value_is_exact = port.initial_is_exact;
    if let Some(write_result) = port.write_result {
        info.write_result = write_result;
    }

    if let Some(min) = &port.min {
        info.min = Some(value_from_yaml(min, ty)?);
    }
    if let Some(max) = &port.max {
        info.max = Some(value_from_yaml(max, ty)?);
    }
    if let Some(scale) = &port.scale {
        info.scale = Some(value_from_yaml(scale, ty)?);
    }
    if let Some(offset) = &port.offset {
        info.offset = Some(value_from_yaml(offset, ty)?);
    }
    if let Some(default) = &port.default {
        info.default_value = Some(value_from_yaml(default, ty)?);
    }
    if let Some(initial) = &port.initial {
        info.initial_value = Some(value_from_yaml(initial, ty)?);
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::ModelInput;

    fn chain_input() -> ModelInput {
        ModelInput::from_yaml(
            r#"
task:
  delta_time: 0.1
  end_time: 0.3
components:
  - name: source
    kind: constant
    parameters: { value: 7.5 }
    outputs: [ { name: out } ]
  - name: sink
    kind: passthrough
    inputs: [ { name: in } ]
    outputs: [ { name: out } ]
connections:
  - from: source.out
    to: sink.in
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_build_and_initialize_chain() {
        let input = chain_input();
        let task = Task::read(&input.task).unwrap();
        let mut model = Model::build(&input, &task).unwrap();
        model.initialize(0.0).unwrap();

        let sub_model = model.sub_model().unwrap();
        assert_eq!(sub_model.evaluation_list.len(), 2);
        // source must come before sink
        assert_eq!(sub_model.evaluation_list[0].element_index, 0);
        assert_eq!(sub_model.evaluation_list[1].element_index, 1);

        // the sink saw the source's value during initialization
        let sink = model.element_by_name("sink").unwrap().lock();
        assert_eq!(
            sink.databus().output(0).unwrap().value_cell().get_double().unwrap(),
            7.5
        );
    }

    #[test]
    fn test_inverted_connection_rejected() {
        let mut input = chain_input();
        input.connections[0].from = "sink.in".into();
        let task = Task::read(&input.task).unwrap();
        let result = Model::build(&input, &task);
        assert!(matches!(result, Err(SimbusError::Config(_))));
    }

    #[test]
    fn test_unknown_port_rejected() {
        let mut input = chain_input();
        input.connections[0].to = "sink.nonexistent".into();
        let task = Task::read(&input.task).unwrap();
        assert!(Model::build(&input, &task).is_err());
    }

    #[test]
    fn test_duplicate_element_name_rejected() {
        let mut input = chain_input();
        input.components[1].name = "source".into();
        let task = Task::read(&input.task).unwrap();
        assert!(Model::build(&input, &task).is_err());
    }

    #[test]
    fn test_vector_ports_expand() {
        let input = ModelInput::from_yaml(
            r#"
task: { delta_time: 0.1 }
components:
  - name: adder
    kind: sum
    inputs: [ { name: u, start_index: 0, end_index: 2 } ]
    outputs: [ { name: y } ]
"#,
        )
        .unwrap();
        let task = Task::read(&input.task).unwrap();
        let model = Model::build(&input, &task).unwrap();
        let harness = model.elements()[0].lock();
        assert_eq!(harness.databus().num_in_channels(), 3);
        assert_eq!(harness.databus().in_info().info(1).unwrap().name, "u[1]");
        assert_eq!(harness.databus().in_info().vectors().len(), 1);
    }
}
