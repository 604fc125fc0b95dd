//! Per-port device: runtime controls, the poll loop body, and the inbound
//! set path.
//!
//! A device owns one commander and the runtime parameters built by its
//! protocol adapter. Polling reads every pollable parameter and records fresh
//! values on the controls; publication is decoupled and driven by the model
//! on the bus cadence, flushing only controls whose value actually changed.

use crate::commander::Commander;
use crate::config::{ControlSpec, PortConfig, PortSettings};
use crate::error::{Error, Result};
use crate::observer::{ControlMeta, DeviceInfo, Observer, Writability};
use crate::protocol::{ParamValue, Parameter, ParameterSpec, Protocol, ProtocolRegistry};
use log::error;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

pub const ID_CONTROL_NAME: &str = "id";

fn id_control_spec() -> ControlSpec {
    ControlSpec {
        name: ID_CONTROL_NAME.into(),
        title: ID_CONTROL_NAME.into(),
        control_type: "text".into(),
        ..Default::default()
    }
}

#[derive(Default)]
struct ControlState {
    value: String,
    dirty: bool,
    sent: bool,
    writing: bool,
}

/// Runtime state of one control.
pub struct DeviceControl {
    config: ControlSpec,
    settable: Option<Arc<dyn Parameter>>,
    /// Whether a changed polled value is republished after the first send.
    /// False only for the id control of a port without resync.
    republish_on_change: bool,
    state: Mutex<ControlState>,
}

impl DeviceControl {
    fn new(
        config: ControlSpec,
        settable: Option<Arc<dyn Parameter>>,
        republish_on_change: bool,
    ) -> Self {
        Self {
            config,
            settable,
            republish_on_change,
            state: Mutex::new(ControlState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn was_polled(&self) -> bool {
        let state = self.lock();
        state.dirty || state.sent
    }

    /// Records a freshly polled value. Discarded while a write is in
    /// progress so the poll cannot overwrite the user's value mid-set. A
    /// value equal to the last published one is not republished.
    fn set_value_from_device(&self, value: &ParamValue) {
        let mut state = self.lock();
        if state.writing {
            return;
        }
        let value = self.config.transform_device_value(value);
        let changed = value != state.value;
        state.value = value;
        state.dirty = !state.sent
            || (changed && self.config.should_poll() && self.republish_on_change);
    }

    fn start_write(&self, value: &str) {
        let mut state = self.lock();
        state.value = value.to_string();
        state.dirty = false;
        state.writing = true;
    }

    fn end_write(&self) {
        self.lock().writing = false;
    }

    fn writability(&self) -> Writability {
        if self.config.control_type == "pushbutton" {
            Writability::DeviceDefault
        } else if self.config.writable {
            Writability::ForceWritable
        } else {
            Writability::ForceReadOnly
        }
    }

    fn title(&self) -> String {
        if self.config.title == self.config.name {
            // auto title
            String::new()
        } else {
            self.config.title.clone()
        }
    }

    /// Publishes the control if dirty: full metadata on the first send,
    /// value-only afterwards. Safe to call concurrently with polling.
    fn publish(&self, device: &str, observer: &dyn Observer) {
        let mut state = self.lock();
        if !state.dirty {
            return;
        }
        state.dirty = false;
        if !state.sent {
            state.sent = true;
            let meta = ControlMeta {
                name: self.config.name.clone(),
                title: self.title(),
                control_type: self.config.control_type.clone(),
                units: self.config.units.clone(),
                value: state.value.clone(),
                writability: self.writability(),
            };
            drop(state);
            observer.on_new_control(device, &meta);
        } else {
            let value = state.value.clone();
            drop(state);
            observer.on_value(device, &self.config.name, &value);
        }
    }
}

struct DeviceParameter {
    param: Arc<dyn Parameter>,
    should_poll: bool,
    /// Controls of a non-polled parameter that are reset to empty on each
    /// cycle.
    non_polled_controls: Vec<String>,
}

/// One configured port at runtime.
pub struct Device {
    name: String,
    title: String,
    settings: Arc<PortSettings>,
    commander: Arc<dyn Commander>,
    protocol: Box<dyn Protocol>,
    parameters: Vec<DeviceParameter>,
    controls: HashMap<String, Arc<DeviceControl>>,
    id_control: Arc<DeviceControl>,
    /// id first, then merged controls in first-appearance order.
    publish_order: Vec<String>,
    stop: CancellationToken,
}

impl Device {
    pub fn new(
        commander: Arc<dyn Commander>,
        registry: &ProtocolRegistry,
        port: &PortConfig,
        stop: CancellationToken,
    ) -> Result<Self> {
        let protocol = registry.create(port)?;
        let resolved = port.resolve_controls()?;

        let params: Vec<Arc<dyn Parameter>> = port
            .parameters
            .iter()
            .map(|spec| protocol.parameter(spec).map(Arc::from))
            .collect::<Result<_>>()?;

        let title = if port.settings.title.is_empty() {
            port.settings.name.clone()
        } else {
            port.settings.title.clone()
        };

        let id_control = Arc::new(DeviceControl::new(
            id_control_spec(),
            None,
            port.settings.resync,
        ));
        let mut controls = HashMap::new();
        controls.insert(ID_CONTROL_NAME.to_string(), id_control.clone());
        let mut publish_order = vec![ID_CONTROL_NAME.to_string()];
        for spec in resolved.controls {
            let settable = resolved
                .settable
                .get(&spec.name)
                .map(|&index| params[index].clone());
            publish_order.push(spec.name.clone());
            controls.insert(
                spec.name.clone(),
                Arc::new(DeviceControl::new(spec, settable, true)),
            );
        }

        let parameters = port
            .parameters
            .iter()
            .zip(&params)
            .map(|(spec, param)| DeviceParameter {
                param: param.clone(),
                should_poll: spec.should_poll(),
                non_polled_controls: non_polled_controls(spec),
            })
            .collect();

        Ok(Self {
            name: port.settings.name.clone(),
            title,
            settings: port.settings.clone(),
            commander,
            protocol,
            parameters,
            controls,
            id_control,
            publish_order,
            stop,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            name: self.name.clone(),
            title: self.title.clone(),
        }
    }

    pub fn commander(&self) -> &Arc<dyn Commander> {
        &self.commander
    }

    /// Protocol errors mean the stream is desynchronised; everything else is
    /// either already handled by the commander or purely local.
    async fn handle_exchange_error(&self, err: &Error) {
        if matches!(err, Error::Protocol(_)) {
            self.commander.reset().await;
        }
    }

    async fn identify(&self) -> bool {
        match self.protocol.identify(self.commander.as_ref()).await {
            Ok(id) => {
                self.id_control.set_value_from_device(&ParamValue::Str(id));
                true
            }
            Err(err) => {
                if !self.stop.is_cancelled() {
                    error!("Identify() failed for device {}: {}", self.name, err);
                    self.handle_exchange_error(&err).await;
                }
                false
            }
        }
    }

    /// One poll cycle: refresh the id if needed, then query every pollable
    /// parameter, marking updated controls dirty. Errors are logged and the
    /// cycle continues with the next parameter.
    pub async fn poll(&self) {
        if (self.settings.resync || !self.id_control.was_polled()) && !self.identify().await {
            return;
        }

        for parameter in &self.parameters {
            if !parameter.should_poll {
                for name in &parameter.non_polled_controls {
                    if let Some(control) = self.controls.get(name) {
                        control.set_value_from_device(&ParamValue::Str(String::new()));
                    }
                }
                continue;
            }
            let mut handler = |name: &str, value: ParamValue| match self.controls.get(name) {
                Some(control) => control.set_value_from_device(&value),
                None => error!("adapter reported unknown control {:?}", name),
            };
            if let Err(err) = parameter
                .param
                .query(self.commander.as_ref(), &mut handler)
                .await
            {
                if !self.stop.is_cancelled() {
                    error!(
                        "failed to read {} from {:?}: {}",
                        parameter.param.name(),
                        self.name,
                        err
                    );
                    self.handle_exchange_error(&err).await;
                }
            }
        }
    }

    /// Flushes dirty controls to the observer in stable order.
    pub fn publish(&self, observer: &dyn Observer) {
        for name in &self.publish_order {
            if let Some(control) = self.controls.get(name) {
                control.publish(&self.name, observer);
            }
        }
    }

    /// Inbound set from the bus. Returns false when the control is unknown,
    /// read-only, or has no settable parameter bound.
    pub async fn accept_set(&self, name: &str, value: &str) -> bool {
        let Some(control) = self.controls.get(name) else {
            error!("unknown control {:?} for device {:?}", name, self.name);
            return false;
        };
        if !control.config.writable {
            error!(
                "trying to set value {:?} for non-writable control {}/{}",
                value, self.name, name
            );
            return false;
        }
        let Some(param) = control.settable.clone() else {
            error!(
                "no settable parameter for control {:?} in device {:?}",
                name, self.name
            );
            return false;
        };
        control.start_write(value);
        if let Err(err) = param.set(self.commander.as_ref(), name, value).await {
            error!("failed to set {}/{} to {:?}: {}", self.name, name, value, err);
            self.handle_exchange_error(&err).await;
        }
        control.end_write();
        true
    }

    pub async fn close(&self) {
        self.commander.close().await;
    }
}

fn non_polled_controls(spec: &ParameterSpec) -> Vec<String> {
    spec.controls()
        .iter()
        .filter(|control| !control.should_poll())
        .map(|control| control.name.clone())
        .collect()
}
