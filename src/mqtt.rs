//! MQTT integration.
//!
//! Thin adapter between the [`Observer`] seam and an MQTT broker. Controls
//! live under `/devices/<device>/controls/<control>` with retained
//! `meta/...` companions; writable controls are subscribed at `.../on` and
//! inbound messages there are routed into the model's set path.

use crate::error::{Error, Result};
use crate::model::Model;
use crate::observer::{ControlMeta, DeviceInfo, Observer, Writability};
use log::{error, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DRIVER_CLIENT_ID: &str = "instrument-bridge";

#[derive(Default)]
struct ObserverState {
    /// Next `meta/order` value per device.
    next_order: HashMap<String, usize>,
    /// Controls whose values are published without the retain flag
    /// (pushbuttons).
    non_retained: HashSet<(String, String)>,
}

pub struct MqttObserver {
    client: AsyncClient,
    state: Mutex<ObserverState>,
}

/// Splits `tcp://host:port` (or bare `host:port`) into host and port.
fn parse_broker(url: &str) -> Result<(String, u16)> {
    let host_port = url.strip_prefix("tcp://").unwrap_or(url);
    match host_port.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::Validation(format!("bad broker url {:?}", url)))?;
            Ok((host.to_string(), port))
        }
        None => Ok((host_port.to_string(), 1883)),
    }
}

/// Matches `/devices/<device>/controls/<control>/on`.
fn parse_set_topic(topic: &str) -> Option<(String, String)> {
    let rest = topic.strip_prefix("/devices/")?;
    let (device, rest) = rest.split_once('/')?;
    let rest = rest.strip_prefix("controls/")?;
    let (control, rest) = rest.split_once('/')?;
    if rest != "on" || device.is_empty() || control.is_empty() {
        return None;
    }
    Some((device.to_string(), control.to_string()))
}

impl MqttObserver {
    /// Connects to the broker; the returned event loop must be driven with
    /// [`run`].
    pub fn connect(broker: &str) -> Result<(Arc<Self>, EventLoop)> {
        let (host, port) = parse_broker(broker)?;
        let mut options = MqttOptions::new(DRIVER_CLIENT_ID, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 100);
        let observer = Arc::new(Self {
            client,
            state: Mutex::new(ObserverState::default()),
        });
        Ok((observer, eventloop))
    }

    fn publish(&self, topic: String, payload: &str, retained: bool) {
        if let Err(err) = self
            .client
            .try_publish(&topic, QoS::AtLeastOnce, retained, payload)
        {
            error!("failed to publish {}: {}", topic, err);
        }
    }
}

impl Observer for MqttObserver {
    fn on_new_device(&self, device: &DeviceInfo) {
        self.publish(
            format!("/devices/{}/meta/name", device.name),
            &device.title,
            true,
        );
    }

    fn on_new_control(&self, device: &str, control: &ControlMeta) {
        let (order, retained) = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let order = state.next_order.entry(device.to_string()).or_insert(0);
            *order += 1;
            let current = *order;
            let retained = control.control_type != "pushbutton";
            if !retained {
                state
                    .non_retained
                    .insert((device.to_string(), control.name.clone()));
            }
            (current, retained)
        };

        let base = format!("/devices/{}/controls/{}", device, control.name);
        self.publish(format!("{}/meta/type", base), &control.control_type, true);
        if !control.title.is_empty() {
            self.publish(format!("{}/meta/name", base), &control.title, true);
        }
        if !control.units.is_empty() {
            self.publish(format!("{}/meta/units", base), &control.units, true);
        }
        match control.writability {
            Writability::ForceReadOnly => {
                self.publish(format!("{}/meta/readonly", base), "1", true)
            }
            Writability::ForceWritable => {
                self.publish(format!("{}/meta/writable", base), "1", true)
            }
            Writability::DeviceDefault => {}
        }
        self.publish(format!("{}/meta/order", base), &order.to_string(), true);
        self.publish(base.clone(), &control.value, retained);

        if control.writability.is_writable() {
            if let Err(err) = self
                .client
                .try_subscribe(format!("{}/on", base), QoS::AtLeastOnce)
            {
                error!("failed to subscribe {}/on: {}", base, err);
            }
        }
    }

    fn on_value(&self, device: &str, control: &str, value: &str) {
        let retained = {
            let state = self
                .state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            !state
                .non_retained
                .contains(&(device.to_string(), control.to_string()))
        };
        self.publish(
            format!("/devices/{}/controls/{}", device, control),
            value,
            retained,
        );
    }
}

/// Drives the MQTT event loop, routing `.../on` publications into the
/// model's set path. An accepted set is echoed back on the value topic; a
/// later poll corrects it if the instrument disagrees. Runs until the task
/// is aborted.
pub async fn run(model: Arc<Model>, observer: Arc<MqttObserver>, mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if let Some((device, control)) = parse_set_topic(&publish.topic) {
                    let value = String::from_utf8_lossy(&publish.payload).to_string();
                    if model.accept_set(&device, &control, &value).await {
                        observer.on_value(&device, &control, &value);
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                warn!("mqtt connection error: {}", err);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
