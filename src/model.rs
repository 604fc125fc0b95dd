//! Top-level model: one commander and device per configured port.
//!
//! `start` builds the devices, announces them to the observer, connects all
//! commanders and launches one poll task per port. Device polling runs on its
//! own cadence (or an injected trigger); `poll` flushes dirty controls to the
//! observer on the driver's publish cadence, decoupled from polling.

use crate::clock::Clock;
use crate::commander::CommanderFactory;
use crate::config::DriverConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::observer::Observer;
use crate::protocol::ProtocolRegistry;
use log::error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lower bound on the per-device poll cycle period.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Running {
    devices: Vec<Arc<Device>>,
    stop: CancellationToken,
    supervisor: JoinHandle<()>,
}

pub struct Model {
    factory: CommanderFactory,
    registry: ProtocolRegistry,
    config: DriverConfig,
    observer: Arc<dyn Observer>,
    clock: Arc<dyn Clock>,
    poll_trigger: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    running: Mutex<Option<Running>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl Model {
    pub fn new(
        factory: CommanderFactory,
        registry: ProtocolRegistry,
        config: DriverConfig,
        observer: Arc<dyn Observer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            factory,
            registry,
            config,
            observer,
            clock,
            poll_trigger: std::sync::Mutex::new(None),
            running: Mutex::new(None),
            ready_tx,
            ready_rx,
        }
    }

    /// Replaces the internal poll pacing with an external trigger channel.
    /// Each message wakes exactly one device poll loop. Must be called
    /// before `start`.
    pub fn set_poll_trigger(&self, trigger: mpsc::Receiver<()>) {
        let mut slot = self
            .poll_trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(trigger);
    }

    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        if self.config.ports.is_empty() {
            return Err(Error::Validation("no ports defined".into()));
        }

        let stop = CancellationToken::new();
        let mut devices = Vec::new();
        for port in &self.config.ports {
            let commander = (self.factory)(port.settings.clone());
            let device = Device::new(commander, &self.registry, port, stop.child_token())
                .map_err(|err| {
                    Error::Validation(format!(
                        "failed to set up device {:?}: {}",
                        port.settings.name, err
                    ))
                })?;
            let device = Arc::new(device);
            self.observer.on_new_device(&device.info());
            devices.push(device);
        }
        if devices.is_empty() {
            return Err(Error::Validation("couldn't open any ports".into()));
        }

        let trigger = self
            .poll_trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .map(|rx| Arc::new(Mutex::new(rx)));
        let supervisor = tokio::spawn(run_devices(
            devices.clone(),
            stop.clone(),
            trigger,
            self.clock.clone(),
            self.ready_tx.clone(),
        ));
        *running = Some(Running {
            devices,
            stop,
            supervisor,
        });
        Ok(())
    }

    /// Resolves once every commander has been online at least once.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Flushes dirty controls of every device to the observer.
    pub async fn poll(&self) {
        let running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            for device in &running.devices {
                device.publish(self.observer.as_ref());
            }
        }
    }

    /// Routes an inbound set from the bus to the owning device.
    pub async fn accept_set(&self, device: &str, control: &str, value: &str) -> bool {
        let target = {
            let running = self.running.lock().await;
            running.as_ref().and_then(|r| {
                r.devices.iter().find(|d| d.name() == device).cloned()
            })
        };
        match target {
            Some(target) => target.accept_set(control, value).await,
            None => {
                error!("set for unknown device {:?}", device);
                false
            }
        }
    }

    /// Stops polling, closes every commander and joins all port tasks.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        let Some(running) = running else { return };
        running.stop.cancel();
        for device in &running.devices {
            device.close().await;
        }
        let _ = running.supervisor.await;
    }
}

async fn run_devices(
    devices: Vec<Arc<Device>>,
    stop: CancellationToken,
    trigger: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
    clock: Arc<dyn Clock>,
    ready_tx: watch::Sender<bool>,
) {
    for device in &devices {
        device.commander().connect().await;
    }
    for device in &devices {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = device.commander().wait_ready() => {}
        }
    }
    let _ = ready_tx.send(true);

    let mut tasks = Vec::new();
    for device in &devices {
        tasks.push(tokio::spawn(poll_loop(
            device.clone(),
            stop.clone(),
            trigger.clone(),
            clock.clone(),
        )));
    }
    for task in tasks {
        let _ = task.await;
    }
}

async fn poll_loop(
    device: Arc<Device>,
    stop: CancellationToken,
    trigger: Option<Arc<Mutex<mpsc::Receiver<()>>>>,
    clock: Arc<dyn Clock>,
) {
    loop {
        let next_at = clock.now() + MIN_POLL_INTERVAL;
        match &trigger {
            Some(trigger) => {
                let mut rx = trigger.lock().await;
                tokio::select! {
                    _ = stop.cancelled() => break,
                    received = rx.recv() => {
                        if received.is_none() {
                            break;
                        }
                    }
                }
            }
            None => {
                if stop.is_cancelled() {
                    break;
                }
            }
        }
        device.poll().await;
        let now = clock.now();
        if next_at > now {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = clock.sleep(next_at - now) => {}
            }
        }
    }
}
