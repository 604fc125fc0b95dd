//! Per-port connection and command state machine.
//!
//! Each configured port owns one [`DeviceCommander`]. It dials the transport,
//! runs the optional setup script, serialises all outbound commands into a
//! FIFO queue with at most one command in flight, and reconnects with a fixed
//! backoff whenever the stream fails.
//!
//! The machine is a sum type over five states:
//!
//! ```text
//!             Connect                Connected
//!   Offline ----------> Connecting ------------> Online <-----+
//!      ^                    |  ^                   |          | CommandFinished
//!      |       ConnectFailed|  |TimerFired  Command|          | (queue empty)
//!      |                    v  |                   v          |
//!      +--------------- ReconnectWait <--------- Busy --------+
//!        Disconnect              CommandFailed / Reset
//! ```
//!
//! Every event is applied under a single per-commander mutex; entering a
//! state may spawn a background task (dial, setup, send, timer). Background
//! tasks re-enter the machine through [`Inner::dispatch`] with the generation
//! number of the state that spawned them, so work belonging to a superseded
//! state is discarded instead of corrupting its successor. Teardown (cancel,
//! join, close) always runs after the state mutex is released.

use crate::clock::Clock;
use crate::config::PortSettings;
use crate::error::{Error, Result};
use crate::framer::{LineEnding, LineFramer};
use crate::lf_filter::adapt_cr_stream;
use crate::transport::{ByteStream, Transport};
use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, error, warn};
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Read deadline for a single command/response exchange.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Fixed pause between reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Command/connection interface the rest of the daemon works against.
#[async_trait]
pub trait Commander: Send + Sync {
    /// Starts connecting. Non-blocking; progress is observable via
    /// [`Commander::wait_ready`].
    async fn connect(&self);

    /// Resolves once the commander has a live connection. Resolves
    /// immediately when already online.
    async fn wait_ready(&self);

    /// Sends one command and returns the raw response payload. Commands from
    /// concurrent callers are serialised in arrival order.
    async fn query(&self, command: &str) -> Result<Vec<u8>>;

    /// Drops the current connection and schedules a reconnect. Used when a
    /// protocol adapter detects that the stream is out of sync.
    async fn reset(&self);

    /// Disconnects and stops all background work. Idempotent; returns only
    /// after any owned connection has been closed.
    async fn close(&self);
}

/// Builds commanders for the model; tests substitute their own factory.
pub type CommanderFactory = Box<dyn Fn(Arc<PortSettings>) -> Arc<dyn Commander> + Send + Sync>;

pub fn default_commander_factory(
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
) -> CommanderFactory {
    Box::new(move |settings| {
        Arc::new(DeviceCommander::new(
            transport.clone(),
            settings,
            clock.clone(),
        ))
    })
}

struct CommandItem {
    command: String,
    responder: Option<oneshot::Sender<Result<Vec<u8>>>>,
}

impl CommandItem {
    fn fail(&mut self, err: Error) {
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(Err(err));
        }
    }
}

struct TaskHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

enum State {
    Offline,
    Connecting(TaskHandle),
    ReconnectWait(TaskHandle),
    Online,
    Busy {
        queue: VecDeque<CommandItem>,
        task: TaskHandle,
    },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Offline => "offline",
            State::Connecting(_) => "connecting",
            State::ReconnectWait(_) => "reconnect-wait",
            State::Online => "online",
            State::Busy { .. } => "busy",
        }
    }
}

/// Target of a transition; [`Machine::enter`] turns it into the actual state,
/// spawning whatever background work the state needs.
enum Pending {
    Offline,
    Connecting,
    ReconnectWait,
    Online,
    Busy(VecDeque<CommandItem>),
}

enum InternalEvent {
    Connected(LineFramer),
    ConnectFailed,
    TimerFired,
    CommandFinished(LineFramer),
    CommandFailed,
}

enum Event {
    Connect,
    Disconnect,
    Reset,
    Command(CommandItem),
    /// Posted by a background task, tagged with the generation of the state
    /// that spawned it.
    Internal(u64, InternalEvent),
}

/// Deferred cleanup collected during a transition and executed after the
/// state mutex is released.
#[derive(Default)]
struct Teardown {
    handles: Vec<TaskHandle>,
    framers: Vec<LineFramer>,
}

impl Teardown {
    fn handle(&mut self, handle: TaskHandle) {
        self.handles.push(handle);
    }

    async fn run(self) {
        for handle in self.handles {
            handle.stop.cancel();
            let _ = handle.task.await;
        }
        // dropping a framer closes its connection
        drop(self.framers);
    }
}

struct Machine {
    state: State,
    /// Bumped on every state entry; internal events from older generations
    /// are ignored.
    generation: u64,
    /// Connection held while Online. While Busy it is owned by the in-flight
    /// send task.
    framer: Option<LineFramer>,
    ready_waiters: Vec<oneshot::Sender<()>>,
}

struct Inner {
    settings: Arc<PortSettings>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    machine: Mutex<Machine>,
}

/// The production [`Commander`]: one per configured port.
pub struct DeviceCommander {
    inner: Arc<Inner>,
}

impl DeviceCommander {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: Arc<PortSettings>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                transport,
                clock,
                machine: Mutex::new(Machine {
                    state: State::Offline,
                    generation: 0,
                    framer: None,
                    ready_waiters: Vec::new(),
                }),
            }),
        }
    }
}

#[async_trait]
impl Commander for DeviceCommander {
    async fn connect(&self) {
        self.inner.dispatch(Event::Connect).await;
    }

    async fn wait_ready(&self) {
        let rx = {
            let mut machine = self.inner.machine.lock().await;
            if matches!(machine.state, State::Online | State::Busy { .. }) {
                return;
            }
            let (tx, rx) = oneshot::channel();
            machine.ready_waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    async fn query(&self, command: &str) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let item = CommandItem {
            command: command.to_string(),
            responder: Some(tx),
        };
        self.inner.dispatch(Event::Command(item)).await;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Disconnected),
        }
    }

    async fn reset(&self) {
        self.inner.dispatch(Event::Reset).await;
    }

    async fn close(&self) {
        self.inner.dispatch(Event::Disconnect).await;
    }
}

impl Inner {
    async fn dispatch(self: &Arc<Self>, event: Event) {
        let mut teardown = Teardown::default();
        {
            let mut machine = self.machine.lock().await;
            let mut next = machine.apply(event, &mut teardown);
            while let Some(pending) = next {
                next = machine.enter(self, pending, &mut teardown);
            }
        }
        teardown.run().await;
    }
}

impl Machine {
    fn apply(&mut self, event: Event, teardown: &mut Teardown) -> Option<Pending> {
        match event {
            Event::Connect => match self.state {
                State::Offline => Some(Pending::Connecting),
                _ => None,
            },
            Event::Disconnect => self.disconnect(teardown),
            Event::Reset => self.reset(teardown),
            Event::Command(item) => self.command(item),
            Event::Internal(generation, internal) => {
                if generation != self.generation {
                    // A task belonging to a superseded state: discard the
                    // event, closing any connection it carried.
                    match internal {
                        InternalEvent::Connected(framer)
                        | InternalEvent::CommandFinished(framer) => teardown.framers.push(framer),
                        _ => {}
                    }
                    return None;
                }
                self.internal(internal, teardown)
            }
        }
    }

    fn disconnect(&mut self, teardown: &mut Teardown) -> Option<Pending> {
        match mem::replace(&mut self.state, State::Offline) {
            State::Offline => None,
            State::Connecting(handle) | State::ReconnectWait(handle) => {
                teardown.handle(handle);
                Some(Pending::Offline)
            }
            State::Online => {
                if let Some(framer) = self.framer.take() {
                    teardown.framers.push(framer);
                }
                Some(Pending::Offline)
            }
            State::Busy { mut queue, task } => {
                teardown.handle(task);
                // the in-flight head is failed by its own task on cancel
                for item in queue.iter_mut() {
                    item.fail(Error::Disconnected);
                }
                Some(Pending::Offline)
            }
        }
    }

    fn reset(&mut self, teardown: &mut Teardown) -> Option<Pending> {
        match mem::replace(&mut self.state, State::Offline) {
            State::Online => {
                if let Some(framer) = self.framer.take() {
                    teardown.framers.push(framer);
                }
                Some(Pending::ReconnectWait)
            }
            State::Busy { mut queue, task } => {
                teardown.handle(task);
                for item in queue.iter_mut() {
                    item.fail(Error::Disconnected);
                }
                Some(Pending::ReconnectWait)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    fn command(&mut self, mut item: CommandItem) -> Option<Pending> {
        match &mut self.state {
            State::Online => Some(Pending::Busy(VecDeque::from([item]))),
            State::Busy { queue, .. } => {
                queue.push_back(item);
                None
            }
            _ => {
                item.fail(Error::NotConnected);
                None
            }
        }
    }

    fn internal(&mut self, event: InternalEvent, teardown: &mut Teardown) -> Option<Pending> {
        match (mem::replace(&mut self.state, State::Offline), event) {
            (State::Connecting(_), InternalEvent::Connected(framer)) => {
                self.framer = Some(framer);
                Some(Pending::Online)
            }
            (State::Connecting(_), InternalEvent::ConnectFailed) => Some(Pending::ReconnectWait),
            (State::ReconnectWait(_), InternalEvent::TimerFired) => Some(Pending::Connecting),
            (State::Busy { mut queue, .. }, InternalEvent::CommandFinished(framer)) => {
                self.framer = Some(framer);
                queue.pop_front();
                if queue.is_empty() {
                    Some(Pending::Online)
                } else {
                    Some(Pending::Busy(queue))
                }
            }
            (State::Busy { mut queue, .. }, InternalEvent::CommandFailed) => {
                // the head already received its error from the send task
                queue.pop_front();
                for item in queue.iter_mut() {
                    item.fail(Error::Disconnected);
                }
                Some(Pending::ReconnectWait)
            }
            (other, event) => {
                // generation matched but the state does not expect this
                // event; keep the state and salvage any carried connection
                if let InternalEvent::Connected(framer) | InternalEvent::CommandFinished(framer) =
                    event
                {
                    teardown.framers.push(framer);
                }
                self.state = other;
                None
            }
        }
    }

    fn enter(
        &mut self,
        inner: &Arc<Inner>,
        pending: Pending,
        _teardown: &mut Teardown,
    ) -> Option<Pending> {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let next = match pending {
            Pending::Offline => {
                self.state = State::Offline;
                None
            }
            Pending::Online => {
                for waiter in self.ready_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                self.state = State::Online;
                None
            }
            Pending::Connecting => {
                let stop = CancellationToken::new();
                let task = tokio::spawn(run_connect(inner.clone(), generation, stop.clone()));
                self.state = State::Connecting(TaskHandle { stop, task });
                None
            }
            Pending::ReconnectWait => {
                let stop = CancellationToken::new();
                // acquire the timer synchronously so the delay starts now
                let sleep = inner.clock.sleep(RECONNECT_DELAY);
                let task = tokio::spawn(run_reconnect_timer(
                    inner.clone(),
                    generation,
                    stop.clone(),
                    sleep,
                ));
                self.state = State::ReconnectWait(TaskHandle { stop, task });
                None
            }
            Pending::Busy(mut queue) => {
                let Some(framer) = self.framer.take() else {
                    for item in queue.iter_mut() {
                        item.fail(Error::NotConnected);
                    }
                    return Some(Pending::Offline);
                };
                let Some(head) = queue.front_mut() else {
                    self.framer = Some(framer);
                    return Some(Pending::Online);
                };
                let command = head.command.clone();
                let responder = head.responder.take();
                let stop = CancellationToken::new();
                let task = tokio::spawn(run_send(
                    inner.clone(),
                    generation,
                    stop.clone(),
                    framer,
                    command,
                    responder,
                ));
                self.state = State::Busy {
                    queue,
                    task: TaskHandle { stop, task },
                };
                None
            }
        };
        debug!(
            "commander {}: entered {}",
            inner.settings.port,
            self.state.name()
        );
        next
    }
}

async fn run_connect(inner: Arc<Inner>, generation: u64, stop: CancellationToken) {
    debug!("connecting to {}", inner.settings.port);
    let dial = inner.transport.connect(&inner.settings.port);
    let result = tokio::select! {
        // dropping the dial future discards any stream it would have produced
        _ = stop.cancelled() => return,
        result = dial => result,
    };
    let stream = match result {
        Ok(stream) => stream,
        Err(err) => {
            warn!("error connecting to {:?}: {}", inner.settings.port, err);
            inner
                .dispatch(Event::Internal(generation, InternalEvent::ConnectFailed))
                .await;
            return;
        }
    };
    debug!("connected to {}", inner.settings.port);

    // CR-only ports are driven with CRLF framing through the LF filter pair,
    // so the device sees bare CRs while line reads stay LF-based.
    let (stream, ending): (Box<dyn ByteStream>, LineEnding) = match inner.settings.line_ending {
        LineEnding::Cr => (Box::new(adapt_cr_stream(stream)), LineEnding::Crlf),
        other => (stream, other),
    };
    let mut framer = LineFramer::new(
        stream,
        ending,
        inner.settings.command_timeout(),
        inner.clock.clone(),
    );

    let setup = run_setup(&inner, &mut framer);
    let result = tokio::select! {
        _ = stop.cancelled() => return,
        result = setup => result,
    };
    match result {
        Err(err) => {
            warn!("setup failed for {:?}: {}", inner.settings.port, err);
            drop(framer);
            inner
                .dispatch(Event::Internal(generation, InternalEvent::ConnectFailed))
                .await;
        }
        Ok(()) => {
            debug!("setup done for {}", inner.settings.port);
            inner
                .dispatch(Event::Internal(generation, InternalEvent::Connected(framer)))
                .await;
        }
    }
}

/// Runs the port's setup script. Any error, including an unexpected response
/// to an item that declares one, fails the connect attempt.
async fn run_setup(inner: &Inner, framer: &mut LineFramer) -> Result<()> {
    for item in &inner.settings.setup {
        let command = format!("{}{}", inner.settings.prefix, item.command);
        let resp = framer.send(&command, !item.response.is_empty()).await?;
        if !item.response.is_empty() && resp != item.response.as_bytes() {
            return Err(Error::Protocol(format!(
                "unexpected response {:?} to {:?}",
                String::from_utf8_lossy(&resp),
                item.command
            )));
        }
    }
    Ok(())
}

async fn run_reconnect_timer(
    inner: Arc<Inner>,
    generation: u64,
    stop: CancellationToken,
    sleep: BoxFuture<'static, ()>,
) {
    tokio::select! {
        _ = stop.cancelled() => {}
        _ = sleep => {
            inner
                .dispatch(Event::Internal(generation, InternalEvent::TimerFired))
                .await;
        }
    }
}

fn respond(responder: Option<oneshot::Sender<Result<Vec<u8>>>>, result: Result<Vec<u8>>) {
    if let Some(tx) = responder {
        let _ = tx.send(result);
    }
}

async fn run_send(
    inner: Arc<Inner>,
    generation: u64,
    stop: CancellationToken,
    mut framer: LineFramer,
    command: String,
    responder: Option<oneshot::Sender<Result<Vec<u8>>>>,
) {
    let delay = inner.settings.command_delay();
    if !delay.is_zero() {
        let cancelled = tokio::select! {
            _ = stop.cancelled() => true,
            _ = inner.clock.sleep(delay) => false,
        };
        if cancelled {
            respond(responder, Err(Error::Disconnected));
            return;
        }
    }

    let full = format!("{}{}", inner.settings.prefix, command);
    enum Outcome {
        Stopped,
        Done(Result<Vec<u8>>),
    }
    let outcome = tokio::select! {
        _ = stop.cancelled() => Outcome::Stopped,
        result = framer.send(&full, true) => Outcome::Done(result),
    };
    match outcome {
        Outcome::Stopped => {
            respond(responder, Err(Error::Disconnected));
        }
        Outcome::Done(Ok(resp)) => {
            respond(responder, Ok(resp));
            inner
                .dispatch(Event::Internal(
                    generation,
                    InternalEvent::CommandFinished(framer),
                ))
                .await;
        }
        Outcome::Done(Err(err)) => {
            error!("error executing the command: {}", err);
            let timeout = err.is_timeout();
            respond(responder, Err(err));
            if timeout {
                // timeouts are a per-command condition; the connection stays
                inner
                    .dispatch(Event::Internal(
                        generation,
                        InternalEvent::CommandFinished(framer),
                    ))
                    .await;
            } else {
                drop(framer);
                inner
                    .dispatch(Event::Internal(generation, InternalEvent::CommandFailed))
                    .await;
            }
        }
    }
}
