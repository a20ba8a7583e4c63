use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use alarmctl_core::{
    command_topic, encode_command, parse_status, status_topics, AlarmEvent, Command, Device, DeviceId, FanOut,
    Observer, ObserverId, Reconciler, Snapshot,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, SubscribeReasonCode};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::{BrokerConfig, Endpoint};
use crate::error::{LinkError, ServiceError};
use crate::fsm::{ConnectionMachine, ConnectionState, Effect, Input, Rejected};
use crate::transport::Transport;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Clone, Default)]
pub struct AlarmService {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    link: Mutex<Link>,
    outbox: Mutex<Outbox>,
    devices: Reconciler,
    observers: FanOut,
}

#[derive(Default)]
struct Link {
    machine: ConnectionMachine,
    // bumped on every connect/disconnect; driver input tagged with an older value is dropped
    generation: u64,
    transport: Option<Arc<dyn Transport>>,
    driver: Option<JoinHandle<()>>,
}

// Single drainer keeps delivery in transition order.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<AlarmEvent>,
    draining: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

impl AlarmService {
    pub fn new() -> Self {
        Self::default()
    }

    // Rejected while a link is connecting, connected or retrying.
    pub fn connect(&self, config: BrokerConfig) -> Result<(), ServiceError> {
        let runtime = Handle::try_current().map_err(|_| ServiceError::NoRuntime)?;
        let (client, eventloop) = build_client(&config)?;
        let generation = self.attach(config.max_retries, Arc::new(client))?;
        info!(url = %config.url, client_id = %config.client_id, generation, "Connecting to MQTT broker");

        let driver = runtime.spawn(run_eventloop(self.clone(), generation, eventloop, config));
        let mut link = self.inner.lock_link();
        if link.generation == generation {
            link.driver = Some(driver);
        } else {
            // disconnected before the driver got registered
            driver.abort();
        }
        Ok(())
    }

    pub fn disconnect(&self) {
        let (transport, driver) = {
            let mut link = self.inner.lock_link();
            let effects = link.machine.step(Input::Disconnect).unwrap_or_default();
            if effects.is_empty() && link.transport.is_none() && link.driver.is_none() {
                return;
            }
            link.generation += 1;
            self.inner.enqueue(&effects);
            (link.transport.take(), link.driver.take())
        };
        if let Some(transport) = transport {
            if let Err(err) = transport.disconnect() {
                debug!(error = %err, "MQTT disconnect request not queued");
            }
        }
        if let Some(driver) = driver {
            driver.abort();
        }
        info!("MQTT client disconnected");
        self.inner.flush();
    }

    // true means handed to the client, not acked by the broker
    pub fn publish(&self, device: DeviceId, active: bool) -> bool {
        let transport = {
            let link = self.inner.lock_link();
            let state = link.machine.state();
            match &link.transport {
                Some(transport) if state.is_connected() => transport.clone(),
                _ => {
                    debug!(%device, %state, "Skipping publish: MQTT client not connected");
                    return false;
                }
            }
        };

        let topic = command_topic(device);
        let payload = encode_command(active);
        match transport.publish(&topic, payload.as_bytes()) {
            Ok(()) => {
                info!(%device, topic = %topic, payload = %payload, "Command sent");
                true
            }
            Err(err) => {
                let err = LinkError::PublishRejected {
                    topic,
                    reason: err.to_string(),
                };
                warn!(%device, error = %err, "MQTT publish failed");
                self.inner.enqueue_event(AlarmEvent::ConnectionError(err.to_string()));
                self.inner.flush();
                false
            }
        }
    }

    pub fn publish_all(&self, active: bool) -> usize {
        let mut submitted = 0;
        for device in DeviceId::all() {
            if self.publish(device, active) {
                submitted += 1;
            }
        }
        submitted
    }

    pub fn execute(&self, command: Command) -> Result<usize, ServiceError> {
        if !self.is_connected() {
            warn!(?command, "Rejecting command: MQTT client not connected");
            return Err(ServiceError::NotConnected);
        }
        let active = command.active();
        let mut submitted = 0;
        for device in command.targets() {
            if self.publish(device, active) {
                submitted += 1;
            }
        }
        match command {
            Command::Set { device, .. } => self.inner.devices.apply_optimistic(device, active),
            Command::SetAll(_) => self.inner.devices.apply_optimistic_all(active),
        }
        Ok(submitted)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock_link().machine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    pub fn get_all(&self) -> Snapshot {
        self.inner.devices.get_all()
    }

    pub fn device(&self, device: DeviceId) -> Device {
        self.inner.devices.get(device)
    }

    pub fn active_count(&self) -> usize {
        self.inner.devices.active_count()
    }

    pub fn register(&self, observer: Arc<dyn Observer>) -> ObserverId {
        self.inner.observers.register(observer)
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        self.inner.observers.unregister(id)
    }

    fn attach(&self, max_retries: u32, transport: Arc<dyn Transport>) -> Result<u64, ServiceError> {
        let mut link = self.inner.lock_link();
        link.machine
            .connect(max_retries)
            .map_err(|Rejected(state)| ServiceError::AlreadyActive(state))?;
        link.generation += 1;
        link.transport = Some(transport);
        link.driver = None;
        Ok(link.generation)
    }

    fn step(&self, generation: u64, input: Input) -> Flow {
        let (effects, transport, state) = {
            let mut link = self.inner.lock_link();
            if link.generation != generation {
                return Flow::Stop;
            }
            let effects = link.machine.step(input).unwrap_or_default();
            self.inner.enqueue(&effects);
            let transport = if effects.contains(&Effect::Terminate) {
                link.driver = None;
                link.transport.take()
            } else {
                link.transport.clone()
            };
            (effects, transport, link.machine.state())
        };

        if let Some(transport) = transport {
            for effect in &effects {
                match effect {
                    Effect::Subscribe => subscribe_status(transport.as_ref()),
                    Effect::Terminate => {
                        warn!(generation, "Giving up on MQTT broker");
                        if let Err(err) = transport.disconnect() {
                            debug!(error = %err, "MQTT disconnect request not queued");
                        }
                    }
                    Effect::Emit(_) => {}
                }
            }
        }
        self.inner.flush();

        if state.is_active() {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    fn route_message(&self, generation: u64, topic: &str, payload: &[u8]) -> Flow {
        let payload = String::from_utf8_lossy(payload);
        debug!(topic, payload = %payload, "MQTT message received");
        let Some(event) = parse_status(topic, &payload) else {
            debug!(topic, "Ignoring unrecognised legacy status report");
            return Flow::Continue;
        };
        {
            let link = self.inner.lock_link();
            if link.generation != generation {
                return Flow::Stop;
            }
            self.inner.enqueue_event(event);
        }
        self.inner.flush();
        Flow::Continue
    }

    // None once the driver's link has been superseded
    fn awaiting_connack(&self, generation: u64) -> Option<bool> {
        let link = self.inner.lock_link();
        (link.generation == generation).then(|| !link.machine.state().is_connected())
    }

    fn swap_transport(&self, generation: u64, transport: Arc<dyn Transport>) -> bool {
        let mut link = self.inner.lock_link();
        if link.generation != generation || !link.machine.state().is_active() {
            return false;
        }
        link.transport = Some(transport);
        true
    }
}

impl Inner {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, effects: &[Effect]) {
        let mut outbox = self.lock_outbox();
        for effect in effects {
            if let Effect::Emit(event) = effect {
                outbox.queue.push_back(event.clone());
            }
        }
    }

    fn enqueue_event(&self, event: AlarmEvent) {
        self.lock_outbox().queue.push_back(event);
    }

    // Returns at once if another call is already draining; that call picks up our events.
    fn flush(&self) {
        {
            let mut outbox = self.lock_outbox();
            if outbox.draining {
                return;
            }
            outbox.draining = true;
        }
        loop {
            let event = {
                let mut outbox = self.lock_outbox();
                match outbox.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        outbox.draining = false;
                        return;
                    }
                }
            };
            self.devices.apply(&event);
            self.observers.emit(&event);
        }
    }
}

fn subscribe_status(transport: &dyn Transport) {
    for topic in status_topics() {
        match transport.subscribe(&topic) {
            Ok(()) => debug!(topic = %topic, "Subscribed"),
            Err(err) => warn!(error = %err, topic = %topic, "Failed to subscribe"),
        }
    }
}

fn build_client(config: &BrokerConfig) -> Result<(AsyncClient, EventLoop), ServiceError> {
    if config.client_id.is_empty() || config.client_id.starts_with(' ') {
        return Err(ServiceError::InvalidClientId);
    }
    let mut opts = match config.endpoint()? {
        Endpoint::Tcp { host, port } => MqttOptions::new(&config.client_id, host, port),
        Endpoint::Ws { url, port } => {
            let mut opts = MqttOptions::new(&config.client_id, url, port);
            opts.set_transport(rumqttc::Transport::Ws);
            opts
        }
    };
    opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs.into()));
    opts.set_clean_session(config.clean_session);
    if let Some((user, password)) = config.credentials() {
        opts.set_credentials(user, password);
    }
    opts.set_request_channel_capacity(64);
    Ok(AsyncClient::new(opts, 64))
}

async fn run_eventloop(service: AlarmService, generation: u64, mut eventloop: EventLoop, config: BrokerConfig) {
    let mut backoff = config.reconnect_backoff();
    loop {
        let Some(handshaking) = service.awaiting_connack(generation) else {
            break;
        };
        let polled = if handshaking {
            match timeout(config.connect_timeout(), eventloop.poll()).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("no CONNACK within {}s", config.connect_timeout_secs)),
            }
        } else {
            eventloop.poll().await.map_err(|e| e.to_string())
        };

        let flow = match polled {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                info!(generation, session_present = ack.session_present, "MQTT connected");
                backoff = config.reconnect_backoff();
                service.step(generation, Input::Established)
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => service.route_message(generation, &p.topic, &p.payload),
            Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                debug!(pkid = ack.pkid, "Command acknowledged by broker");
                Flow::Continue
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                    warn!(pkid = ack.pkid, "Broker refused a status subscription");
                }
                Flow::Continue
            }
            Ok(other) => {
                debug!(?other, "MQTT event");
                Flow::Continue
            }
            Err(reason) => {
                error!(generation, error = %reason, "MQTT error; will attempt reconnect");
                if service.step(generation, Input::Failed(reason)) == Flow::Stop {
                    break;
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);

                // Fresh client and eventloop for the next attempt
                match build_client(&config) {
                    Ok((client, next)) => {
                        if !service.swap_transport(generation, Arc::new(client)) {
                            break;
                        }
                        eventloop = next;
                        info!(generation, "MQTT client and eventloop rebuilt, attempting reconnection");
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to rebuild MQTT client; retrying");
                    }
                }
                Flow::Continue
            }
        };

        if flow == Flow::Stop {
            break;
        }
    }
    debug!(generation, "MQTT driver stopped");
}
