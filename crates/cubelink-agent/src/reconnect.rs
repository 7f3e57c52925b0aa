//! [`ReconnectAgent`] – the client-role connection state machine.
//!
//! ```text
//! Disconnected ──run()──▶ Connecting ──ok──▶ Connected
//!      ▲                      │                  │
//!      └──────── err ─────────┘     transport drop│
//!      ▲                                          ▼
//!      └── err ── Connecting ◀── wait delay ── Disconnected
//! ```
//!
//! After every successful connect the agent subscribes to one wildcard
//! filter per cube event.  A failed subscription is logged and the agent
//! stays connected.
//!
//! # Single retry
//!
//! When the connection drops the agent waits `reconnect_delay` and makes
//! exactly one reconnect attempt.  If that attempt fails, [`run`] returns
//! [`AgentExit::ReconnectFailed`] and nothing else is tried; calling
//! [`run`] again is the only way to reconnect.  This is not a backoff loop.
//!
//! [`run`]: ReconnectAgent::run

use std::sync::Arc;
use std::time::Duration;

use cubelink_controller::notify::DEFAULT_NOTIFY_CAPACITY;
use cubelink_controller::telemetry::{CubeContext, parse_device_topic};
use cubelink_controller::{CubeDirectory, FleetNotifier, LampCycle, Outbound};
use cubelink_middleware::{BusClient, ClientEvent};
use cubelink_types::{CubeError, CubeEvent, FleetNotice, LampColor};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// Wait between a dropped connection and the reconnect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Connected,
}

/// Why [`ReconnectAgent::run`] returned.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentExit {
    /// [`AgentHandle::shutdown`] was called.
    Shutdown,
    /// The first connect attempt failed.
    ConnectFailed(CubeError),
    /// The connection dropped and the single reconnect attempt failed.
    ReconnectFailed(CubeError),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub reconnect_delay: Duration,
    pub notify_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

/// Cloneable remote control for a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    state: watch::Receiver<AgentState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AgentHandle {
    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.state.clone()
    }

    /// Stop the agent.  A pending reconnect wait is abandoned immediately.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

pub struct ReconnectAgent<C: BusClient> {
    client: C,
    reconnect_delay: Duration,
    state: watch::Sender<AgentState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
    directory: CubeDirectory,
    lamp: LampCycle,
    notifier: FleetNotifier,
}

impl<C: BusClient> ReconnectAgent<C> {
    pub fn new(client: C, config: AgentConfig) -> Self {
        let (state, _) = watch::channel(AgentState::Disconnected);
        let (shutdown_tx, shutdown) = watch::channel(false);
        Self {
            client,
            reconnect_delay: config.reconnect_delay,
            state,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown,
            directory: CubeDirectory::new(),
            lamp: LampCycle::new(),
            notifier: FleetNotifier::new(config.notify_capacity),
        }
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            state: self.state.subscribe(),
            shutdown: self.shutdown_tx.clone(),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetNotice> {
        self.notifier.subscribe()
    }

    pub fn directory(&self) -> &CubeDirectory {
        &self.directory
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Connect and process cube events until shutdown or until the
    /// connection is lost for good.
    pub async fn run(&mut self) -> AgentExit {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return AgentExit::Shutdown;
        }

        if let Err(e) = self.establish().await {
            error!(client_id = %self.client.client_id(), error = %e, "connect failed");
            return AgentExit::ConnectFailed(e);
        }

        loop {
            let event = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    self.set_state(AgentState::Disconnected);
                    info!(client_id = %self.client.client_id(), "agent shut down");
                    return AgentExit::Shutdown;
                }
                event = self.client.next_event() => event,
            };

            match event {
                ClientEvent::Message { topic, payload } => self.handle_message(&topic, &payload).await,
                ClientEvent::Disconnected => {
                    self.set_state(AgentState::Disconnected);
                    warn!(
                        client_id = %self.client.client_id(),
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "disconnected from broker; reconnecting after delay"
                    );
                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown) => return AgentExit::Shutdown,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                    if let Err(e) = self.establish().await {
                        error!(client_id = %self.client.client_id(), error = %e, "reconnect failed; staying disconnected");
                        return AgentExit::ReconnectFailed(e);
                    }
                }
            }
        }
    }

    /// Light every known connected cube with `color`.
    pub async fn broadcast_lamp(&mut self, color: LampColor) {
        let commands = self.ctx().broadcast_lamp(color);
        self.send_all(commands).await;
    }

    async fn establish(&mut self) -> Result<(), CubeError> {
        self.set_state(AgentState::Connecting);
        if let Err(e) = self.client.connect().await {
            self.set_state(AgentState::Disconnected);
            return Err(e);
        }
        self.set_state(AgentState::Connected);
        info!(client_id = %self.client.client_id(), "connected to broker");

        for event in CubeEvent::ALL {
            let filter = event.wildcard_filter();
            match self.client.subscribe(&filter).await {
                Ok(()) => debug!(filter = %filter, "subscribed"),
                Err(e) => warn!(filter = %filter, error = %e, "subscription failed"),
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, topic: &str, payload: &[u8]) {
        debug!(topic = %topic, bytes = payload.len(), "message received");
        let (address, event) = match parse_device_topic(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "message ignored");
                return;
            }
        };
        let result = self.ctx().apply(None, &address, event, payload);
        match result {
            Ok(commands) => self.send_all(commands).await,
            Err(e) => warn!(cube = %address, error = %e, "cube event dropped"),
        }
    }

    async fn send_all(&mut self, commands: Vec<Outbound>) {
        for Outbound { topic, payload } in commands {
            if let Err(e) = self.client.publish(&topic, payload).await {
                warn!(topic = %topic, error = %e, "publish failed");
            }
        }
    }

    fn ctx(&mut self) -> CubeContext<'_> {
        CubeContext {
            directory: &mut self.directory,
            lamp: &mut self.lamp,
            notifier: &self.notifier,
        }
    }

    fn set_state(&self, state: AgentState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "agent state");
        }
    }
}

/// Resolves once shutdown has been requested.  Never resolves if every
/// sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cubelink_types::{ClientId, CubeAddress, FleetEvent};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    /// What a [`ScriptedClient`] saw, shared with the test body.
    #[derive(Default)]
    struct Probe {
        connects: StdMutex<usize>,
        subscribed: StdMutex<Vec<String>>,
        published: StdMutex<Vec<(String, Vec<u8>)>>,
    }

    impl Probe {
        fn connects(&self) -> usize {
            *self.connects.lock().unwrap()
        }
    }

    /// Connect results are consumed in order; once exhausted every connect
    /// fails.  Events come from a channel the test feeds.
    struct ScriptedClient {
        id: ClientId,
        connect_results: VecDeque<Result<(), CubeError>>,
        fail_subscribe: bool,
        connected: bool,
        events: mpsc::UnboundedReceiver<ClientEvent>,
        probe: Arc<Probe>,
    }

    #[async_trait]
    impl BusClient for ScriptedClient {
        fn client_id(&self) -> &ClientId {
            &self.id
        }

        async fn connect(&mut self) -> Result<(), CubeError> {
            *self.probe.connects.lock().unwrap() += 1;
            let result = self
                .connect_results
                .pop_front()
                .unwrap_or_else(|| Err(CubeError::Transport("script exhausted".to_string())));
            self.connected = result.is_ok();
            result
        }

        async fn subscribe(&mut self, filter: &str) -> Result<(), CubeError> {
            self.probe.subscribed.lock().unwrap().push(filter.to_string());
            if self.fail_subscribe {
                return Err(CubeError::Transport("suback refused".to_string()));
            }
            Ok(())
        }

        async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), CubeError> {
            self.probe.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }

        async fn next_event(&mut self) -> ClientEvent {
            if !self.connected {
                return ClientEvent::Disconnected;
            }
            match self.events.recv().await {
                Some(ClientEvent::Disconnected) => {
                    self.connected = false;
                    ClientEvent::Disconnected
                }
                Some(event) => event,
                None => std::future::pending().await,
            }
        }
    }

    fn scripted(
        connect_results: Vec<Result<(), CubeError>>,
    ) -> (ScriptedClient, mpsc::UnboundedSender<ClientEvent>, Arc<Probe>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = Arc::new(Probe::default());
        let client = ScriptedClient {
            id: ClientId::new("controller"),
            connect_results: connect_results.into(),
            fail_subscribe: false,
            connected: false,
            events: rx,
            probe: probe.clone(),
        };
        (client, tx, probe)
    }

    fn message(topic: &str, payload: &[u8]) -> ClientEvent {
        ClientEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        }
    }

    fn refused() -> CubeError {
        CubeError::Transport("connection refused".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_to_every_cube_event_on_connect() {
        let (client, tx, probe) = scripted(vec![Ok(())]);
        tx.send(ClientEvent::Disconnected).unwrap();
        let mut agent = ReconnectAgent::new(client, AgentConfig::default());

        let exit = agent.run().await;
        assert!(matches!(exit, AgentExit::ReconnectFailed(_)));
        assert_eq!(
            *probe.subscribed.lock().unwrap(),
            vec!["+/connected", "+/disconnected", "+/button", "+/battery"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cube_events_drive_directory_and_lamps() {
        let (client, tx, probe) = scripted(vec![Ok(())]);
        for event in [
            message("c1/connected", b""),
            message("c1/battery", &[50]),
            message("c1/button", &[0x01]),
            message("c1/button", &[0x00]),
            message("c2/battery", &[10]),
            message("c1/disconnected", b""),
            ClientEvent::Disconnected,
        ] {
            tx.send(event).unwrap();
        }
        let mut agent = ReconnectAgent::new(client, AgentConfig::default());
        let mut notices = agent.subscribe();

        agent.run().await;

        let c1 = agent.directory().get(&CubeAddress::new("c1")).unwrap();
        assert_eq!(c1.battery, Some(50));
        assert!(!c1.connected);
        assert_ne!(c1.lamp, Some(LampColor::WHITE));
        assert!(!agent.directory().contains(&CubeAddress::new("c2")));

        let published = probe.published.lock().unwrap().clone();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0], ("c1/lamp".to_string(), vec![255, 255, 255]));
        assert_eq!(published[1].0, "c1/lamp");

        let mut lamp_changes = 0;
        while let Ok(notice) = notices.try_recv() {
            if matches!(notice.event, FleetEvent::LampChanged { .. }) {
                lamp_changes += 1;
            }
        }
        assert_eq!(lamp_changes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_one_reconnect_after_delay() {
        let (client, tx, probe) = scripted(vec![Ok(()), Err(refused())]);
        tx.send(ClientEvent::Disconnected).unwrap();
        let mut agent = ReconnectAgent::new(client, AgentConfig::default());
        let handle = agent.handle();
        let task = tokio::spawn(async move { agent.run().await });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(probe.connects(), 1);
        assert_eq!(handle.state(), AgentState::Disconnected);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(probe.connects(), 2);
        assert!(task.is_finished());
        assert_eq!(task.await.unwrap(), AgentExit::ReconnectFailed(refused()));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.connects(), 2);
        assert_eq!(handle.state(), AgentState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_connect_failure_is_not_retried() {
        let (client, _tx, probe) = scripted(vec![Err(refused())]);
        let mut agent = ReconnectAgent::new(client, AgentConfig::default());

        assert_eq!(agent.run().await, AgentExit::ConnectFailed(refused()));
        assert_eq!(probe.connects(), 1);
        assert!(probe.subscribed.lock().unwrap().is_empty());
        assert_eq!(agent.state(), AgentState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_failure_keeps_connection() {
        let (mut client, tx, probe) = scripted(vec![Ok(())]);
        client.fail_subscribe = true;
        tx.send(message("c1/connected", b"")).unwrap();
        tx.send(ClientEvent::Disconnected).unwrap();
        let mut agent = ReconnectAgent::new(client, AgentConfig::default());

        agent.run().await;
        assert_eq!(probe.subscribed.lock().unwrap().len(), 4);
        assert!(agent.directory().contains(&CubeAddress::new("c1")));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_abandons_reconnect_wait() {
        let (client, tx, probe) = scripted(vec![Ok(()), Ok(())]);
        tx.send(ClientEvent::Disconnected).unwrap();
        let mut agent = ReconnectAgent::new(client, AgentConfig::default());
        let handle = agent.handle();
        let task = tokio::spawn(async move { agent.run().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.shutdown();
        assert_eq!(task.await.unwrap(), AgentExit::Shutdown);
        assert_eq!(probe.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resubscribes_and_resumes() {
        let (client, tx, probe) = scripted(vec![Ok(()), Ok(())]);
        tx.send(ClientEvent::Disconnected).unwrap();
        tx.send(message("c2/connected", b"")).unwrap();
        let mut agent = ReconnectAgent::new(client, AgentConfig::default());
        let mut notices = agent.subscribe();
        let handle = agent.handle();
        let task = tokio::spawn(async move {
            let exit = agent.run().await;
            (exit, agent)
        });

        let notice = notices.recv().await.unwrap();
        assert_eq!(
            notice.event,
            FleetEvent::CubeConnected {
                bridge: None,
                cube: CubeAddress::new("c2"),
            }
        );
        assert_eq!(handle.state(), AgentState::Connected);

        handle.shutdown();
        let (exit, agent) = task.await.unwrap();
        assert_eq!(exit, AgentExit::Shutdown);
        assert_eq!(probe.connects(), 2);
        assert_eq!(probe.subscribed.lock().unwrap().len(), 8);
        assert!(agent.directory().get(&CubeAddress::new("c2")).unwrap().connected);
    }
}
