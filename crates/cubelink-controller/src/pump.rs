//! [`DispatchPump`] – per-sender ordering on top of the gateway stream.
//!
//! Each sender gets its own worker task fed by an unbounded `mpsc` queue.
//! Events from one sender are handled strictly in arrival order; different
//! senders are handled concurrently.  A sender's disconnect travels through
//! the same queue as its messages and retires the worker.  If the same id
//! reconnects, its new worker first waits for the retiring one to finish.

use std::collections::HashMap;
use std::sync::Arc;

use cubelink_middleware::{GatewayEvent, GatewayEvents};
use cubelink_types::ClientId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dispatcher::MessageConsumer;

struct Worker {
    tx: mpsc::UnboundedSender<GatewayEvent>,
    handle: JoinHandle<()>,
}

pub struct DispatchPump<C: MessageConsumer + 'static> {
    consumer: Arc<C>,
    workers: HashMap<ClientId, Worker>,
    retiring: HashMap<ClientId, JoinHandle<()>>,
}

impl<C: MessageConsumer + 'static> DispatchPump<C> {
    pub fn new(consumer: Arc<C>) -> Self {
        Self {
            consumer,
            workers: HashMap::new(),
            retiring: HashMap::new(),
        }
    }

    /// Drain `events` until the bus goes away, then wait for every worker.
    pub async fn run(mut self, mut events: GatewayEvents) {
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        debug!("gateway stream closed; draining dispatch workers");
        self.shutdown().await;
    }

    /// Route one event to its sender's worker, spawning it if needed.
    pub fn dispatch(&mut self, event: GatewayEvent) {
        let id = event.client_id().clone();
        let closing = matches!(event, GatewayEvent::ClientDisconnected(_));

        if !self.workers.contains_key(&id) {
            let worker = self.spawn_worker(&id);
            self.workers.insert(id.clone(), worker);
        }
        let Some(worker) = self.workers.get(&id) else {
            return;
        };
        if worker.tx.send(event).is_err() {
            warn!(client_id = %id, "dispatch worker gone; event dropped");
            self.workers.remove(&id);
            return;
        }

        if closing {
            self.retiring.retain(|_, handle| !handle.is_finished());
            if let Some(worker) = self.workers.remove(&id) {
                self.retiring.insert(id, worker.handle);
            }
        }
    }

    /// Number of senders with a live worker.
    pub fn active_senders(&self) -> usize {
        self.workers.len()
    }

    /// Close every queue and wait for the workers to finish what they hold.
    pub async fn shutdown(mut self) {
        let mut handles: Vec<JoinHandle<()>> = self.workers.drain().map(|(_, w)| w.handle).collect();
        handles.extend(self.retiring.drain().map(|(_, h)| h));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch worker ended abnormally");
            }
        }
    }

    fn spawn_worker(&mut self, id: &ClientId) -> Worker {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = self.consumer.clone();
        let previous = self.retiring.remove(id);
        let client_id = id.clone();

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous
                && let Err(e) = previous.await
            {
                warn!(client_id = %client_id, error = %e, "previous dispatch worker ended abnormally");
            }
            while let Some(event) = rx.recv().await {
                match event {
                    GatewayEvent::Message(message) => consumer.on_message(message).await,
                    GatewayEvent::ClientDisconnected(id) => {
                        consumer.on_disconnect(id).await;
                        break;
                    }
                }
            }
            debug!(client_id = %client_id, "dispatch worker finished");
        });
        Worker { tx, handle }
    }
}
