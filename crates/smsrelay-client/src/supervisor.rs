//! Connection registry and drain-aware hand-off.
//!
//! One coordinator task owns the registry and is the only writer. It reacts
//! to lifecycle signals one at a time and publishes each new registry as an
//! immutable snapshot. The fan-out task and [`SupervisorHandle`] only ever
//! read snapshots, so a send never races an insert or a removal.

use crate::connection::{Connection, ConnectionLink, InboundSink, StateCell};
use crate::transport::{Connector, FrameSink};
use crate::{ClientError, ErrorSink, SupervisorError};
use arc_swap::ArcSwap;
use serde::Deserialize;
use smsrelay_core::{ConnectionId, ConnectionState, OutboundMessage, Signal};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Capacity of the outbound channel returned by [`SupervisorHandle::outbound`].
const OUTBOUND_CAPACITY: usize = 256;

/// How outbound messages are spread over live connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutMode {
    /// Every live connection gets a copy. During a drain overlap the same
    /// message can go out twice, so delivery is at-least-once.
    #[default]
    Broadcast,
    /// One connection per message, Active before Draining.
    PreferActive,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default)]
    pub fan_out: FanOutMode,
}

/// What a connection was started with. A replacement inherits it.
#[derive(Clone)]
struct Wiring {
    inbound: InboundSink,
    errors: ErrorSink,
}

#[derive(Clone)]
struct Entry {
    state: StateCell,
    queue: mpsc::UnboundedSender<OutboundMessage>,
    wiring: Wiring,
}

type Registry = HashMap<ConnectionId, Entry>;

/// Point-in-time view of one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub state: ConnectionState,
}

enum Command {
    Spawn {
        reply: oneshot::Sender<Result<ConnectionId, SupervisorError>>,
    },
}

/// Client side of a running supervisor. Cheap to clone.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    outbound: mpsc::Sender<OutboundMessage>,
    registry: Arc<ArcSwap<Registry>>,
    population: watch::Receiver<usize>,
}

impl SupervisorHandle {
    /// Open one more connection wired to the supervisor's inbound sink.
    ///
    /// Serialized with signal handling. On a handshake failure the error
    /// has already been reported as fatal and is returned here as well;
    /// nothing is retried.
    pub async fn spawn_connection(&self) -> Result<ConnectionId, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Spawn { reply })
            .map_err(|_| SupervisorError::Stopped)?;
        rx.await.map_err(|_| SupervisorError::Stopped)?
    }

    /// Where the outbound source hands messages for fan-out.
    pub fn outbound(&self) -> mpsc::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    pub fn snapshot(&self) -> Vec<ConnectionSummary> {
        self.registry
            .load()
            .iter()
            .map(|(id, entry)| ConnectionSummary {
                id: *id,
                state: entry.state.get(),
            })
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.load().len()
    }

    /// Registry size, updated after every insert and removal.
    ///
    /// The returned receiver starts with the current value marked as seen,
    /// so `changed()` only fires for later updates.
    pub fn watch_count(&self) -> watch::Receiver<usize> {
        let mut population = self.population.clone();
        population.borrow_and_update();
        population
    }
}

/// The coordinator. Lives inside its own task; see [`Supervisor::start`].
pub struct Supervisor<C: Connector> {
    connector: Arc<C>,
    registry: Arc<ArcSwap<Registry>>,
    population: watch::Sender<usize>,
    signals: mpsc::UnboundedSender<Signal>,
    wiring: Wiring,
    /// Draining connections that already got a replacement.
    replaced: HashSet<ConnectionId>,
}

impl<C: Connector> Supervisor<C> {
    /// Start the coordinator and fan-out tasks.
    ///
    /// No connection is opened yet; call
    /// [`SupervisorHandle::spawn_connection`] for the first one.
    pub fn start(
        connector: C,
        config: SupervisorConfig,
        inbound: InboundSink,
        errors: ErrorSink,
    ) -> SupervisorHandle {
        let registry = Arc::new(ArcSwap::from_pointee(Registry::new()));
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (population_tx, population_rx) = watch::channel(0);

        let supervisor = Self {
            connector: Arc::new(connector),
            registry: registry.clone(),
            population: population_tx,
            signals: signals_tx,
            wiring: Wiring { inbound, errors },
            replaced: HashSet::new(),
        };
        tokio::spawn(supervisor.run(signals_rx, commands_rx));
        tokio::spawn(fan_out(registry.clone(), config.fan_out, outbound_rx));

        SupervisorHandle {
            commands: commands_tx,
            outbound: outbound_tx,
            registry,
            population: population_rx,
        }
    }

    async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<Signal>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut accepting_commands = true;
        loop {
            tokio::select! {
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
                command = commands.recv(), if accepting_commands => match command {
                    Some(Command::Spawn { reply }) => {
                        let wiring = self.wiring.clone();
                        let result = self.spawn(wiring).await.map_err(SupervisorError::from);
                        // The caller may have given up waiting.
                        let _ = reply.send(result);
                    }
                    None => accepting_commands = false,
                },
                else => break,
            }
        }
        tracing::debug!("supervisor stopped");
    }

    async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Drain { connection } => {
                let Some(entry) = self.registry.load().get(&connection).cloned() else {
                    tracing::debug!(%connection, "drain signal for unknown connection");
                    return;
                };
                if !self.replaced.insert(connection) {
                    tracing::debug!(%connection, "connection already replaced");
                    return;
                }
                match self.spawn(entry.wiring).await {
                    Ok(replacement) => {
                        tracing::info!(%connection, %replacement, "replacement connection up");
                    }
                    // Already reported as fatal. The draining connection stays
                    // registered until it closes on its own.
                    Err(_) => {
                        tracing::warn!(%connection, "replacement failed, draining connection left in place");
                    }
                }
            }
            Signal::Closed { connection } => {
                self.replaced.remove(&connection);
                let current = self.registry.load_full();
                if !current.contains_key(&connection) {
                    tracing::debug!(%connection, "close signal for unknown connection");
                    return;
                }
                let mut next = Registry::clone(&current);
                next.remove(&connection);
                self.publish(next);
                tracing::info!(%connection, remaining = current.len() - 1, "connection removed");
            }
        }
    }

    fn publish(&self, next: Registry) {
        let size = next.len();
        self.registry.store(Arc::new(next));
        self.population.send_replace(size);
    }

    /// Open, register, then start both loops.
    async fn spawn(&mut self, wiring: Wiring) -> Result<ConnectionId, ClientError> {
        let id = ConnectionId::generate();
        let connection = Connection::open(
            &*self.connector,
            id,
            self.signals.clone(),
            wiring.errors.clone(),
        )
        .await?;
        let link = connection.link();
        let (queue, pending) = mpsc::unbounded_channel();

        let mut next = Registry::clone(&self.registry.load());
        next.insert(
            id,
            Entry {
                state: link.state_cell(),
                queue,
                wiring: wiring.clone(),
            },
        );
        self.publish(next);

        tokio::spawn(send_loop(link, pending));
        tokio::spawn(connection.receive(wiring.inbound));
        Ok(id)
    }
}

/// Drain one connection's queue in order. Ends when the registry entry,
/// and with it the queue sender, is gone.
async fn send_loop<S: FrameSink>(
    link: ConnectionLink<S>,
    mut pending: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    while let Some(message) = pending.recv().await {
        link.send(&message).await;
    }
    tracing::debug!(connection = %link.id(), "send loop finished");
}

async fn fan_out(
    registry: Arc<ArcSwap<Registry>>,
    mode: FanOutMode,
    mut outbound: mpsc::Receiver<OutboundMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let snapshot = registry.load();
        let targets = select_targets(&snapshot, mode);
        if targets.is_empty() {
            tracing::warn!(
                message_id = message.correlation_id(),
                "no live connection, dropping outbound message"
            );
            continue;
        }
        for (id, entry) in targets {
            if entry.queue.send(message.clone()).is_err() {
                tracing::debug!(connection = %id, "send loop gone, skipping");
            }
        }
    }
}

fn select_targets(registry: &Registry, mode: FanOutMode) -> Vec<(&ConnectionId, &Entry)> {
    let live = registry
        .iter()
        .filter(|(_, entry)| entry.state.get().is_live());
    match mode {
        FanOutMode::Broadcast => live.collect(),
        FanOutMode::PreferActive => live
            .min_by_key(|(_, entry)| entry.state.get())
            .into_iter()
            .collect(),
    }
}
