//! Tokio driver for a [`Connector`].
//!
//! One task owns the connector and every socket. It turns accepted streams,
//! datagrams, link frames and timer expiries into connector inputs, then
//! performs the actions the connector queued. The application talks to it
//! through a cloneable [`ConnectorHandle`] and receives [`ConnectorEvent`]s
//! on a channel.

use crate::announcer::{Announcer, BroadcastTarget, Datagram};
use crate::config::{DaemonConfig, RedialPolicy};
use crate::link::{LinkEvent, LinkHandle};
use anyhow::{Context, Result, anyhow};
use connector_core::{
    Action, Connector, ConnectorError, ConnectorEvent, Destination, Endpoint, Envelope,
    Expectation, Input, LinkId, Status, TimerToken,
};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum Command {
    Send {
        message: Envelope,
        destination: Destination,
        reply: oneshot::Sender<Result<usize, ConnectorError>>,
    },
    Status {
        reply: oneshot::Sender<Status>,
    },
    UpdateLocalStates {
        actual: Value,
        reply: oneshot::Sender<u64>,
    },
    SetExpectations {
        expectations: HashMap<String, Expectation>,
        reply: oneshot::Sender<Result<(), ConnectorError>>,
    },
    Reconfigure {
        endpoint: Endpoint,
        target: BroadcastTarget,
        reply: oneshot::Sender<Result<Endpoint>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Application side of a running connector.
#[derive(Clone)]
pub struct ConnectorHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ConnectorHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| anyhow!("Connector runtime has stopped"))?;
        rx.await.map_err(|_| anyhow!("Connector runtime has stopped"))
    }

    /// Send an application message. Returns how many nodes it was sent to.
    pub async fn send(&self, message: Envelope, destination: Destination) -> Result<usize> {
        let sent = self
            .request(|reply| Command::Send {
                message,
                destination,
                reply,
            })
            .await??;
        Ok(sent)
    }

    pub async fn status(&self) -> Result<Status> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Publish new local states. Returns the new local revision.
    pub async fn update_local_states(&self, actual: Value) -> Result<u64> {
        self.request(|reply| Command::UpdateLocalStates { actual, reply })
            .await
    }

    /// Replace the expectation table. Fails unless this node leads.
    pub async fn set_expectations(&self, expectations: HashMap<String, Expectation>) -> Result<()> {
        self.request(|reply| Command::SetExpectations {
            expectations,
            reply,
        })
        .await??;
        Ok(())
    }

    /// Rebind to a new endpoint and broadcast target and restart the
    /// election. Returns the bound endpoint. On error the previous binding
    /// stays in use.
    pub async fn reconfigure(&self, endpoint: Endpoint, target: BroadcastTarget) -> Result<Endpoint> {
        self.request(|reply| Command::Reconfigure {
            endpoint,
            target,
            reply,
        })
        .await?
    }

    /// Stop the runtime and close every link.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Bind everything `config` asks for and start the connector.
///
/// A zero port binds an ephemeral TCP port and reuses it for UDP.
pub async fn start(
    config: &DaemonConfig,
) -> Result<(ConnectorHandle, mpsc::UnboundedReceiver<ConnectorEvent>)> {
    let id = config.node_id()?;
    let connector = Connector::new(config.connector_config(id)?)?;
    let target = config.broadcast_target()?;

    let (listener, endpoint) = bind_listener(config.endpoint()).await?;
    let (datagram_tx, datagrams) = mpsc::unbounded_channel();
    let announcer = Announcer::bind(endpoint.socket_addr(), &target, datagram_tx)?;

    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::unbounded_channel();
    let (link_tx, link_events) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();

    info!(
        "Connector {} of cluster {:?} bound to {} (broadcast {})",
        connector.config().id,
        connector.config().cluster,
        endpoint.socket_addr(),
        announcer.cast_addr()
    );

    let mut runtime = Runtime {
        connector,
        started: Instant::now(),
        endpoint,
        announcer,
        listener,
        redial: config.redial.clone(),
        links: HashMap::new(),
        timers: HashMap::new(),
        datagrams,
        link_tx,
        link_events,
        timer_tx,
        timer_rx,
        commands,
        events,
    };
    runtime.configure().await;
    tokio::spawn(runtime.run());

    Ok((
        ConnectorHandle {
            commands: commands_tx,
        },
        events_rx,
    ))
}

async fn bind_listener(endpoint: Endpoint) -> Result<(TcpListener, Endpoint)> {
    let listener = TcpListener::bind(endpoint.socket_addr())
        .await
        .with_context(|| format!("Failed to listen on {}", endpoint.socket_addr()))?;
    let bound = Endpoint::new(endpoint.address, listener.local_addr()?.port());
    Ok((listener, bound))
}

struct Runtime {
    connector: Connector,
    started: Instant,
    endpoint: Endpoint,
    announcer: Announcer,
    listener: TcpListener,
    redial: RedialPolicy,
    links: HashMap<LinkId, LinkHandle>,
    timers: HashMap<TimerToken, JoinHandle<()>>,
    datagrams: mpsc::UnboundedReceiver<Datagram>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    timer_tx: mpsc::UnboundedSender<TimerToken>,
    timer_rx: mpsc::UnboundedReceiver<TimerToken>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ConnectorEvent>,
}

impl Runtime {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.on_accept(stream, addr).await,
                    Err(e) => error!("Failed to accept connection: {}", e),
                },

                Some(datagram) = self.datagrams.recv() => {
                    self.input(Input::Datagram {
                        data: datagram.data,
                        from: datagram.from,
                    })
                    .await;
                }

                Some(event) = self.link_events.recv() => self.on_link_event(event).await,

                Some(token) = self.timer_rx.recv() => {
                    self.timers.remove(&token);
                    self.input(Input::Timer(token)).await;
                }

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command).await {
                            return;
                        }
                    }
                    None => {
                        debug!("All connector handles dropped");
                        self.shutdown().await;
                        return;
                    }
                },
            }
        }
    }

    async fn configure(&mut self) {
        let now = self.now_ms();
        self.connector.configure(self.endpoint, now);
        self.perform_actions().await;
    }

    async fn input(&mut self, input: Input) {
        let now = self.now_ms();
        self.connector.handle(input, now);
        self.perform_actions().await;
    }

    async fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let link = self.connector.accept(self.now_ms());
        debug!("Accepted {} from {}", link, addr);
        let handle = LinkHandle::accept(link, stream, self.redial.clone(), self.link_tx.clone());
        self.links.insert(link, handle);
        self.perform_actions().await;
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Message { link, data } => {
                // Frames still in flight from a link we already dropped
                if self.links.contains_key(&link) {
                    self.input(Input::LinkMessage { link, data }).await;
                }
            }
            LinkEvent::Closed { link } => {
                if self.links.remove(&link).is_some() {
                    self.input(Input::LinkClosed { link }).await;
                }
            }
        }
    }

    /// Returns false once the runtime should stop.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send {
                message,
                destination,
                reply,
            } => {
                let result = self.connector.send(message, destination);
                self.perform_actions().await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.connector.status());
            }
            Command::UpdateLocalStates { actual, reply } => {
                let revision = self.connector.update_local_states(actual);
                self.perform_actions().await;
                let _ = reply.send(revision);
            }
            Command::SetExpectations {
                expectations,
                reply,
            } => {
                let result = self.connector.set_expectations(expectations);
                self.perform_actions().await;
                let _ = reply.send(result);
            }
            Command::Reconfigure {
                endpoint,
                target,
                reply,
            } => {
                let result = self.reconfigure(endpoint, target).await;
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn reconfigure(&mut self, endpoint: Endpoint, target: BroadcastTarget) -> Result<Endpoint> {
        let moved = endpoint != self.endpoint;
        let (listener, bound) = if moved {
            let (listener, bound) = bind_listener(endpoint).await?;
            (Some(listener), bound)
        } else {
            (None, endpoint)
        };
        self.announcer.reconfigure(bound.socket_addr(), &target)?;
        if let Some(listener) = listener {
            self.listener = listener;
        }
        self.endpoint = bound;
        info!("Reconfigured to {} (broadcast {})", bound.socket_addr(), target);
        self.configure().await;
        Ok(bound)
    }

    async fn shutdown(&mut self) {
        let now = self.now_ms();
        self.connector.unconfigure(now);
        self.perform_actions().await;
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        for (_, link) in self.links.drain() {
            link.close();
        }
        info!("Connector {} stopped", self.connector.config().id);
    }

    async fn perform_actions(&mut self) {
        while let Some(action) = self.connector.poll_action() {
            self.perform(action).await;
        }
    }

    async fn perform(&mut self, action: Action) {
        match action {
            Action::Announce { data, target } => {
                if let Err(e) = self.announcer.send(&data, target).await {
                    warn!("{:#}", e);
                }
            }
            Action::Connect {
                link,
                address,
                port,
                usage,
                timeout,
                hello,
                redial,
            } => {
                debug!("Opening {} link {} to {}:{}", usage, link, address, port);
                let handle = LinkHandle::dial(
                    link,
                    SocketAddr::new(address, port),
                    hello,
                    timeout,
                    redial,
                    self.redial.clone(),
                    self.link_tx.clone(),
                );
                self.links.insert(link, handle);
            }
            Action::Promote {
                link,
                timeout,
                redial,
                ..
            } => {
                if let Some(handle) = self.links.get(&link) {
                    handle.configure(timeout, redial);
                }
            }
            Action::Send { link, data } => match self.links.get(&link) {
                Some(handle) => handle.send(data),
                None => debug!("Dropping frame for closed {}", link),
            },
            Action::Disconnect { link } => {
                if let Some(handle) = self.links.remove(&link) {
                    handle.close();
                }
            }
            Action::Schedule { token, after } => {
                let timer_tx = self.timer_tx.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = timer_tx.send(token);
                });
                if let Some(previous) = self.timers.insert(token, task) {
                    previous.abort();
                }
            }
            Action::Cancel { token } => {
                if let Some(task) = self.timers.remove(&token) {
                    task.abort();
                }
            }
            Action::Emit(event) => {
                let _ = self.events.send(event);
            }
        }
    }
}
