//! WebSocket links.
//!
//! Each link runs in its own task and is driven through a [`LinkHandle`].
//! Frames are JSON envelopes sent as binary WebSocket messages. A link:
//! - Keeps frames queued until the transport has accepted them
//! - Closes itself after its inactivity timeout (traffic in either direction
//!   counts as activity)
//! - Redials and replays queued frames when a `communicate` transport drops
//!   with frames still queued, if it was given a redial target
//! - Keeps dialing a redial target it could not reach the first time, so
//!   frames sent meanwhile are not lost
//!
//! Only a close the connector did not ask for is reported back as
//! [`LinkEvent::Closed`].

use crate::config::RedialPolicy;
use anyhow::{Context, Result};
use connector_core::{LinkId, Redial};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_tungstenite::{
    WebSocketStream, accept_async, client_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, warn};

/// Maximum frame size we accept from a peer (16MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

type Transport = WebSocketStream<TcpStream>;

#[derive(Debug)]
pub enum LinkEvent {
    Message { link: LinkId, data: Vec<u8> },
    Closed { link: LinkId },
}

#[derive(Debug)]
enum LinkCommand {
    Send(Vec<u8>),
    Configure {
        timeout: Duration,
        redial: Option<Redial>,
    },
    Close,
}

/// Control side of a running link task. Dropping it closes the link.
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    /// Upgrade an accepted TCP stream. The link has no inactivity timeout
    /// until it is configured.
    pub fn accept(
        link: LinkId,
        stream: TcpStream,
        policy: RedialPolicy,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let ws = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("WebSocket upgrade failed on {}: {}", link, e);
                    let _ = events.send(LinkEvent::Closed { link });
                    return;
                }
            };
            LinkTask::new(link, ws, rx, events, None, None, policy).run().await;
        });
        Self { commands }
    }

    /// Dial `addr` and send `hello` as the first frame. Frames sent before
    /// the transport is up are queued. With a redial target a failed first
    /// connect is retried under `policy`.
    pub fn dial(
        link: LinkId,
        addr: SocketAddr,
        hello: Vec<u8>,
        idle: Duration,
        redial: Option<Redial>,
        policy: RedialPolicy,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let opened = match open(addr, &hello, idle).await {
                Ok(ws) => Some(ws),
                Err(e) => {
                    debug!("Failed to connect {} to {}: {:#}", link, addr, e);
                    match &redial {
                        Some(target) => reopen(link, target, &policy, idle, 1).await,
                        None => None,
                    }
                }
            };
            let Some(ws) = opened else {
                let _ = events.send(LinkEvent::Closed { link });
                return;
            };
            LinkTask::new(link, ws, rx, events, Some(idle), redial, policy)
                .run()
                .await;
        });
        Self { commands }
    }

    pub fn send(&self, data: Vec<u8>) {
        let _ = self.commands.send(LinkCommand::Send(data));
    }

    /// Apply the usage settings of an identified link.
    pub fn configure(&self, timeout: Duration, redial: Option<Redial>) {
        let _ = self.commands.send(LinkCommand::Configure { timeout, redial });
    }

    /// Flush queued frames and close without reporting back.
    pub fn close(self) {
        let _ = self.commands.send(LinkCommand::Close);
    }
}

/// Connect, upgrade and say hello, all within `limit`.
async fn open(addr: SocketAddr, hello: &[u8], limit: Duration) -> Result<Transport> {
    let connect = async {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("TCP connect to {}", addr))?;
        stream.set_nodelay(true)?;
        let (mut ws, _) = client_async(format!("ws://{}/", addr), stream)
            .await
            .context("WebSocket handshake")?;
        ws.send(Message::Binary(hello.to_vec().into())).await?;
        Ok::<_, anyhow::Error>(ws)
    };
    timeout(limit, connect)
        .await
        .with_context(|| format!("Timed out connecting to {}", addr))?
}

/// Why the transport went away.
enum Ending {
    /// The connector asked for it; nothing to report
    Requested,
    /// Dropped by the peer, the network or the inactivity timeout
    Lost,
}

struct LinkTask {
    link: LinkId,
    ws: Transport,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
    idle: Option<Duration>,
    redial: Option<Redial>,
    policy: RedialPolicy,
    /// Frames not yet accepted by the transport, oldest first
    queue: VecDeque<Vec<u8>>,
    last_activity: Instant,
}

impl LinkTask {
    fn new(
        link: LinkId,
        ws: Transport,
        commands: mpsc::UnboundedReceiver<LinkCommand>,
        events: mpsc::UnboundedSender<LinkEvent>,
        idle: Option<Duration>,
        redial: Option<Redial>,
        policy: RedialPolicy,
    ) -> Self {
        Self {
            link,
            ws,
            commands,
            events,
            idle,
            redial,
            policy,
            queue: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    async fn run(mut self) {
        loop {
            match self.serve().await {
                Ending::Requested => {
                    let _ = self.ws.close(None).await;
                    return;
                }
                Ending::Lost => {
                    let _ = self.ws.close(None).await;
                    if self.absorb_commands() {
                        return;
                    }
                    if self.queue.is_empty() || !self.redial().await {
                        let _ = self.events.send(LinkEvent::Closed { link: self.link });
                        return;
                    }
                }
            }
        }
    }

    /// Pump frames until the transport ends.
    async fn serve(&mut self) -> Ending {
        if self.flush().await.is_err() {
            return Ending::Lost;
        }
        loop {
            let deadline = self.idle.map(|idle| self.last_activity + idle);
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Send(data)) => {
                        self.queue.push_back(data);
                        if let Err(e) = self.flush().await {
                            debug!("Write failed on {}: {}", self.link, e);
                            return Ending::Lost;
                        }
                    }
                    Some(LinkCommand::Configure { timeout, redial }) => {
                        self.idle = Some(timeout);
                        self.redial = redial;
                        self.last_activity = Instant::now();
                    }
                    Some(LinkCommand::Close) | None => {
                        let _ = self.flush().await;
                        return Ending::Requested;
                    }
                },
                frame = self.ws.next() => match frame {
                    Some(Ok(message)) => {
                        self.last_activity = Instant::now();
                        let data = match message {
                            Message::Binary(data) => data.to_vec(),
                            Message::Text(text) => text.into_bytes(),
                            Message::Close(_) => {
                                debug!("Received close frame on {}", self.link);
                                return Ending::Lost;
                            }
                            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        };
                        if data.len() > MAX_FRAME_SIZE {
                            warn!(
                                "Frame on {} exceeds max size ({} > {}), dropping",
                                self.link,
                                data.len(),
                                MAX_FRAME_SIZE
                            );
                            continue;
                        }
                        let _ = self.events.send(LinkEvent::Message { link: self.link, data });
                    }
                    Some(Err(e)) => {
                        match e {
                            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                debug!("{} closed", self.link);
                            }
                            _ => debug!("WebSocket error on {}: {}", self.link, e),
                        }
                        return Ending::Lost;
                    }
                    None => {
                        debug!("{} stream ended", self.link);
                        return Ending::Lost;
                    }
                },
                _ = idle(deadline) => {
                    debug!("{} idle for {:?}, closing", self.link, self.idle);
                    return Ending::Lost;
                }
            }
        }
    }

    /// Write queued frames. A frame leaves the queue only once written.
    async fn flush(&mut self) -> Result<(), WsError> {
        while let Some(data) = self.queue.front() {
            self.ws.send(Message::Binary(data.clone().into())).await?;
            self.queue.pop_front();
            self.last_activity = Instant::now();
        }
        Ok(())
    }

    /// Move commands that raced with the drop into the queue. Returns true
    /// if the connector already asked to close.
    fn absorb_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                LinkCommand::Send(data) => self.queue.push_back(data),
                LinkCommand::Configure { timeout, redial } => {
                    self.idle = Some(timeout);
                    self.redial = redial;
                }
                LinkCommand::Close => return true,
            }
        }
        false
    }

    /// Reopen the transport to the redial target and re-identify. Returns
    /// false when there is no target or the policy ran out of attempts.
    async fn redial(&mut self) -> bool {
        let Some(target) = self.redial.clone() else {
            return false;
        };
        info!(
            "{} dropped with {} queued frame(s), redialing {}:{}",
            self.link,
            self.queue.len(),
            target.address,
            target.port
        );
        let limit = self.idle.unwrap_or(Duration::from_secs(5));
        match reopen(self.link, &target, &self.policy, limit, 0).await {
            Some(ws) => {
                self.ws = ws;
                self.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }
}

/// Dial `target` until it answers or `policy` runs out. `failed` counts
/// attempts already made.
async fn reopen(
    link: LinkId,
    target: &Redial,
    policy: &RedialPolicy,
    limit: Duration,
    failed: u32,
) -> Option<Transport> {
    let addr = SocketAddr::new(target.address, target.port);
    let mut attempts = failed;
    loop {
        if attempts > 0 {
            if policy.exhausted(attempts) {
                info!("Giving up on {} after {} attempt(s)", link, attempts);
                return None;
            }
            tokio::time::sleep(policy.backoff(attempts)).await;
        }
        attempts += 1;
        match open(addr, &target.hello, limit).await {
            Ok(ws) => {
                debug!("{} reached {} after {} attempt(s)", link, addr, attempts);
                return Some(ws);
            }
            Err(e) => debug!("Attempt {} of {} failed: {:#}", attempts, link, e),
        }
    }
}

async fn idle(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
