//! Rendezvous relay so peers can find each other by identifier.
//!
//! Clients open a signaling connection and register with `Hello`. Every later
//! message naming a `recipient` is relayed to that client's connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::signaling::{MessageBody, SignalingChannel, SignalingError, SignalingEvent, SignalingMessage};

/// Sender name the server uses for its own replies
pub const SERVER_NAME: &str = "rendezvous";

struct Registration {
    client_id: u64,
    forward: mpsc::UnboundedSender<SignalingMessage>,
}

#[derive(Default)]
struct Registry {
    clients: Mutex<HashMap<String, Registration>>,
    next_client_id: AtomicU64,
}

impl Registry {
    fn register(&self, name: &str, client_id: u64, forward: mpsc::UnboundedSender<SignalingMessage>) -> bool {
        let Ok(mut clients) = self.clients.lock() else {
            return false;
        };
        if clients.get(name).is_some_and(|r| !r.forward.is_closed()) {
            return false;
        }
        clients.insert(name.to_string(), Registration { client_id, forward });
        true
    }

    fn unregister(&self, name: &str, client_id: u64) {
        if let Ok(mut clients) = self.clients.lock() {
            if clients.get(name).is_some_and(|r| r.client_id == client_id) {
                clients.remove(name);
            }
        }
    }

    fn forward(&self, message: SignalingMessage) -> Result<(), SignalingMessage> {
        let Some(recipient) = message.recipient.clone() else {
            return Err(message);
        };
        let Ok(clients) = self.clients.lock() else {
            return Err(message);
        };
        match clients.get(&recipient) {
            Some(registration) => registration.forward.send(message).map_err(|e| e.0),
            None => Err(message),
        }
    }

    fn len(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }
}

pub struct RendezvousServer {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl RendezvousServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await
            .with_context(|| format!("Failed to bind rendezvous server on {}", addr))?;
        Ok(Self {
            listener,
            registry: Arc::new(Registry::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read rendezvous address")
    }

    pub fn registered_clients(&self) -> usize {
        self.registry.len()
    }

    /// Accept clients until the listener fails
    pub async fn run(&self) -> Result<()> {
        info!("Rendezvous server listening on {}", self.local_addr()?);
        loop {
            let (stream, peer) = self.listener.accept().await
                .context("Rendezvous accept failed")?;
            let registry = self.registry.clone();
            let client_id = registry.next_client_id.fetch_add(1, Ordering::Relaxed);
            debug!("Rendezvous client {} connected from {}", client_id, peer);
            tokio::spawn(serve_client(stream, registry, client_id));
        }
    }
}

async fn serve_client(stream: TcpStream, registry: Arc<Registry>, client_id: u64) {
    let mut channel = SignalingChannel::from_tcp(stream);
    let (forward_tx, mut forward_rx) = mpsc::unbounded_channel();
    let mut name: Option<String> = None;

    loop {
        tokio::select! {
            event = channel.recv() => match event {
                SignalingEvent::Message(message) => {
                    if let Err(e) = relay(&channel, &registry, client_id, &forward_tx, &mut name, message) {
                        debug!("Rendezvous client {}: {}", client_id, e);
                        break;
                    }
                }
                SignalingEvent::Invalid(reason) => {
                    warn!("Rendezvous client {} sent invalid frame: {}", client_id, reason);
                    let reply = SignalingMessage::new(Uuid::nil(), SERVER_NAME, MessageBody::Error { reason });
                    if channel.send(reply).is_err() {
                        break;
                    }
                }
                SignalingEvent::Closed => break,
            },
            Some(message) = forward_rx.recv() => {
                if channel.send(message).is_err() {
                    break;
                }
            }
        }
    }

    if let Some(name) = name {
        registry.unregister(&name, client_id);
        info!("Rendezvous client '{}' disconnected", name);
    }
}

fn relay(
    channel: &SignalingChannel,
    registry: &Registry,
    client_id: u64,
    forward_tx: &mpsc::UnboundedSender<SignalingMessage>,
    name: &mut Option<String>,
    mut message: SignalingMessage,
) -> Result<(), SignalingError> {
    if let MessageBody::Hello { .. } = message.body {
        if name.is_some() {
            return Ok(());
        }
        if registry.register(&message.sender, client_id, forward_tx.clone()) {
            info!("Rendezvous client '{}' registered", message.sender);
            *name = Some(message.sender);
            return Ok(());
        }
        return channel.send(error_reply(&message, format!("identifier '{}' is taken", message.sender)));
    }

    let Some(sender) = name.clone() else {
        return channel.send(error_reply(&message, "register with hello first".to_string()));
    };
    message.sender = sender;

    match registry.forward(message) {
        Ok(()) => Ok(()),
        Err(undelivered) => {
            let reason = match &undelivered.recipient {
                Some(recipient) => format!("unknown recipient '{}'", recipient),
                None => "message has no recipient".to_string(),
            };
            debug!("Rendezvous could not relay {}: {}", undelivered.body.kind(), reason);
            channel.send(error_reply(&undelivered, reason))
        }
    }
}

fn error_reply(message: &SignalingMessage, reason: String) -> SignalingMessage {
    SignalingMessage::new(message.session_id, SERVER_NAME, MessageBody::Error { reason })
        .to(Some(message.sender.clone()))
}

/// Announce `local_id` on a rendezvous connection
pub fn register(channel: &SignalingChannel, local_id: &str, display_name: Option<String>) -> Result<(), SignalingError> {
    channel.send(SignalingMessage::new(Uuid::nil(), local_id, MessageBody::Hello { display_name }))
}
