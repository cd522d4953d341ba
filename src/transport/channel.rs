//! In-process transport backed by tokio channels
//!
//! Each connected client gets a reader task that feeds its envelopes to the
//! dispatcher one at a time, which gives per-client arrival ordering while
//! separate clients run concurrently. Used by embedders and tests.

use super::{Transport, TransportEvents, TransportType};
use crate::error::{Result, TransportError};
use crate::protocol::Envelope;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct ChannelTransport {
    inner: Arc<Inner>,
}

struct Inner {
    clients: DashMap<String, mpsc::UnboundedSender<Envelope>>,
    readers: DashMap<String, JoinHandle<()>>,
    events: RwLock<Option<Arc<dyn TransportEvents>>>,
    running: AtomicBool,
}

impl Inner {
    fn events(&self) -> Option<Arc<dyn TransportEvents>> {
        self.events
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                clients: DashMap::new(),
                readers: DashMap::new(),
                events: RwLock::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Opens a new client connection. Fails unless the transport is started.
    pub async fn connect(&self) -> Result<ClientHandle> {
        let events = match (self.is_running(), self.inner.events()) {
            (true, Some(events)) => events,
            _ => return Err(TransportError::Closed.into()),
        };

        let client_id = uuid::Uuid::new_v4().to_string();
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        self.inner.clients.insert(client_id.clone(), outbound_tx);

        events.on_connect(&client_id).await;
        debug!(client_id = %client_id, "Channel client connected");

        let inner = self.inner.clone();
        let id = client_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(envelope) = inbound_rx.recv().await {
                events.on_message(&id, envelope).await;
            }
            inner.clients.remove(&id);
            inner.readers.remove(&id);
            events.on_disconnect(&id).await;
            debug!(client_id = %id, "Channel client disconnected");
        });
        self.inner.readers.insert(client_id.clone(), reader);

        Ok(ClientHandle {
            client_id,
            inbound: inbound_tx,
            outbound: outbound_rx,
        })
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn start(&self, events: Arc<dyn TransportEvents>) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted.into());
        }
        *self
            .inner
            .events
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(events);
        info!("Channel transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .events
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        self.inner.clients.clear();
        let readers: Vec<String> = self.inner.readers.iter().map(|e| e.key().clone()).collect();
        for id in readers {
            if let Some((_, reader)) = self.inner.readers.remove(&id) {
                reader.abort();
            }
        }
        info!("Channel transport stopped");
        Ok(())
    }

    async fn send(&self, client_id: &str, envelope: Envelope) -> Result<()> {
        let client = self
            .inner
            .clients
            .get(client_id)
            .ok_or_else(|| TransportError::UnknownClient(client_id.to_string()))?;
        client
            .send(envelope)
            .map_err(|e| TransportError::SendFailed(e.to_string()).into())
    }

    async fn broadcast(&self, envelope: Envelope) -> Result<()> {
        for client in self.inner.clients.iter() {
            // a client that hung up is reaped by its reader task
            let _ = client.value().send(envelope.clone());
        }
        Ok(())
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Channel
    }
}

/// Client side of a channel connection. Dropping it disconnects.
pub struct ClientHandle {
    client_id: String,
    inbound: mpsc::UnboundedSender<Envelope>,
    outbound: mpsc::UnboundedReceiver<Envelope>,
}

impl ClientHandle {
    pub fn id(&self) -> &str {
        &self.client_id
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        self.inbound
            .send(envelope)
            .map_err(|_| TransportError::Closed.into())
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.outbound.recv().await
    }

    /// Sends `envelope` and waits for the next envelope addressed to this
    /// client.
    pub async fn request(&mut self, envelope: Envelope) -> Result<Envelope> {
        self.send(envelope)?;
        self.recv()
            .await
            .ok_or_else(|| TransportError::Closed.into())
    }
}
