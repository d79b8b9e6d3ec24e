// Messaging System - agent mailboxes, request/response correlation, broadcast
//
// Every agent gets a bounded mailbox. Requests park a oneshot waiter keyed
// by correlation id; the waiter resolves with the response, a timeout, or
// an expiry from the periodic sweep, never hangs. Messages addressed to the
// coordinator are dispatched to per-topic handlers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::{deadline_after, expiry_after};
use crate::config::MessagingConfig;
use crate::error::{CoordinationError, Result};
use crate::events::{CoordinationEvent, EventBus};
use crate::types::{AgentId, MessageId};

/// Sender of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Address {
    Coordinator,
    Agent(AgentId),
}

/// Destination of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Coordinator,
    Agent(AgentId),
    Broadcast,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Coordinator => f.write_str("coordinator"),
            Address::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Coordinator => f.write_str("coordinator"),
            Recipient::Agent(id) => write!(f, "agent:{id}"),
            Recipient::Broadcast => f.write_str("broadcast"),
        }
    }
}

impl From<Address> for Recipient {
    fn from(address: Address) -> Self {
        match address {
            Address::Coordinator => Recipient::Coordinator,
            Address::Agent(id) => Recipient::Agent(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub from: Address,
    pub to: Recipient,
    pub kind: MessageKind,
    pub topic: String,
    pub correlation_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Message {
    fn new(from: Address, to: Recipient, kind: MessageKind, topic: &str, payload: Value) -> Self {
        Self {
            id: MessageId::generate(),
            from,
            to,
            kind,
            topic: topic.to_string(),
            correlation_id: None,
            payload,
            created_at: Utc::now(),
            expires_at: None,
        }
    }
}

/// Handles messages addressed to the coordinator for one topic. Returning
/// `Some(payload)` for a request sends it back as the response.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<Option<Value>>;
}

/// Receiving end of an agent's mailbox
pub struct Mailbox {
    agent_id: AgentId,
    receiver: mpsc::Receiver<Message>,
}

impl Mailbox {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Next message; `None` once the agent is unregistered and drained
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox").field("agent_id", &self.agent_id).finish()
    }
}

struct PendingRequest {
    to: Recipient,
    deadline: Instant,
    waiter: oneshot::Sender<Result<Message>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MessagingStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub expired: u64,
}

struct Inner {
    mailboxes: RwLock<HashMap<AgentId, mpsc::Sender<Message>>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    config: MessagingConfig,
    events: EventBus,
    sent: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    expired: AtomicU64,
}

#[derive(Clone)]
pub struct MessagingSystem {
    inner: Arc<Inner>,
}

impl MessagingSystem {
    pub fn new(config: MessagingConfig, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                mailboxes: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                config,
                events,
                sent: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                expired: AtomicU64::new(0),
            }),
        }
    }

    /// Create (or replace) the mailbox for `agent_id`
    pub fn register_agent(&self, agent_id: &AgentId) -> Mailbox {
        let (sender, receiver) = mpsc::channel(self.inner.config.mailbox_capacity.max(1));
        if self
            .inner
            .mailboxes
            .write()
            .insert(agent_id.clone(), sender)
            .is_some()
        {
            debug!(agent_id = %agent_id, "Replaced existing mailbox");
        }
        Mailbox {
            agent_id: agent_id.clone(),
            receiver,
        }
    }

    /// Drop the agent's mailbox and fail requests still waiting on it
    pub fn unregister_agent(&self, agent_id: &AgentId) -> bool {
        let removed = self.inner.mailboxes.write().remove(agent_id).is_some();

        let target = Recipient::Agent(agent_id.clone());
        let orphaned: Vec<(String, PendingRequest)> = {
            let mut pending = self.inner.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, request)| request.to == target)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request)))
                .collect()
        };
        for (_, request) in orphaned {
            let _ = request
                .waiter
                .send(Err(CoordinationError::RecipientUnavailable(target.to_string())));
        }

        removed
    }

    pub fn is_registered(&self, agent_id: &AgentId) -> bool {
        self.inner.mailboxes.read().contains_key(agent_id)
    }

    pub fn registered_agents(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.inner.mailboxes.read().keys().cloned().collect();
        agents.sort();
        agents
    }

    pub fn register_handler(&self, topic: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.write().insert(topic.into(), handler);
    }

    pub fn unregister_handler(&self, topic: &str) -> bool {
        self.inner.handlers.write().remove(topic).is_some()
    }

    /// Send a request and wait for the correlated response. Resolves with
    /// `MessageTimeout` once `timeout` elapses without one.
    pub async fn request(
        &self,
        from: Address,
        to: Recipient,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Message> {
        if to == Recipient::Broadcast {
            return Err(CoordinationError::InvalidRequest(
                "requests need a single recipient; use broadcast for fan-out".to_string(),
            ));
        }

        let mut message = Message::new(from, to.clone(), MessageKind::Request, topic, payload);
        let correlation_id = message.id.to_string();
        message.correlation_id = Some(correlation_id.clone());
        message.expires_at = expiry_after(message.created_at, timeout);

        let deadline = deadline_after(timeout);
        let (waiter, receiver) = oneshot::channel();
        self.inner.pending.lock().insert(
            correlation_id.clone(),
            PendingRequest {
                to: to.clone(),
                deadline,
                waiter,
            },
        );
        let mut pending = PendingGuard {
            messaging: self.clone(),
            correlation_id: correlation_id.clone(),
            armed: true,
        };

        if let Err(e) = self.deliver(message) {
            pending.disarm();
            self.inner.pending.lock().remove(&correlation_id);
            return Err(e);
        }

        let outcome = tokio::time::timeout_at(deadline, receiver).await;
        pending.disarm();
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoordinationError::internal(format!(
                "waiter for request {correlation_id} dropped without an answer"
            ))),
            Err(_) => {
                self.inner.pending.lock().remove(&correlation_id);
                self.inner.expired.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %correlation_id, to = %to, "Request timed out");
                Err(CoordinationError::MessageTimeout { correlation_id })
            }
        }
    }

    /// Answer `request`. Fails with `UnknownCorrelation` if nobody is
    /// waiting for it and `MessageTimeout` if the request already expired.
    pub fn respond(&self, request: &Message, from: Address, payload: Value) -> Result<()> {
        let correlation_id = request.correlation_id.clone().ok_or_else(|| {
            CoordinationError::InvalidRequest(format!("message {} is not a request", request.id))
        })?;

        let Some(pending) = self.inner.pending.lock().remove(&correlation_id) else {
            return Err(CoordinationError::UnknownCorrelation { correlation_id });
        };

        if Instant::now() >= pending.deadline {
            self.inner.expired.fetch_add(1, Ordering::Relaxed);
            let _ = pending.waiter.send(Err(CoordinationError::MessageTimeout {
                correlation_id: correlation_id.clone(),
            }));
            return Err(CoordinationError::MessageTimeout { correlation_id });
        }

        let mut response = Message::new(
            from,
            request.from.clone().into(),
            MessageKind::Response,
            &request.topic,
            payload,
        );
        response.correlation_id = Some(correlation_id);

        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        // The requester may have given up a moment ago
        let _ = pending.waiter.send(Ok(response));
        Ok(())
    }

    /// Fire-and-forget event to one recipient (or everyone)
    pub fn notify(&self, from: Address, to: Recipient, topic: &str, payload: Value) -> Result<()> {
        if to == Recipient::Broadcast {
            self.broadcast(from, topic, payload);
            return Ok(());
        }
        let message = Message::new(from, to, MessageKind::Event, topic, payload);
        self.deliver(message)
    }

    /// Deliver an event to every registered agent except the sender.
    /// Returns the number of mailboxes reached.
    pub fn broadcast(&self, from: Address, topic: &str, payload: Value) -> usize {
        let mailboxes: Vec<(AgentId, mpsc::Sender<Message>)> = self
            .inner
            .mailboxes
            .read()
            .iter()
            .map(|(id, sender)| (id.clone(), sender.clone()))
            .collect();

        let mut reached = 0;
        for (agent_id, sender) in mailboxes {
            if from == Address::Agent(agent_id.clone()) {
                continue;
            }
            let message = Message::new(
                from.clone(),
                Recipient::Broadcast,
                MessageKind::Event,
                topic,
                payload.clone(),
            );
            self.inner.sent.fetch_add(1, Ordering::Relaxed);
            match sender.try_send(message) {
                Ok(()) => {
                    reached += 1;
                    self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(agent_id = %agent_id, topic = %topic, "Broadcast not delivered: {}", e);
                }
            }
        }
        reached
    }

    /// Fail every outstanding request past its deadline. Returns how many
    /// were expired.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, PendingRequest)> = {
            let mut pending = self.inner.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, request)| request.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request)))
                .collect()
        };

        for (correlation_id, request) in &expired {
            warn!(correlation_id = %correlation_id, to = %request.to, "Expiring outstanding request");
            self.inner.events.emit(CoordinationEvent::MessageExpired {
                correlation_id: correlation_id.clone(),
                to: request.to.to_string(),
            });
        }
        let count = expired.len();
        for (correlation_id, request) in expired {
            let _ = request
                .waiter
                .send(Err(CoordinationError::MessageTimeout { correlation_id }));
        }
        self.inner.expired.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn stats(&self) -> MessagingStats {
        MessagingStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            expired: self.inner.expired.load(Ordering::Relaxed),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.config.default_timeout()
    }

    fn deliver(&self, message: Message) -> Result<()> {
        self.inner.sent.fetch_add(1, Ordering::Relaxed);
        match message.to.clone() {
            Recipient::Agent(agent_id) => {
                let sender = self.inner.mailboxes.read().get(&agent_id).cloned();
                let Some(sender) = sender else {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(CoordinationError::RecipientUnavailable(format!("agent:{agent_id}")));
                };
                sender.try_send(message).map_err(|e| {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(agent_id = %agent_id, "Mailbox rejected message: {}", e);
                    CoordinationError::RecipientUnavailable(format!("agent:{agent_id}"))
                })?;
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Recipient::Coordinator => {
                self.dispatch_to_handler(message);
                Ok(())
            }
            Recipient::Broadcast => {
                self.broadcast(message.from, &message.topic, message.payload);
                Ok(())
            }
        }
    }

    fn dispatch_to_handler(&self, message: Message) {
        let handler = self.inner.handlers.read().get(&message.topic).cloned();
        let Some(handler) = handler else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %message.topic, from = %message.from, "No handler registered, dropping message");
            return;
        };

        self.inner.delivered.fetch_add(1, Ordering::Relaxed);
        let messaging = self.clone();
        tokio::spawn(async move {
            match handler.handle(&message).await {
                Ok(Some(reply)) if message.kind == MessageKind::Request => {
                    if let Err(e) = messaging.respond(&message, Address::Coordinator, reply) {
                        debug!(topic = %message.topic, "Handler reply not delivered: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(topic = %message.topic, "Message handler failed: {:#}", e),
            }
        });
    }
}

impl fmt::Debug for MessagingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingSystem")
            .field("mailboxes", &self.inner.mailboxes.read().len())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

/// Removes the pending entry if the waiting request future is dropped
struct PendingGuard {
    messaging: MessagingSystem,
    correlation_id: String,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.messaging.inner.pending.lock().remove(&self.correlation_id);
        }
    }
}
