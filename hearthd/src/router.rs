//! Output router: one subscriber slot per group plus a fallback buffer.
//!
//! Events from container runs and the IPC mediator go to the group's live
//! subscriber when one is attached, otherwise message events accumulate in a
//! bounded buffer that is drained, in order, ahead of live delivery when the
//! next subscriber attaches. Terminal events (done/error) are meaningful only
//! to an attached stream and are dropped when nobody is listening.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use hearth_core::{now_iso, AgentEvent};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Fallback buffer bound per group; overflow drops the oldest entry.
const BUFFER_CAPACITY: usize = 1000;
/// In-flight capacity of a subscriber channel.
const CHANNEL_CAPACITY: usize = 64;

struct Subscriber {
    token: u64,
    tx: mpsc::Sender<AgentEvent>,
}

struct Buffered {
    text: String,
    #[allow(dead_code)]
    at: String,
}

#[derive(Default)]
struct Inner {
    next_token: u64,
    subscribers: HashMap<String, Subscriber>,
    buffers: HashMap<String, VecDeque<Buffered>>,
}

/// Handed to a new subscriber: buffered backlog first, then the live channel.
pub struct Subscription {
    pub token: u64,
    pub backlog: Vec<AgentEvent>,
    pub rx: mpsc::Receiver<AgentEvent>,
}

#[derive(Default)]
pub struct OutputRouter {
    inner: Mutex<Inner>,
}

impl OutputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber for a group, draining any buffered messages into
    /// the backlog. An existing subscriber for the group is displaced (its
    /// channel closes); the HTTP layer's 409 rule keeps that from happening
    /// in practice.
    pub fn subscribe(&self, group_id: &str) -> Subscription {
        let mut inner = self.inner.lock().unwrap();
        inner.next_token += 1;
        let token = inner.next_token;

        let backlog = inner
            .buffers
            .remove(group_id)
            .map(|buf| {
                buf.into_iter()
                    .map(|b| AgentEvent::Message { text: b.text })
                    .collect()
            })
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        if inner
            .subscribers
            .insert(group_id.to_string(), Subscriber { token, tx })
            .is_some()
        {
            warn!(group_id, "displacing existing output subscriber");
        }

        Subscription { token, backlog, rx }
    }

    /// Detach the subscriber if the token still matches.
    pub fn unsubscribe(&self, group_id: &str, token: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .subscribers
            .get(group_id)
            .is_some_and(|s| s.token == token)
        {
            inner.subscribers.remove(group_id);
        }
    }

    pub fn has_subscriber(&self, group_id: &str) -> bool {
        self.inner.lock().unwrap().subscribers.contains_key(group_id)
    }

    /// Deliver an event: live subscriber first, buffer as fallback. A send
    /// failure means the receiver is gone; the subscriber is dropped and the
    /// event falls back to the buffer.
    pub async fn emit(&self, group_id: &str, event: AgentEvent) {
        let slot = {
            let inner = self.inner.lock().unwrap();
            inner
                .subscribers
                .get(group_id)
                .map(|s| (s.token, s.tx.clone()))
        };

        if let Some((token, tx)) = slot {
            match tx.send(event).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    self.unsubscribe(group_id, token);
                    self.buffer(group_id, event);
                }
            }
        } else {
            self.buffer(group_id, event);
        }
    }

    /// Take and clear the buffered messages for a group.
    pub fn drain_buffer(&self, group_id: &str) -> Vec<AgentEvent> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .buffers
            .remove(group_id)
            .map(|buf| {
                buf.into_iter()
                    .map(|b| AgentEvent::Message { text: b.text })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Return undelivered events to the front of the buffer. Used when a
    /// subscriber disconnects with events still in its channel.
    pub fn restore(&self, group_id: &str, events: Vec<AgentEvent>) {
        let mut inner = self.inner.lock().unwrap();
        let buf = inner.buffers.entry(group_id.to_string()).or_default();
        for event in events.into_iter().rev() {
            if let AgentEvent::Message { text } = event {
                buf.push_front(Buffered {
                    text,
                    at: now_iso(),
                });
            }
        }
        while buf.len() > BUFFER_CAPACITY {
            buf.pop_back();
        }
    }

    fn buffer(&self, group_id: &str, event: AgentEvent) {
        match event {
            AgentEvent::Message { text } => {
                let mut inner = self.inner.lock().unwrap();
                let buf = inner.buffers.entry(group_id.to_string()).or_default();
                if buf.len() >= BUFFER_CAPACITY {
                    buf.pop_front();
                    debug!(group_id, "message buffer full, dropped oldest");
                }
                buf.push_back(Buffered {
                    text,
                    at: now_iso(),
                });
            }
            other => {
                debug!(group_id, event = ?other, "no subscriber for terminal event, dropped");
            }
        }
    }
}
