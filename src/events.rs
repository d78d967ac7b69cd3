//! Channel lifecycle events and the emitter applications subscribe through.

use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::identity::{ClientDisconnected, ProviderIdentity};
use crate::message::types::{DesktopEvent, CHANNEL_TOPIC};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEventKind {
    Connected,
    Disconnected,
    ClientDisconnected,
}

impl ChannelEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelEventKind::Connected => "connected",
            ChannelEventKind::Disconnected => "disconnected",
            ChannelEventKind::ClientDisconnected => "client-disconnected",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "connected" => Some(ChannelEventKind::Connected),
            "disconnected" => Some(ChannelEventKind::Disconnected),
            "client-disconnected" => Some(ChannelEventKind::ClientDisconnected),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A provider created a channel.
    Connected(ProviderIdentity),
    /// A provider's channel went away.
    Disconnected(ProviderIdentity),
    /// A client left a channel this application provides.
    ClientDisconnected(ClientDisconnected),
}

impl ChannelEvent {
    pub fn kind(&self) -> ChannelEventKind {
        match self {
            ChannelEvent::Connected(_) => ChannelEventKind::Connected,
            ChannelEvent::Disconnected(_) => ChannelEventKind::Disconnected,
            ChannelEvent::ClientDisconnected(_) => ChannelEventKind::ClientDisconnected,
        }
    }

    pub fn channel_name(&self) -> &str {
        match self {
            ChannelEvent::Connected(identity) | ChannelEvent::Disconnected(identity) => {
                &identity.channel_name
            }
            ChannelEvent::ClientDisconnected(client) => &client.channel_name,
        }
    }

    /// Decode a pushed desktop event. `Ok(None)` for other topics or types.
    pub fn from_desktop_event(event: DesktopEvent) -> Result<Option<Self>> {
        if event.topic != CHANNEL_TOPIC {
            return Ok(None);
        }
        let event = match ChannelEventKind::parse(&event.kind) {
            Some(ChannelEventKind::Connected) => {
                ChannelEvent::Connected(serde_json::from_value(event.body)?)
            }
            Some(ChannelEventKind::Disconnected) => {
                ChannelEvent::Disconnected(serde_json::from_value(event.body)?)
            }
            Some(ChannelEventKind::ClientDisconnected) => {
                ChannelEvent::ClientDisconnected(serde_json::from_value(event.body)?)
            }
            None => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn to_desktop_event(&self) -> Result<DesktopEvent> {
        let body = match self {
            ChannelEvent::Connected(identity) | ChannelEvent::Disconnected(identity) => {
                serde_json::to_value(identity)?
            }
            ChannelEvent::ClientDisconnected(client) => serde_json::to_value(client)?,
        };
        Ok(DesktopEvent {
            topic: CHANNEL_TOPIC.to_string(),
            kind: self.kind().as_str().to_string(),
            body,
        })
    }
}

pub type Listener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    kind: ChannelEventKind,
    listener: Listener,
}

/// Named-event listener registry with a broadcast feed for async consumers.
pub struct EventEmitter {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    feed: broadcast::Sender<ChannelEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            feed,
        }
    }

    pub fn on(&self, kind: ChannelEventKind, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push(Registration { id, kind, listener });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self, kind: ChannelEventKind) -> usize {
        self.listeners
            .read()
            .iter()
            .filter(|registration| registration.kind == kind)
            .count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.feed.subscribe()
    }

    /// Invoke every listener registered for the event's kind, then publish it
    /// on the broadcast feed.
    pub fn emit(&self, event: &ChannelEvent) {
        let kind = event.kind();
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .filter(|registration| registration.kind == kind)
            .map(|registration| registration.listener.clone())
            .collect();

        for listener in listeners {
            listener(event);
        }

        // no receivers is fine
        let _ = self.feed.send(event.clone());
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(64)
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("listeners", &self.listeners.read().len())
            .field("subscribers", &self.feed.receiver_count())
            .finish()
    }
}

/// Payload shape used when events travel as plain JSON.
pub fn event_body(event: &ChannelEvent) -> Result<Value> {
    Ok(serde_json::to_value(event.to_desktop_event()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn provider(name: &str) -> ProviderIdentity {
        ProviderIdentity {
            channel_id: format!("{name}-id"),
            channel_name: name.to_string(),
            uuid: "app".to_string(),
            name: "app".to_string(),
        }
    }

    #[test]
    fn test_listeners_filtered_by_kind() {
        let emitter = EventEmitter::default();
        let connected = Arc::new(AtomicUsize::new(0));
        let disconnected = Arc::new(AtomicUsize::new(0));

        {
            let connected = connected.clone();
            emitter.on(
                ChannelEventKind::Connected,
                Arc::new(move |_: &ChannelEvent| {
                    connected.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        {
            let disconnected = disconnected.clone();
            emitter.on(
                ChannelEventKind::Disconnected,
                Arc::new(move |_: &ChannelEvent| {
                    disconnected.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        emitter.emit(&ChannelEvent::Connected(provider("a")));
        emitter.emit(&ChannelEvent::Connected(provider("b")));
        emitter.emit(&ChannelEvent::Disconnected(provider("a")));

        assert_eq!(connected.load(Ordering::SeqCst), 2);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_listener() {
        let emitter = EventEmitter::default();
        let id = emitter.on(ChannelEventKind::Connected, Arc::new(|_: &ChannelEvent| {}));
        assert_eq!(emitter.listener_count(ChannelEventKind::Connected), 1);
        assert!(emitter.remove_listener(id));
        assert!(!emitter.remove_listener(id));
        assert_eq!(emitter.listener_count(ChannelEventKind::Connected), 0);
    }

    #[tokio::test]
    async fn test_subscribe_feed() {
        let emitter = EventEmitter::default();
        let mut feed = emitter.subscribe();
        emitter.emit(&ChannelEvent::Disconnected(provider("prices")));
        let event = feed.recv().await.unwrap();
        assert_eq!(event.kind(), ChannelEventKind::Disconnected);
        assert_eq!(event.channel_name(), "prices");
    }

    #[test]
    fn test_desktop_event_conversion() {
        let event = ChannelEvent::ClientDisconnected(ClientDisconnected {
            uuid: "client".to_string(),
            name: "client".to_string(),
            channel_name: "prices".to_string(),
            channel_id: Some("prices-id".to_string()),
        });
        let body = event_body(&event).unwrap();
        assert_eq!(body["type"], "client-disconnected");
        assert_eq!(body["topic"], "channel");
        assert_eq!(body["channelName"], "prices");

        let decoded: DesktopEvent = serde_json::from_value(body).unwrap();
        assert_eq!(ChannelEvent::from_desktop_event(decoded).unwrap(), Some(event));

        let other: DesktopEvent =
            serde_json::from_value(json!({ "topic": "window", "type": "closed" })).unwrap();
        assert_eq!(ChannelEvent::from_desktop_event(other).unwrap(), None);
    }
}
