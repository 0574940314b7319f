// This file is part of Nightowl NVR, a security camera network video recorder.
// Copyright (C) 2024 The Nightowl NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Server-sent-event fan-out.
//!
//! Subscribers are held in an in-memory set; each published event is written
//! to every subscriber and a failed write removes that subscriber. There is
//! no replay: new subscribers see only future events.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EventKind {
    Connected,
    MovementNew,
    MovementUpdate,
    MovementComplete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::MovementNew => "movement_new",
            EventKind::MovementUpdate => "movement_update",
            EventKind::MovementComplete => "movement_complete",
        }
    }
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<Bytes>,
}

#[derive(Default)]
pub struct Hub {
    next_id: AtomicU64,
    clients: Mutex<HashMap<u64, mpsc::UnboundedSender<Bytes>>>,
}

fn frame(kind: EventKind, payload: Option<&serde_json::Value>) -> Bytes {
    let mut v = match payload {
        Some(p) => p.clone(),
        None => serde_json::json!({}),
    };
    if let Some(obj) = v.as_object_mut() {
        obj.insert(
            "type".to_owned(),
            serde_json::Value::String(kind.as_str().to_owned()),
        );
    }
    Bytes::from(format!("data: {v}\n\n"))
}

impl Hub {
    pub fn new() -> Self {
        Hub::default()
    }

    /// Registers a new subscriber; it immediately receives the `connected`
    /// hello and thereafter every published event.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(frame(EventKind::Connected, None));
        self.clients.lock().insert(id, tx);
        debug!(subscriber = id, "sse subscribed");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.clients.lock().remove(&id).is_some() {
            debug!(subscriber = id, "sse unsubscribed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Publishes one event to every subscriber, pruning the ones that are
    /// gone.
    pub fn publish<T: Serialize>(&self, kind: EventKind, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                debug!(err = %e, "unserializable sse payload");
                return;
            }
        };
        let data = frame(kind, Some(&payload));
        let mut clients = self.clients.lock();
        clients.retain(|id, tx| {
            let ok = tx.send(data.clone()).is_ok();
            if !ok {
                debug!(subscriber = id, "sse client gone; pruning");
            }
            ok
        });
    }

    /// Drops every subscriber, ending their streams.
    pub fn close_all(&self) {
        self.clients.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(b: Bytes) -> String {
        String::from_utf8(b.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn hello_then_events_in_order() {
        let hub = Hub::new();
        let mut sub = hub.subscribe();
        hub.publish(EventKind::MovementNew, &serde_json::json!({"key": "k1"}));
        hub.publish(EventKind::MovementUpdate, &serde_json::json!({"key": "k1"}));
        hub.publish(EventKind::MovementComplete, &serde_json::json!({"key": "k1"}));

        let hello = text(sub.rx.recv().await.unwrap());
        assert!(hello.starts_with("data: "), "{hello}");
        assert!(hello.contains(r#""type":"connected""#));
        for expected in ["movement_new", "movement_update", "movement_complete"] {
            let msg = text(sub.rx.recv().await.unwrap());
            assert!(msg.contains(&format!(r#""type":"{expected}""#)), "{msg}");
            assert!(msg.contains(r#""key":"k1""#));
            assert!(msg.ends_with("\n\n"));
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let hub = Hub::new();
        let sub = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);
        drop(sub);
        hub.publish(EventKind::MovementNew, &serde_json::json!({"key": "k"}));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_all_ends_streams() {
        let hub = Hub::new();
        let mut sub = hub.subscribe();
        let _hello = sub.rx.recv().await.unwrap();
        hub.close_all();
        assert!(sub.rx.recv().await.is_none());
    }
}
