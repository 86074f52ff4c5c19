//! Event publisher: pushes entity/exception/update notifications into the
//! config tree. Publishing is synchronous from the caller's point of view
//! and never propagates a failure back up the call stack — a dropped
//! notification is a logged problem, not one that should abort whatever
//! state-machine step triggered it.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::config::ConfigClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Entity,
    Exception,
    Update,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Topic::Entity => "entity",
            Topic::Exception => "exception",
            Topic::Update => "update",
        };
        write!(f, "{s}")
    }
}

pub struct Event {
    pub topic: Topic,
    pub path: Vec<String>,
    pub payload: Value,
}

pub struct EventPublisher<C: ConfigClient> {
    client: Arc<C>,
}

impl<C: ConfigClient> EventPublisher<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Writes `event` onto the config tree at `events/<topic>/<path>`. Any
    /// failure (transport error, tree rejecting the write) is logged at
    /// `warn` and swallowed: publishers must never block or fail the
    /// operation that produced the event.
    pub async fn publish(&self, event: Event) {
        let mut full_path = vec!["events".to_string(), event.topic.to_string()];
        full_path.extend(event.path.iter().cloned());
        if let Err(err) = self.client.set(&full_path, event.payload.clone()).await {
            warn!(path = %crate::config::path_to_string(&full_path), topic = %event.topic, error = %err, "failed to publish event");
        }
    }

    pub async fn entity(&self, path: Vec<String>, payload: Value) {
        self.publish(Event {
            topic: Topic::Entity,
            path,
            payload,
        })
        .await;
    }

    pub async fn exception(&self, path: Vec<String>, reason: &str) {
        self.publish(Event {
            topic: Topic::Exception,
            path,
            payload: serde_json::json!({ "reason": reason }),
        })
        .await;
    }

    pub async fn update(&self, path: Vec<String>, payload: Value) {
        self.publish(Event {
            topic: Topic::Update,
            path,
            payload,
        })
        .await;
    }
}
