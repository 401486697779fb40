//! In-process message log with TCP ingest.
//!
//! Producers stream records into a role's ingest listener; the hub retains
//! a bounded tail per topic and fans messages out to subscribers. Tail
//! subscriptions start `n` messages back from the head, group
//! subscriptions resume from the group's last delivered offset.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{ConsumeError, LogConsumer, LogMessage};

/// How producer bytes are split into messages.
#[derive(Debug, Clone, Copy)]
pub enum Framing {
    /// Fixed-width binary records of the given size.
    FixedWidth(usize),
    /// Newline-delimited payloads (UTF-8 JSON events).
    Lines,
}

struct Topic {
    messages: VecDeque<LogMessage>,
    next_offset: u64,
    senders: Vec<mpsc::UnboundedSender<LogMessage>>,
    group_offsets: HashMap<String, u64>,
}

impl Topic {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            next_offset: 0,
            senders: Vec::new(),
            group_offsets: HashMap::new(),
        }
    }
}

struct HubInner {
    topics: HashMap<String, Topic>,
    retention: usize,
}

/// The in-process broker. A cheap clonable handle; all clones share the
/// same topics.
#[derive(Clone)]
pub struct LogHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LogHub {
    /// `retention` bounds how many messages each topic keeps for late
    /// subscribers.
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                topics: HashMap::new(),
                retention,
            })),
        }
    }

    pub fn create_topic(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.topics.entry(name.to_string()).or_insert_with(Topic::new);
    }

    /// Append a payload to a topic and fan it out to live subscribers.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        let retention = inner.retention;
        let topic = inner.topics.entry(topic.to_string()).or_insert_with(Topic::new);

        let message = LogMessage {
            offset: topic.next_offset,
            payload,
        };
        topic.next_offset += 1;

        topic.messages.push_back(message.clone());
        while topic.messages.len() > retention {
            topic.messages.pop_front();
        }

        topic.senders.retain(|tx| tx.send(message.clone()).is_ok());
    }

    /// Subscribe starting `last_n` messages back from the head of the
    /// topic.
    pub fn subscribe_tail(&self, topic: &str, last_n: usize) -> Result<HubConsumer, ConsumeError> {
        self.subscribe(topic, SubscribePos::Tail(last_n), None)
    }

    /// Subscribe resuming from `group`'s last delivered offset; a new
    /// group starts at the beginning of the retained window.
    pub fn subscribe_group(&self, topic: &str, group: &str) -> Result<HubConsumer, ConsumeError> {
        self.subscribe(topic, SubscribePos::Group, Some(group.to_string()))
    }

    fn subscribe(
        &self,
        topic_name: &str,
        pos: SubscribePos,
        group: Option<String>,
    ) -> Result<HubConsumer, ConsumeError> {
        let mut inner = self.inner.lock().unwrap();
        let topic = inner
            .topics
            .get_mut(topic_name)
            .ok_or_else(|| ConsumeError::UnknownTopic(topic_name.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();

        let from_offset = match pos {
            SubscribePos::Tail(n) => topic.next_offset.saturating_sub(n as u64),
            SubscribePos::Group => group
                .as_ref()
                .and_then(|g| topic.group_offsets.get(g).copied())
                .unwrap_or_else(|| topic.messages.front().map(|m| m.offset).unwrap_or(0)),
        };

        // seed the backlog under the lock so no publish can interleave
        for message in topic.messages.iter().filter(|m| m.offset >= from_offset) {
            let _ = tx.send(message.clone());
        }
        topic.senders.push(tx);

        Ok(HubConsumer {
            hub: self.clone(),
            topic: topic_name.to_string(),
            group,
            rx,
        })
    }

    fn commit(&self, topic: &str, group: &str, next_offset: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(topic) = inner.topics.get_mut(topic) {
            topic.group_offsets.insert(group.to_string(), next_offset);
        }
    }
}

enum SubscribePos {
    Tail(usize),
    Group,
}

/// A subscription handle implementing [`LogConsumer`].
pub struct HubConsumer {
    hub: LogHub,
    topic: String,
    group: Option<String>,
    rx: mpsc::UnboundedReceiver<LogMessage>,
}

#[async_trait]
impl LogConsumer for HubConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<LogMessage>, ConsumeError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(message)) => {
                if let Some(group) = &self.group {
                    self.hub.commit(&self.topic, group, message.offset + 1);
                }
                Ok(Some(message))
            }
            Ok(None) => Err(ConsumeError::Transport("log hub closed".to_string())),
            Err(_) => Ok(None),
        }
    }
}

/// Accept producer connections on `listener` and publish their framed
/// payloads into `hub`/`topic`. Runs until the listener fails.
pub async fn run_tcp_ingest(listener: TcpListener, hub: LogHub, topic: String, framing: Framing) {
    info!("ingest for topic '{}' listening", topic);
    loop {
        match listener.accept().await {
            Ok((mut stream, addr)) => {
                info!("producer connected from {}", addr);
                let hub = hub.clone();
                let topic = topic.clone();
                tokio::spawn(async move {
                    let mut buffer = vec![0u8; 8192];
                    let mut leftover: Vec<u8> = Vec::new();

                    loop {
                        match stream.read(&mut buffer).await {
                            Ok(0) => {
                                info!("producer {} disconnected", addr);
                                break;
                            }
                            Ok(n) => {
                                leftover.extend_from_slice(&buffer[..n]);
                                drain_frames(&mut leftover, framing, |payload| {
                                    hub.publish(&topic, payload)
                                });
                            }
                            Err(e) => {
                                error!("read error from {}: {}", addr, e);
                                break;
                            }
                        }
                    }
                });
            }
            Err(e) => {
                error!("ingest accept error: {}", e);
                return;
            }
        }
    }
}

fn drain_frames(leftover: &mut Vec<u8>, framing: Framing, mut publish: impl FnMut(Vec<u8>)) {
    match framing {
        Framing::FixedWidth(size) => {
            while leftover.len() >= size {
                let frame: Vec<u8> = leftover.drain(..size).collect();
                publish(frame);
            }
        }
        Framing::Lines => {
            while let Some(pos) = leftover.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = leftover.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if !line.is_empty() {
                    publish(line.to_vec());
                }
            }
        }
    }
}
