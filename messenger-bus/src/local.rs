use async_trait::async_trait;
use messenger_core::MessengerResult;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::channel::Channel;
use crate::envelope::BusEnvelope;
use crate::EventBus;

struct Node {
    channels: HashSet<Channel>,
    inbound: mpsc::UnboundedSender<BusEnvelope>,
}

/// In-process stand-in for Redis pub/sub. Every attached bus behaves like a
/// separate process sharing the same broker.
#[derive(Clone, Default)]
pub struct LocalBusHub {
    nodes: Arc<Mutex<HashMap<Uuid, Node>>>,
}

impl LocalBusHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, process_id: Uuid) -> (LocalEventBus, mpsc::UnboundedReceiver<BusEnvelope>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.nodes.lock().await.insert(
            process_id,
            Node {
                channels: HashSet::new(),
                inbound: inbound_tx,
            },
        );
        let bus = LocalEventBus {
            process_id,
            hub: self.clone(),
        };
        (bus, inbound_rx)
    }
}

pub struct LocalEventBus {
    process_id: Uuid,
    hub: LocalBusHub,
}

impl LocalEventBus {
    pub async fn subscriptions(&self) -> HashSet<Channel> {
        self.hub
            .nodes
            .lock()
            .await
            .get(&self.process_id)
            .map(|node| node.channels.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    fn process_id(&self) -> Uuid {
        self.process_id
    }

    async fn publish(&self, envelope: &BusEnvelope) -> MessengerResult<usize> {
        let nodes = self.hub.nodes.lock().await;
        let mut receivers = 0;
        for node in nodes.values() {
            if node.channels.contains(&envelope.target) && node.inbound.send(envelope.clone()).is_ok() {
                receivers += 1;
            }
        }
        Ok(receivers)
    }

    async fn subscribe(&self, channel: Channel) -> MessengerResult<()> {
        if let Some(node) = self.hub.nodes.lock().await.get_mut(&self.process_id) {
            node.channels.insert(channel);
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: Channel) -> MessengerResult<()> {
        if let Some(node) = self.hub.nodes.lock().await.get_mut(&self.process_id) {
            node.channels.remove(&channel);
        }
        Ok(())
    }
}
