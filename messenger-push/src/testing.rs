use async_trait::async_trait;
use messenger_core::types::PushSubscription;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use crate::webpush::{PushError, PushTransport};

#[derive(Default)]
struct FakeState {
    delivered: Vec<String>,
    rejected: HashSet<String>,
    failures_left: HashMap<String, usize>,
    attempts: HashMap<String, usize>,
}

/// Push transport that records deliveries by endpoint and fails on demand.
#[derive(Default)]
pub struct FakeTransport {
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub async fn reject(&self, endpoint: &str) {
        self.state.lock().await.rejected.insert(endpoint.to_string());
    }

    /// The next `times` sends to `endpoint` fail transiently.
    pub async fn fail_times(&self, endpoint: &str, times: usize) {
        self.state.lock().await.failures_left.insert(endpoint.to_string(), times);
    }

    pub async fn delivered(&self) -> Vec<String> {
        self.state.lock().await.delivered.clone()
    }

    pub async fn attempts(&self, endpoint: &str) -> usize {
        self.state.lock().await.attempts.get(endpoint).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn send(&self, subscription: &PushSubscription, _payload: &[u8], _ttl: u32) -> Result<(), PushError> {
        let mut state = self.state.lock().await;
        let endpoint = subscription.endpoint.clone();
        *state.attempts.entry(endpoint.clone()).or_insert(0) += 1;

        if state.rejected.contains(&endpoint) {
            return Err(PushError::Rejected(format!("{} is gone", endpoint)));
        }
        if let Some(left) = state.failures_left.get_mut(&endpoint) {
            if *left > 0 {
                *left -= 1;
                return Err(PushError::Transient(format!("{} unavailable", endpoint)));
            }
        }
        state.delivered.push(endpoint);
        Ok(())
    }
}
