use async_trait::async_trait;
use herald::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// How [`MockGateway`] answers each call.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Every token succeeds.
    DeliverAll,
    /// Fixed per-token tallies.
    Tallies(BatchResponse),
    /// The call fails as a whole.
    Error(String),
}

#[derive(Clone)]
pub struct MockGateway {
    calls: Arc<Mutex<Vec<MulticastMessage>>>,
    response: Arc<Mutex<MockResponse>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::with_response(MockResponse::DeliverAll)
    }

    pub fn with_response(response: MockResponse) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            response: Arc::new(Mutex::new(response)),
            delay: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_response(&self, response: MockResponse) {
        *self.response.lock() = response;
    }

    /// Sleep this long inside every call before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<MulticastMessage> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(
            actual, expected,
            "Expected {} gateway calls, got {}",
            expected, actual
        );
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryGateway for MockGateway {
    async fn send_multicast(
        &self,
        message: &MulticastMessage,
    ) -> anyhow::Result<BatchResponse> {
        self.calls.lock().push(message.clone());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let response = self.response.lock().clone();
        match response {
            MockResponse::DeliverAll => {
                Ok(BatchResponse::new(message.tokens.len(), 0))
            }
            MockResponse::Tallies(tallies) => Ok(tallies),
            MockResponse::Error(error) => Err(anyhow::anyhow!(error)),
        }
    }
}
