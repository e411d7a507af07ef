use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use rapport_core::errors::ProviderError;
use rapport_core::provider::{ReasoningProvider, ReasoningRequest};

/// Pre-programmed replies for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Return this JSON object as the provider reply.
    Reply(Value),
    /// Fail the call with this error.
    Error(ProviderError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn reply(value: Value) -> Self {
        Self::Reply(value)
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
///
/// With `repeat_last`, the final scripted response answers every call past
/// the end of the script; otherwise extra calls fail with `InvalidRequest`.
pub struct MockProvider {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    repeat_last: bool,
    available: bool,
    requests: Mutex<Vec<ReasoningRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            repeat_last: false,
            available: true,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with the same response.
    pub fn always(response: MockResponse) -> Self {
        Self {
            repeat_last: true,
            ..Self::new(vec![response])
        }
    }

    /// Report the provider as unavailable (e.g. missing credentials).
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<ReasoningRequest> {
        self.requests.lock().clone()
    }

    fn response_for(&self, idx: usize) -> Option<&MockResponse> {
        match self.responses.get(idx) {
            Some(r) => Some(r),
            None if self.repeat_last => self.responses.last(),
            None => None,
        }
    }
}

#[async_trait]
impl ReasoningProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn complete(&self, request: &ReasoningRequest) -> Result<Value, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let Some(response) = self.response_for(idx) else {
            return Err(ProviderError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: &MockResponse) -> Result<Value, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Reply(value) => return Ok(value.clone()),
            MockResponse::Error(e) => return Err(e.clone()),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}
