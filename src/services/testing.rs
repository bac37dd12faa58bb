//! Counting stub backends for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::services::delivery::{DeliveryError, DeliveryResponse, EmailBackend, PushBackend};
use crate::services::providers::{EmailBackendFactory, PushBackendFactory};

struct StubState {
    calls: AtomicUsize,
    fail_with: Option<String>,
    delay: Duration,
}

impl StubState {
    async fn invoke(&self, detail: &str) -> Result<DeliveryResponse, DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.fail_with {
            Some(msg) => Err(DeliveryError::new(msg.clone())),
            None => Ok(DeliveryResponse::new(detail).with_message_id("stub-1")),
        }
    }
}

fn state(fail_with: Option<String>) -> Arc<StubState> {
    Arc::new(StubState {
        calls: AtomicUsize::new(0),
        fail_with,
        delay: Duration::ZERO,
    })
}

#[derive(Clone)]
pub struct StubEmailBackend {
    state: Arc<StubState>,
}

impl StubEmailBackend {
    pub fn succeeding() -> Self {
        Self { state: state(None) }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            state: state(Some(message.to_string())),
        }
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Factory handing out this stub (sharing its call counter) for every provider.
    pub fn factory(&self) -> EmailBackendFactory {
        let stub = self.clone();
        Arc::new(move |_, _| Arc::new(stub.clone()) as Arc<dyn EmailBackend>)
    }
}

#[async_trait]
impl EmailBackend for StubEmailBackend {
    fn name(&self) -> &'static str {
        "Stub"
    }

    async fn send_email(
        &self,
        _subject: &str,
        _body: &str,
        recipients: &[String],
    ) -> Result<DeliveryResponse, DeliveryError> {
        self.state
            .invoke(&format!("stub accepted {} recipient(s)", recipients.len()))
            .await
    }
}

#[derive(Clone)]
pub struct StubPushBackend {
    state: Arc<StubState>,
}

impl StubPushBackend {
    pub fn succeeding() -> Self {
        Self { state: state(None) }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            state: state(Some(message.to_string())),
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            state: Arc::new(StubState {
                calls: AtomicUsize::new(0),
                fail_with: None,
                delay,
            }),
        }
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Each call builds a new client handle; all handles share one call counter.
    pub fn factory(&self) -> PushBackendFactory {
        let stub = self.clone();
        Arc::new(move |_| Ok(Arc::new(stub.clone()) as Arc<dyn PushBackend>))
    }
}

#[async_trait]
impl PushBackend for StubPushBackend {
    async fn send_push(
        &self,
        _title: &str,
        _body: &str,
        token: &str,
    ) -> Result<DeliveryResponse, DeliveryError> {
        self.state.invoke(&format!("stub pushed to {}", token)).await
    }
}

/// Application state over an in-memory database, stub backends and a running
/// scheduler. The scheduler stops when the returned sender is dropped.
pub async fn test_state(
    email: StubEmailBackend,
    push: StubPushBackend,
) -> (Arc<crate::AppState>, tokio::sync::broadcast::Sender<()>) {
    use crate::services::clock::{Clock, SystemClock};
    use crate::services::providers::ProviderRegistry;
    use crate::services::scheduler::JobScheduler;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let scheduler = Arc::new(JobScheduler::new(clock.clone(), Duration::from_millis(10)));
    let (shutdown, _) = tokio::sync::broadcast::channel(1);
    scheduler.start(shutdown.clone());

    let state = Arc::new(crate::AppState {
        db: crate::db::test_pool().await,
        registry: Arc::new(ProviderRegistry::new(email.factory(), push.factory())),
        scheduler,
        clock,
    });
    (state, shutdown)
}
