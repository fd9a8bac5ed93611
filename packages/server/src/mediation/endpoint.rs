//! Adapter from any `tower::Service<Message>` to an [`Endpoint`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relaybus_core::Message;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

use crate::traits::Endpoint;

/// Endpoint backed by a tower service.
///
/// Each send drives a clone of the service through `oneshot`, so concurrent
/// sends never contend on `poll_ready`. An optional timeout bounds every call.
pub struct ServiceEndpoint {
    name: String,
    url: String,
    service: Mutex<BoxCloneService<Message, Message, anyhow::Error>>,
    available: AtomicBool,
    timeout: Option<Duration>,
}

impl ServiceEndpoint {
    pub fn new<S>(name: impl Into<String>, url: impl Into<String>, service: S) -> Self
    where
        S: Service<Message, Response = Message> + Clone + Send + 'static,
        S::Error: Into<anyhow::Error>,
        S::Future: Send + 'static,
    {
        Self {
            name: name.into(),
            url: url.into(),
            service: Mutex::new(BoxCloneService::new(service.map_err(Into::into))),
            available: AtomicBool::new(true),
            timeout: None,
        }
    }

    /// Loopback endpoint answering every request with its own payload.
    #[must_use]
    pub fn echo(name: impl Into<String>) -> Self {
        let name = name.into();
        let url = format!("loopback://{name}");
        Self::new(
            name,
            url,
            tower::service_fn(|request: Message| async move {
                Ok::<_, anyhow::Error>(request.reply(request.payload.clone()))
            }),
        )
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Marks the endpoint up or down; a down endpoint is skipped by proxies.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }
}

#[async_trait]
impl Endpoint for ServiceEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, message: &Message) -> anyhow::Result<Message> {
        let service = self.service.lock().clone();
        let call = service.oneshot(message.clone());
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| anyhow::anyhow!("endpoint {} timed out after {limit:?}", self.name))?,
            None => call.await,
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("available", &self.is_available())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use relaybus_core::Direction;

    use super::*;

    #[tokio::test]
    async fn echo_replies_with_payload() {
        let endpoint = ServiceEndpoint::echo("echo");
        assert_eq!(endpoint.url(), "loopback://echo");

        let reply = endpoint.send(&Message::new("ping")).await.unwrap();
        assert_eq!(reply.payload, b"ping".to_vec());
        assert_eq!(reply.direction, Direction::Outbound);
    }

    #[tokio::test]
    async fn service_errors_surface_as_anyhow() {
        let endpoint = ServiceEndpoint::new(
            "broken",
            "test://broken",
            tower::service_fn(|_: Message| async {
                Err::<Message, _>(std::io::Error::other("refused"))
            }),
        );
        let err = endpoint.send(&Message::new("x")).await.unwrap_err();
        assert!(err.to_string().contains("refused"));
    }

    #[tokio::test]
    async fn timeout_bounds_slow_calls() {
        let endpoint = ServiceEndpoint::new(
            "slow",
            "test://slow",
            tower::service_fn(|m: Message| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, anyhow::Error>(m)
            }),
        )
        .with_timeout(Duration::from_millis(20));

        let err = endpoint.send(&Message::new("x")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn availability_toggles() {
        let endpoint = ServiceEndpoint::echo("e");
        assert!(endpoint.is_available());
        endpoint.set_available(false);
        assert!(!endpoint.is_available());
    }
}
