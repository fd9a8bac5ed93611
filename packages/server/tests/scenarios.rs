//! End-to-end scenarios driven through `BusContext` with a manual clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relaybus_core::{properties, ManualClock, Message, Value};
use relaybus_server::mediation::{FnMediator, MediationContext};
use relaybus_server::qos::{CircuitBreakerConfig, CircuitState, ThrottlingPolicy, ThrottlingType};
use relaybus_server::{
    BusConfig, BusContext, MediationError, MediationSequence, Mediator, MessageDeliveryCallback,
    ProxyService, ServiceEndpoint,
};

fn bus_with(config: BusConfig) -> (BusContext, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let bus = BusContext::builder(config).clock(clock.clone()).build().unwrap();
    (bus, clock)
}

/// Mediator counting its invocations, optionally stopping the flow.
struct Counting {
    name: &'static str,
    calls: AtomicUsize,
    stop: bool,
}

impl Counting {
    fn new(name: &'static str, stop: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            calls: AtomicUsize::new(0),
            stop,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mediator for Counting {
    fn name(&self) -> &str {
        self.name
    }

    async fn mediate(
        &self,
        message: &mut Message,
        _ctx: &MediationContext,
    ) -> Result<(), MediationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        message.payload.extend_from_slice(self.name.as_bytes());
        if self.stop {
            message.stop_flow();
        }
        Ok(())
    }
}

/// Records delivery attempts without acknowledging anything.
#[derive(Default)]
struct Recorder {
    attempts: Mutex<Vec<String>>,
}

impl Recorder {
    fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl MessageDeliveryCallback for Recorder {
    async fn on_delivery(&self, message_id: &str, _payload: &[u8]) -> anyhow::Result<()> {
        self.attempts.lock().push(message_id.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn breaker_opens_decays_and_closes_through_proxy() {
    let mut config = BusConfig::default();
    config.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 3,
        reset_timeout_ms: 1_000,
        consecutive_success_threshold: 2,
    };
    let (bus, clock) = bus_with(config);

    let healthy = Arc::new(AtomicBool::new(false));
    let flag = healthy.clone();
    bus.registry().register_endpoint(Arc::new(ServiceEndpoint::new(
        "inventory",
        "test://inventory",
        tower::service_fn(move |request: Message| {
            let healthy = flag.load(Ordering::SeqCst);
            async move {
                anyhow::ensure!(healthy, "inventory unavailable");
                Ok(request.reply("in stock"))
            }
        }),
    )));
    bus.registry().register_proxy(ProxyService::new("stock").target("inventory"));
    bus.start().await.unwrap();

    for _ in 0..3 {
        let err = bus.process("stock", Message::new("sku-1")).await.unwrap_err();
        assert!(matches!(err.root_cause(), MediationError::EndpointFailed { .. }));
    }
    assert_eq!(bus.qos().circuit_state("inventory"), CircuitState::Open);

    let err = bus.process("stock", Message::new("sku-1")).await.unwrap_err();
    assert!(matches!(
        err.root_cause(),
        MediationError::CircuitOpen { service_id } if service_id == "inventory"
    ));

    clock.advance(Duration::from_millis(1_001));
    assert_eq!(bus.qos().circuit_state("inventory"), CircuitState::HalfOpen);

    healthy.store(true, Ordering::SeqCst);
    bus.process("stock", Message::new("sku-1")).await.unwrap();
    assert_eq!(bus.qos().circuit_state("inventory"), CircuitState::HalfOpen);
    let reply = bus.process("stock", Message::new("sku-1")).await.unwrap();
    assert_eq!(reply.payload, b"in stock".to_vec());
    assert_eq!(bus.qos().circuit_state("inventory"), CircuitState::Closed);

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn stop_flow_short_circuits_sequence() {
    let (bus, _) = bus_with(BusConfig::default());
    let (a, b, c) = (
        Counting::new("A", true),
        Counting::new("B", false),
        Counting::new("C", false),
    );
    bus.registry().register_sequence(
        MediationSequence::new("main")
            .mediator(a.clone())
            .mediator(b.clone())
            .mediator(c.clone()),
    );
    bus.start().await.unwrap();

    let out = bus.mediate(Message::new(""), "main").await.unwrap();
    assert_eq!(out.payload, b"A".to_vec());
    assert!(out.is_flow_stopped());
    assert_eq!((a.calls(), b.calls(), c.calls()), (1, 0, 0));

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn ordered_delivery_waits_for_acknowledgement() {
    let (bus, _) = bus_with(BusConfig::default());
    let recorder = Arc::new(Recorder::default());
    bus.qos().reliable().set_callback(recorder.clone());
    bus.start().await.unwrap();

    let m1 = bus.qos().send_reliable(b"m1".to_vec(), Some("X")).await.unwrap();
    let m2 = bus.qos().send_reliable(b"m2".to_vec(), Some("X")).await.unwrap();
    assert_eq!(recorder.attempts(), vec![m1.clone()]);

    bus.qos().reliable().retry_sweep().await;
    assert!(!recorder.attempts().contains(&m2));

    assert!(bus.qos().acknowledge(&m1).await);
    assert_eq!(recorder.attempts(), vec![m1.clone(), m2.clone()]);
    assert!(!bus.qos().acknowledge(&m1).await);

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn unacknowledged_message_is_dead_lettered_after_two_sweeps() {
    let mut config = BusConfig::default();
    config.reliable.max_retries = 2;
    config.reliable.ack_timeout_ms = 1_000;
    let (bus, clock) = bus_with(config);
    let recorder = Arc::new(Recorder::default());
    let reliable = bus.qos().reliable().clone();
    reliable.set_callback(recorder.clone());
    let mut dead_letters = reliable.subscribe_dead_letters();
    bus.start().await.unwrap();

    let id = bus.qos().send_reliable(b"never acked".to_vec(), None).await.unwrap();

    clock.advance(Duration::from_millis(1_000));
    reliable.retry_sweep().await;
    assert!(reliable.is_pending(&id));

    clock.advance(Duration::from_millis(1_000));
    reliable.retry_sweep().await;
    assert!(!reliable.is_pending(&id));
    assert_eq!(reliable.dead_letter_ids(), vec![id.clone()]);
    assert_eq!(recorder.attempts().len(), 2);
    assert_eq!(dead_letters.recv().await.unwrap().message_id, id);

    assert!(reliable.reprocess_dead_letter(&id).await);
    assert!(reliable.is_pending(&id));
    assert_eq!(recorder.attempts().len(), 3);

    bus.shutdown().await.unwrap();
}

#[tokio::test]
async fn proxy_pipeline_with_throttling_and_fault_sequence() {
    let mut config = BusConfig::default();
    config
        .throttling
        .policies
        .push(ThrottlingPolicy::new("per-client", ThrottlingType::ClientBased, 2));
    let (bus, _) = bus_with(config);
    let registry = bus.registry();
    registry.register_endpoint(Arc::new(ServiceEndpoint::echo("echo")));
    registry.register_sequence(MediationSequence::new("upper").mediator(Arc::new(FnMediator::new(
        "upper",
        |m| {
            m.payload = m.payload.to_ascii_uppercase();
            Ok(())
        },
    ))));
    registry.register_sequence(MediationSequence::new("reject").mediator(Arc::new(FnMediator::new(
        "busy",
        |m| {
            m.payload = b"busy".to_vec();
            Ok(())
        },
    ))));
    registry.register_proxy(
        ProxyService::new("api")
            .target("echo")
            .out_sequence("upper")
            .throttle_policy("per-client")
            .fault_sequence("reject"),
    );
    bus.start().await.unwrap();

    let request = |client: &str| Message::new("ping").with_property(properties::CLIENT_ID, client);
    for _ in 0..2 {
        let reply = bus.process("api", request("alice")).await.unwrap();
        assert_eq!(reply.payload, b"PING".to_vec());
    }
    let throttled = bus.process("api", request("alice")).await.unwrap();
    assert_eq!(throttled.payload, b"busy".to_vec());
    assert_eq!(
        throttled.property(properties::ERROR_SEQUENCE),
        Some(&Value::from("api"))
    );

    let other = bus.process("api", request("bob")).await.unwrap();
    assert_eq!(other.payload, b"PING".to_vec());

    bus.shutdown().await.unwrap();
}
