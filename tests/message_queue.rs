// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use message_queue::{
    diagnostics::{Diagnostic, DiagnosticSink},
    errors::TransportError,
    exchange::{ExchangeDefinition, ExchangeKind},
    handler_fn,
    memory::{MemoryBroker, MemoryTransport},
    publisher::Publisher,
    queue::{QueueBinding, QueueDefinition},
    topology::AmqpTopology,
    AmqpError, CancellationToken, Delivery, HandlerError, MessageQueue,
};
use opentelemetry::{
    propagation::{text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator},
    Context,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
}

#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
    fn reports(&self) -> Vec<Diagnostic> {
        self.reports.lock().unwrap().clone()
    }
}

impl DiagnosticSink for RecordingSink {
    fn report(&self, diagnostic: Diagnostic) {
        self.reports.lock().unwrap().push(diagnostic);
    }
}

struct Harness {
    broker: MemoryBroker,
    transport: Arc<MemoryTransport>,
    mq: Arc<MessageQueue>,
    sink: Arc<RecordingSink>,
    cancel: CancellationToken,
}

impl Harness {
    async fn new(name: &str) -> Harness {
        Harness::on(MemoryBroker::new(), name).await
    }

    async fn on(broker: MemoryBroker, name: &str) -> Harness {
        let transport = Arc::new(broker.connect());
        let sink = Arc::new(RecordingSink::default());
        let mq = MessageQueue::with_transport(name, transport.clone())
            .await
            .unwrap()
            .with_diagnostics(sink.clone());

        Harness {
            broker,
            transport,
            mq: Arc::new(mq),
            sink,
            cancel: CancellationToken::new(),
        }
    }

    fn listen(&self) -> JoinHandle<Result<(), AmqpError>> {
        let mq = self.mq.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { mq.listen(cancel).await })
    }
}

/// Handler forwarding every delivery it sees, tagged with `label`.
fn forwarding(
    label: &'static str,
) -> (
    Arc<dyn message_queue::MessageHandler>,
    UnboundedReceiver<(&'static str, Delivery)>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |_ctx, delivery: Delivery| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((label, delivery));
            Ok::<(), HandlerError>(())
        }
    });
    (handler, rx)
}

async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("handler channel closed")
}

/// True when no delivery shows up for a while. A closed channel counts as
/// nothing: its handler was dropped.
async fn nothing<T>(rx: &mut UnboundedReceiver<T>) -> bool {
    !matches!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv()).await,
        Ok(Some(_))
    )
}

async fn wait_for_reports(sink: &RecordingSink, count: usize) -> Vec<Diagnostic> {
    tokio::time::timeout(WAIT, async {
        loop {
            let reports = sink.reports();
            if reports.len() >= count {
                return reports;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for diagnostics")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_declares_home_topology() {
    let h = Harness::new("orders").await;

    assert_eq!(h.mq.exchange_name(), "orders-exchange");
    assert_eq!(h.mq.queue_name(), "orders-queue");

    let exchange = h.broker.exchange("orders-exchange").unwrap();
    assert_eq!(exchange.exchange_kind(), ExchangeKind::Direct);
    assert!(exchange.is_durable());
    assert_eq!(
        h.broker.queue("orders-queue"),
        Some(QueueDefinition::new("orders-queue").exclusive())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn published_message_reaches_subscribed_handler() {
    let h = Harness::new("orders").await;
    let (handler, mut rx) = forwarding("created");

    h.mq.subscribe("created", "orders-exchange", handler)
        .await
        .unwrap();
    assert_eq!(
        h.broker.bindings("orders-queue"),
        vec![QueueBinding::new("orders-queue")
            .exchange("orders-exchange")
            .routing_key("created")]
    );

    let listening = h.listen();
    h.mq.publish_json(&Context::new(), "created", &Order { id: 1 })
        .await
        .unwrap();

    let (label, delivery) = next(&mut rx).await;
    assert_eq!(label, "created");
    assert_eq!(delivery.json::<Order>(), Ok(Order { id: 1 }));
    assert_eq!(delivery.exchange, "orders-exchange");
    assert_eq!(delivery.content_type.as_deref(), Some("application/json"));
    assert!(nothing(&mut rx).await);

    h.cancel.cancel();
    assert_eq!(listening.await.unwrap(), Ok(()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_from_another_connection_reaches_handler() {
    let h = Harness::new("orders").await;
    let (handler, mut rx) = forwarding("created");
    h.mq.subscribe("created", "orders-exchange", handler)
        .await
        .unwrap();
    let _listening = h.listen();

    let other = Publisher::new(Arc::new(h.broker.connect()));
    other
        .publish(&Context::new(), "orders-exchange", "created", br#"{"id":1}"#)
        .await
        .unwrap();

    let (_, delivery) = next(&mut rx).await;
    assert_eq!(delivery.data, br#"{"id":1}"#);
    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribing_to_foreign_exchange_creates_it() {
    let h = Harness::new("orders").await;
    assert!(!h.broker.has_exchange("foreign-exchange"));

    let (handler, _rx) = forwarding("x");
    h.mq.subscribe("x", "foreign-exchange", handler)
        .await
        .unwrap();

    let exchange = h.broker.exchange("foreign-exchange").unwrap();
    assert_eq!(exchange.exchange_kind(), ExchangeKind::Direct);
    assert!(exchange.is_durable());
    assert_eq!(
        h.broker.bindings("orders-queue"),
        vec![QueueBinding::new("orders-queue")
            .exchange("foreign-exchange")
            .routing_key("x")]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn listens_to_another_instance_topic() {
    let broker = MemoryBroker::new();
    let orders = Harness::on(broker.clone(), "orders").await;
    let billing = Harness::on(broker, "billing").await;

    let (handler, mut rx) = forwarding("paid");
    orders
        .mq
        .subscribe("invoice.paid", "billing-exchange", handler)
        .await
        .unwrap();
    let _listening = orders.listen();

    billing
        .mq
        .publish_json(&Context::new(), "invoice.paid", &Order { id: 7 })
        .await
        .unwrap();

    let (_, delivery) = next(&mut rx).await;
    assert_eq!(delivery.exchange, "billing-exchange");
    assert_eq!(delivery.json::<Order>(), Ok(Order { id: 7 }));
    orders.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publishing_without_subscribers_succeeds() {
    let h = Harness::new("orders").await;
    let (handler, mut rx) = forwarding("created");
    h.mq.subscribe("created", "orders-exchange", handler)
        .await
        .unwrap();
    let _listening = h.listen();

    h.mq.publish_json(&Context::new(), "archived", &Order { id: 3 })
        .await
        .unwrap();

    assert!(nothing(&mut rx).await);
    assert!(h.sink.reports().is_empty());
    assert_eq!(h.broker.pending("orders-queue"), 0);
    h.cancel.cancel();
}

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone, PartialEq)]
struct RequestId(String);

/// Carries a `RequestId` context value in a single header.
#[derive(Debug)]
struct RequestIdPropagator {
    fields: Vec<String>,
}

impl TextMapPropagator for RequestIdPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        if let Some(RequestId(id)) = cx.get::<RequestId>() {
            injector.set(REQUEST_ID_HEADER, id.clone());
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        match extractor.get(REQUEST_ID_HEADER) {
            Some(id) => cx.with_value(RequestId(id.to_owned())),
            None => cx.clone(),
        }
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(&self.fields)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trace_context_travels_to_handler() {
    opentelemetry::global::set_text_map_propagator(RequestIdPropagator {
        fields: vec![REQUEST_ID_HEADER.to_owned()],
    });

    let h = Harness::new("orders").await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    h.mq.subscribe(
        "created",
        "orders-exchange",
        handler_fn(move |ctx: Context, delivery: Delivery| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((ctx.get::<RequestId>().cloned(), delivery));
                Ok::<(), HandlerError>(())
            }
        }),
    )
    .await
    .unwrap();
    let _listening = h.listen();

    let ctx = Context::new().with_value(RequestId("req-42".to_owned()));
    h.mq.publish_json(&ctx, "created", &Order { id: 1 })
        .await
        .unwrap();

    let (request_id, delivery) = next(&mut rx).await;
    assert_eq!(request_id, Some(RequestId("req-42".to_owned())));
    assert_eq!(
        delivery.headers.get(REQUEST_ID_HEADER).map(String::as_str),
        Some("req-42")
    );
    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn later_subscription_replaces_handler() {
    let h = Harness::new("orders").await;
    let (first, mut first_rx) = forwarding("first");
    let (second, mut second_rx) = forwarding("second");

    h.mq.subscribe("created", "orders-exchange", first)
        .await
        .unwrap();
    h.mq.subscribe("created", "orders-exchange", second)
        .await
        .unwrap();

    // the replaced handler is released along with its sender
    assert!(tokio::time::timeout(WAIT, first_rx.recv())
        .await
        .unwrap()
        .is_none());

    let _listening = h.listen();
    h.mq.publish(&Context::new(), "created", b"{}").await.unwrap();

    let (label, _) = next(&mut second_rx).await;
    assert_eq!(label, "second");
    assert!(nothing(&mut second_rx).await);
    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrouted_key_is_reported_and_dropped() {
    let h = Harness::new("orders").await;
    let (handler, mut rx) = forwarding("created");
    h.mq.subscribe("created", "orders-exchange", handler)
        .await
        .unwrap();

    // bound on the broker, but no handler registered for it
    AmqpTopology::new(h.transport.clone())
        .bind_queue(
            &QueueBinding::new("orders-queue")
                .exchange("orders-exchange")
                .routing_key("orphan"),
        )
        .await
        .unwrap();
    let _listening = h.listen();

    h.mq.publish(&Context::new(), "orphan", b"{}").await.unwrap();
    h.mq.publish(&Context::new(), "created", b"{}").await.unwrap();

    let (label, _) = next(&mut rx).await;
    assert_eq!(label, "created");
    assert!(nothing(&mut rx).await);

    let reports = wait_for_reports(&h.sink, 1).await;
    assert_eq!(
        reports,
        vec![Diagnostic::UnroutedKey {
            routing_key: "orphan".to_owned(),
            exchange: "orders-exchange".to_owned(),
        }]
    );
    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stuck_handler_does_not_block_other_deliveries() {
    let h = Harness::new("orders").await;
    h.mq.subscribe(
        "stuck",
        "orders-exchange",
        handler_fn(|_, _| async {
            std::future::pending::<()>().await;
            Ok::<(), HandlerError>(())
        }),
    )
    .await
    .unwrap();
    let (handler, mut rx) = forwarding("created");
    h.mq.subscribe("created", "orders-exchange", handler)
        .await
        .unwrap();
    let _listening = h.listen();

    h.mq.publish(&Context::new(), "stuck", b"{}").await.unwrap();
    h.mq.publish(&Context::new(), "created", b"{}").await.unwrap();
    h.mq.publish(&Context::new(), "stuck", b"{}").await.unwrap();
    h.mq.publish(&Context::new(), "created", b"{}").await.unwrap();

    next(&mut rx).await;
    next(&mut rx).await;
    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_handler_is_isolated() {
    let h = Harness::new("orders").await;
    h.mq.subscribe(
        "broken",
        "orders-exchange",
        handler_fn(|_, _| async { Err::<(), HandlerError>("cannot process".into()) }),
    )
    .await
    .unwrap();
    let (handler, mut rx) = forwarding("created");
    h.mq.subscribe("created", "orders-exchange", handler)
        .await
        .unwrap();
    let listening = h.listen();

    h.mq.publish(&Context::new(), "broken", b"{}").await.unwrap();
    let reports = wait_for_reports(&h.sink, 1).await;
    assert_eq!(
        reports,
        vec![Diagnostic::DispatchFailure {
            routing_key: "broken".to_owned(),
            error: "cannot process".to_owned(),
        }]
    );

    h.mq.publish(&Context::new(), "created", b"{}").await.unwrap();
    next(&mut rx).await;

    assert!(!listening.is_finished());
    assert_eq!(h.sink.reports().len(), 1);
    h.cancel.cancel();
    assert_eq!(listening.await.unwrap(), Ok(()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_while_listening() {
    let h = Harness::new("orders").await;
    let _listening = h.listen();

    let (handler, mut rx) = forwarding("late");
    h.mq.subscribe("late", "orders-exchange", handler)
        .await
        .unwrap();
    h.mq.publish(&Context::new(), "late", b"{}").await.unwrap();

    let (label, _) = next(&mut rx).await;
    assert_eq!(label, "late");
    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_keeps_connection_open() {
    let h = Harness::new("orders").await;
    let (handler, mut rx) = forwarding("created");
    h.mq.subscribe("created", "orders-exchange", handler)
        .await
        .unwrap();

    let listening = h.listen();
    h.cancel.cancel();
    assert_eq!(
        tokio::time::timeout(WAIT, listening).await.unwrap().unwrap(),
        Ok(())
    );

    // still connected: messages queue up until someone listens again
    h.mq.publish(&Context::new(), "created", b"{}").await.unwrap();
    assert!(h.broker.has_queue("orders-queue"));
    assert_eq!(h.broker.pending("orders-queue"), 1);

    let cancel = CancellationToken::new();
    let mq = h.mq.clone();
    let relisten = tokio::spawn({
        let cancel = cancel.clone();
        async move { mq.listen(cancel).await }
    });
    next(&mut rx).await;
    cancel.cancel();
    assert_eq!(relisten.await.unwrap(), Ok(()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_listen_is_rejected() {
    let h = Harness::new("orders").await;
    let _listening = h.listen();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        h.mq.listen(CancellationToken::new()).await,
        Err(AmqpError::AlreadyListening)
    );
    h.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_connection_ends_listen_with_error() {
    let h = Harness::new("orders").await;
    let listening = h.listen();
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.mq.close().await.unwrap();

    let result = tokio::time::timeout(WAIT, listening).await.unwrap().unwrap();
    assert_eq!(result, Err(AmqpError::StreamClosed));
    assert!(!h.broker.has_queue("orders-queue"));

    let err = h.mq.publish(&Context::new(), "created", b"{}").await.unwrap_err();
    assert_eq!(
        err,
        AmqpError::PublishingError("orders-exchange".to_owned(), TransportError::Closed)
    );
}

#[tokio::test]
async fn home_queue_is_exclusive_to_one_instance() {
    let broker = MemoryBroker::new();
    let _first = Harness::on(broker.clone(), "orders").await;

    let result = MessageQueue::with_transport("orders", Arc::new(broker.connect())).await;
    assert!(matches!(
        result,
        Err(AmqpError::DeclareQueueError(_, TransportError::ResourceLocked(_)))
    ));
}

#[tokio::test]
async fn conflicting_home_exchange_fails_setup() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    AmqpTopology::new(Arc::new(conn))
        .declare_exchange(&ExchangeDefinition::new("orders-exchange").fanout())
        .await
        .unwrap();

    let err = MessageQueue::with_transport("orders", Arc::new(broker.connect()))
        .await
        .err()
        .unwrap();
    assert!(err.is_topology_error());
}

#[tokio::test]
async fn declarations_are_idempotent() {
    let broker = MemoryBroker::new();
    let topology = AmqpTopology::new(Arc::new(broker.connect()));
    let exchange = ExchangeDefinition::new("orders-exchange").direct().durable();
    let queue = QueueDefinition::new("orders-queue").exclusive();

    for _ in 0..2 {
        topology.declare_exchange(&exchange).await.unwrap();
        assert_eq!(
            topology.declare_queue(&queue).await,
            Ok("orders-queue".to_owned())
        );
    }

    let transient = ExchangeDefinition::new("orders-exchange").direct();
    let durable_queue = QueueDefinition::new("orders-queue").exclusive().durable();
    for _ in 0..2 {
        assert!(topology
            .declare_exchange(&transient)
            .await
            .unwrap_err()
            .is_topology_error());
        assert!(topology
            .declare_queue(&durable_queue)
            .await
            .unwrap_err()
            .is_topology_error());
    }
}
