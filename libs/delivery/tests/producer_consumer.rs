//! Producer controller and consumer controller working together.

use delivery_actors::testkit::TestProbe;
use delivery_actors::{ActorRef, ActorStatus, ActorSystem, Recipient, SupervisionStrategy};
use reliable_delivery::{
    BincodeCodec, ConsumerCommand, ConsumerController, ConsumerControllerSettings, Delivery,
    DurableProducerQueue, DurableQueueSettings, InMemoryDurableQueue, ProducerCommand,
    ProducerController, ProducerControllerSettings, RequestNext, SeqNo, SequencedMessage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn producer_settings() -> ProducerControllerSettings {
    ProducerControllerSettings {
        send_buffer_capacity: 100,
        chunk_large_messages_bytes: 0,
        resend_first_unconfirmed_idle_timeout: Duration::from_millis(500),
        durable_queue: DurableQueueSettings {
            request_timeout: Duration::from_secs(1),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(10),
            max_retry_backoff: Duration::from_millis(50),
            resend_first_interval: Duration::from_millis(100),
        },
    }
}

fn consumer_settings(window: u32) -> ConsumerControllerSettings {
    ConsumerControllerSettings {
        flow_control_window: window,
        resend_interval_min: Duration::from_millis(200),
        resend_interval_max: Duration::from_millis(800),
        only_flow_control: false,
    }
}

struct Pair {
    pc: ActorRef<ProducerCommand<String>>,
    cc: ActorRef<ConsumerCommand<String>>,
    producer: TestProbe<RequestNext<String>>,
    consumer: TestProbe<Delivery<String>>,
}

/// Start both controllers; the consumer controller registers itself with the producer controller.
fn connect(system: &ActorSystem, pc: ProducerController<String>, cc: ConsumerController<String>) -> Pair {
    let producer = TestProbe::new();
    let consumer = TestProbe::new();
    let pc = pc.spawn(system);
    let cc = cc.spawn(system, "consumer-controller");
    cc.tell(ConsumerCommand::Start {
        delivery_to: consumer.recipient(),
    });
    pc.tell(ProducerCommand::Start {
        producer: producer.recipient(),
    });
    cc.tell(ConsumerCommand::RegisterToProducerController {
        producer_controller: pc.recipient(),
    });
    Pair { pc, cc, producer, consumer }
}

/// Start both controllers with `link` between them instead of registration.
fn connect_through(
    system: &ActorSystem,
    pc: ProducerController<String>,
    cc: ConsumerController<String>,
    link: impl Fn(SequencedMessage<String>, &Recipient<SequencedMessage<String>>) -> bool + Send + Sync + 'static,
) -> Pair {
    let producer = TestProbe::new();
    let consumer = TestProbe::new();
    let cc = cc.spawn(system, "consumer-controller");
    cc.tell(ConsumerCommand::Start {
        delivery_to: consumer.recipient(),
    });
    let to_consumer = cc.adapt(ConsumerCommand::Sequenced);
    let pc = pc
        .with_send_to(Recipient::from_fn(move |msg| link(msg, &to_consumer)))
        .spawn(system);
    pc.tell(ProducerCommand::Start {
        producer: producer.recipient(),
    });
    Pair { pc, cc, producer, consumer }
}

/// Drop the transmissions whose index (counting from 0) is in `drop`.
fn lossy(drop: &'static [usize]) -> impl Fn(SequencedMessage<String>, &Recipient<SequencedMessage<String>>) -> bool {
    let sent = AtomicUsize::new(0);
    move |msg: SequencedMessage<String>, next: &Recipient<SequencedMessage<String>>| {
        let index = sent.fetch_add(1, Ordering::SeqCst);
        if drop.contains(&index) {
            true
        } else {
            next.tell(msg)
        }
    }
}

async fn produce(producer: &mut TestProbe<RequestNext<String>>, jobs: impl IntoIterator<Item = String>) {
    for job in jobs {
        let next = producer.expect_message().await;
        assert!(next.send(job));
    }
}

async fn consume(consumer: &mut TestProbe<Delivery<String>>, expected: &[(&str, i64)]) {
    for (message, seq_nr) in expected {
        let delivery = consumer.expect_message().await;
        assert_eq!(delivery.message, *message);
        assert_eq!(delivery.seq_nr, SeqNo::new(*seq_nr));
        delivery.confirm();
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_delivers_in_order_exactly_once() {
    let system = ActorSystem::new("test");
    let Pair {
        mut producer,
        mut consumer,
        ..
    } = connect(
        &system,
        ProducerController::new("orders", producer_settings()),
        ConsumerController::new(consumer_settings(4)),
    );

    let jobs = 30;
    let producing = tokio::spawn(async move {
        produce(&mut producer, (1..=jobs).map(|i| format!("job-{}", i))).await;
        producer
    });

    for i in 1..=jobs {
        let delivery = consumer.expect_message().await;
        assert_eq!(delivery.message, format!("job-{}", i));
        assert_eq!(delivery.seq_nr, SeqNo::new(i));
        assert_eq!(delivery.producer_id, "orders");
        delivery.confirm();
    }
    consumer.expect_no_message(Duration::from_millis(300)).await;

    let mut producer = producing.await.unwrap();
    let next = producer.expect_message().await;
    assert_eq!(next.current_seq_nr, SeqNo::new(jobs + 1));
}

#[tokio::test]
async fn test_unconfirmed_messages_survive_restart() {
    let system = ActorSystem::new("test");
    let queue = Arc::new(InMemoryDurableQueue::<String>::new());

    let mut first = connect(
        &system,
        ProducerController::new("orders", producer_settings()).with_durable_queue(queue.clone()),
        ConsumerController::new(consumer_settings(2)),
    );
    produce(&mut first.producer, ["job-1", "job-2"].map(String::from)).await;
    consume(&mut first.consumer, &[("job-1", 1), ("job-2", 2)]).await;
    produce(&mut first.producer, ["job-3", "job-4"].map(String::from)).await;
    wait_until(|| {
        queue.state().highest_confirmed_seq_nr == SeqNo::new(2) && queue.unconfirmed().len() == 2
    })
    .await;

    first.pc.stop();
    first.cc.stop();
    first.pc.terminated().await;
    first.cc.terminated().await;

    // the new incarnation numbers the replayed messages from 1
    let mut second = connect(
        &system,
        ProducerController::new("orders", producer_settings()).with_durable_queue(queue.clone()),
        ConsumerController::new(consumer_settings(2)),
    );
    consume(&mut second.consumer, &[("job-3", 1), ("job-4", 2)]).await;
    let next = second.producer.expect_message().await;
    assert_eq!(next.current_seq_nr, SeqNo::new(3));
}

#[tokio::test]
async fn test_retries_transient_durable_queue_failures() {
    let system = ActorSystem::new("test");
    let queue = Arc::new(InMemoryDurableQueue::<String>::new());
    queue.fail_next_requests(2);

    let mut pair = connect(
        &system,
        ProducerController::new("orders", producer_settings()).with_durable_queue(queue.clone()),
        ConsumerController::new(consumer_settings(4)),
    );
    produce(&mut pair.producer, ["job-1".to_string()]).await;
    queue.fail_next_requests(1);
    produce(&mut pair.producer, ["job-2".to_string()]).await;

    consume(&mut pair.consumer, &[("job-1", 1), ("job-2", 2)]).await;
    wait_until(|| queue.unconfirmed().is_empty()).await;
}

#[tokio::test]
async fn test_durable_queue_failure_stops_producer_controller() {
    let system = ActorSystem::with_supervision(
        "test",
        SupervisionStrategy {
            max_restarts: 1,
            restart_window: Duration::from_secs(60),
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(10),
        },
    );
    let queue = Arc::new(InMemoryDurableQueue::<String>::new());
    queue.fail_next_requests(u32::MAX);

    let pc = ProducerController::new("orders", producer_settings())
        .with_durable_queue(queue.clone() as Arc<dyn DurableProducerQueue<String>>)
        .spawn(&system);
    let status = tokio::time::timeout(Duration::from_secs(3), pc.terminated())
        .await
        .unwrap();
    assert!(matches!(status, ActorStatus::Failed { .. }));
}

#[tokio::test]
async fn test_lost_first_message_is_resent() {
    let system = ActorSystem::new("test");
    let mut pair = connect_through(
        &system,
        ProducerController::new("orders", producer_settings()),
        ConsumerController::new(consumer_settings(4)),
        lossy(&[0]),
    );

    produce(&mut pair.producer, ["job-1".to_string()]).await;
    consume(&mut pair.consumer, &[("job-1", 1)]).await;
    produce(&mut pair.producer, ["job-2".to_string()]).await;
    consume(&mut pair.consumer, &[("job-2", 2)]).await;
}

#[tokio::test]
async fn test_lost_trailing_message_is_recovered() {
    let system = ActorSystem::new("test");
    let mut pair = connect_through(
        &system,
        ProducerController::new("orders", producer_settings()),
        ConsumerController::new(consumer_settings(4)),
        lossy(&[1]),
    );

    produce(&mut pair.producer, ["job-1", "job-2"].map(String::from)).await;
    consume(&mut pair.consumer, &[("job-1", 1), ("job-2", 2)]).await;
    pair.consumer.expect_no_message(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_lost_message_in_the_middle_is_nacked() {
    let system = ActorSystem::new("test");
    let mut pair = connect_through(
        &system,
        ProducerController::new("orders", producer_settings()),
        ConsumerController::new(consumer_settings(8)),
        lossy(&[2]),
    );

    produce(&mut pair.producer, (1..=5).map(|i| format!("job-{}", i))).await;
    consume(
        &mut pair.consumer,
        &[("job-1", 1), ("job-2", 2), ("job-3", 3), ("job-4", 4), ("job-5", 5)],
    )
    .await;
}

#[tokio::test]
async fn test_large_messages_are_chunked() {
    let system = ActorSystem::new("test");
    let codec = Arc::new(BincodeCodec::<String>::new());
    let mut settings = producer_settings();
    settings.chunk_large_messages_bytes = 16;

    let mut pair = connect(
        &system,
        ProducerController::new("orders", settings).with_codec(codec.clone()),
        ConsumerController::new(consumer_settings(4)).with_codec(codec),
    );

    let large = "x".repeat(200);
    produce(&mut pair.producer, [large.clone(), "small".to_string()]).await;

    let delivery = pair.consumer.expect_message().await;
    assert_eq!(delivery.message, large);
    assert!(delivery.seq_nr > SeqNo::new(10));
    let chunked_until = delivery.seq_nr;
    delivery.confirm();

    let delivery = pair.consumer.expect_message().await;
    assert_eq!(delivery.message, "small");
    assert_eq!(delivery.seq_nr, chunked_until.inc());
}

#[tokio::test]
async fn test_chunked_message_larger_than_send_buffer() {
    let system = ActorSystem::new("test");
    let codec = Arc::new(BincodeCodec::<String>::new());
    let mut settings = producer_settings();
    settings.send_buffer_capacity = 4;
    settings.chunk_large_messages_bytes = 16;

    let mut pair = connect(
        &system,
        ProducerController::new("orders", settings).with_codec(codec.clone()),
        ConsumerController::new(consumer_settings(4)).with_codec(codec),
    );

    let large = "x".repeat(200);
    produce(&mut pair.producer, [large.clone()]).await;

    let delivery = tokio::time::timeout(Duration::from_secs(3), pair.consumer.expect_message())
        .await
        .unwrap();
    assert_eq!(delivery.message, large);
    assert!(delivery.seq_nr.value() > 4);
    let chunked_until = delivery.seq_nr;
    delivery.confirm();

    // Demand comes back once the chunks are acknowledged
    produce(&mut pair.producer, ["small".to_string()]).await;
    let delivery = pair.consumer.expect_message().await;
    assert_eq!(delivery.message, "small");
    assert_eq!(delivery.seq_nr, chunked_until.inc());
    delivery.confirm();

    assert!(
        tokio::time::timeout(Duration::from_millis(200), pair.pc.terminated())
            .await
            .is_err(),
        "producer controller stopped"
    );
}

#[tokio::test]
async fn test_ask_replies_after_confirmation() {
    let system = ActorSystem::new("test");
    let mut pair = connect(
        &system,
        ProducerController::new("orders", producer_settings()),
        ConsumerController::new(consumer_settings(4)),
    );

    let next = pair.producer.expect_message().await;
    let mut reply = next.ask("job-1".to_string());

    let delivery = pair.consumer.expect_message().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(reply.try_recv().is_err());

    delivery.confirm();
    let confirmed = tokio::time::timeout(Duration::from_secs(3), reply)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirmed, SeqNo::new(1));
}
