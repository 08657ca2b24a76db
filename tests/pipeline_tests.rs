//! End-to-end pipeline tests against a scripted in-memory broker.

use async_trait::async_trait;
use parking_lot::Mutex;
use pushmq_client::message::{
    HEADER_REAL_OFFSET, HEADER_REAL_TOPIC, HEADER_RESEND_TOPIC, HEADER_RETRY_COUNT,
};
use pushmq_client::{
    topics, BrokerConsumer, BrokerProducer, ClientError, ConcurrentContext, ConcurrentHandler,
    ConsumeStatus, ConsumerConfig, Message, OffsetAndMetadata, PushConsumer, RebalanceHandler,
    RecordMetadata, Result, TopicPartition,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};

#[derive(Default)]
struct BrokerState {
    queue: VecDeque<Vec<Message>>,
    paused: HashSet<TopicPartition>,
    assignment: HashSet<TopicPartition>,
    commits: Vec<(TopicPartition, u64)>,
    subscribed: Vec<String>,
    rebalance: Option<Arc<dyn RebalanceHandler>>,
}

/// Test-side view of the mock broker
#[derive(Clone, Default)]
struct BrokerHandle {
    state: Arc<Mutex<BrokerState>>,
}

impl BrokerHandle {
    fn consumer(&self) -> Box<dyn BrokerConsumer> {
        Box::new(MockBroker {
            state: self.state.clone(),
        })
    }

    fn enqueue(&self, records: Vec<Message>) {
        let mut state = self.state.lock();
        for record in &records {
            state
                .assignment
                .insert(TopicPartition::new(record.topic.clone(), record.partition));
        }
        state.queue.push_back(records);
    }

    fn commits_for(&self, partition: &TopicPartition) -> Vec<u64> {
        self.state
            .lock()
            .commits
            .iter()
            .filter(|(tp, _)| tp == partition)
            .map(|(_, offset)| *offset)
            .collect()
    }

    fn is_paused(&self, partition: &TopicPartition) -> bool {
        self.state.lock().paused.contains(partition)
    }

    fn subscribed(&self) -> Vec<String> {
        self.state.lock().subscribed.clone()
    }

    /// Simulate the group taking partitions away, the way a broker client
    /// would from inside poll: commits returned by the rebalance handler
    /// are applied before the revoke completes.
    async fn revoke(&self, partitions: &[TopicPartition]) {
        let handler = self
            .state
            .lock()
            .rebalance
            .clone()
            .expect("no subscription");
        let commits = handler.on_partitions_revoked(partitions).await;
        let mut state = self.state.lock();
        for (tp, om) in commits {
            state.commits.push((tp, om.offset));
        }
        for tp in partitions {
            state.assignment.remove(tp);
            state.paused.remove(tp);
        }
    }
}

struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerConsumer for MockBroker {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<Message>> {
        let delivery = {
            let mut state = self.state.lock();
            match state.queue.pop_front() {
                Some(records) => {
                    let paused = state.paused.clone();
                    let (deliver, held): (Vec<Message>, Vec<Message>) =
                        records.into_iter().partition(|m| {
                            !paused.contains(&TopicPartition::new(m.topic.clone(), m.partition))
                        });
                    if !held.is_empty() {
                        state.queue.push_front(held);
                    }
                    deliver
                }
                None => Vec::new(),
            }
        };
        if delivery.is_empty() {
            sleep(timeout).await;
        }
        Ok(delivery)
    }

    async fn pause(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        let mut state = self.state.lock();
        for tp in partitions {
            state.paused.insert(tp.clone());
        }
        Ok(())
    }

    async fn resume(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        let mut state = self.state.lock();
        for tp in partitions {
            state.paused.remove(tp);
        }
        Ok(())
    }

    fn paused(&self) -> HashSet<TopicPartition> {
        self.state.lock().paused.clone()
    }

    fn assignment(&self) -> HashSet<TopicPartition> {
        self.state.lock().assignment.clone()
    }

    async fn subscribe(
        &mut self,
        topics: &[String],
        handler: Arc<dyn RebalanceHandler>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.subscribed = topics.to_vec();
        state.rebalance = Some(handler);
        Ok(())
    }

    async fn subscribe_pattern(
        &mut self,
        pattern: &str,
        handler: Arc<dyn RebalanceHandler>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.subscribed = vec![pattern.to_string()];
        state.rebalance = Some(handler);
        Ok(())
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.subscribed.clear();
        state.assignment.clear();
        Ok(())
    }

    async fn seek(&mut self, _partition: &TopicPartition, _offset: u64) -> Result<()> {
        Ok(())
    }

    async fn seek_to_beginning(&mut self, _partitions: &[TopicPartition]) -> Result<()> {
        Ok(())
    }

    async fn seek_to_end(&mut self, _partitions: &[TopicPartition]) -> Result<()> {
        Ok(())
    }

    async fn offsets_for_times(
        &mut self,
        _timestamps: HashMap<TopicPartition, u64>,
    ) -> Result<HashMap<TopicPartition, u64>> {
        Ok(HashMap::new())
    }

    async fn commit_sync(
        &mut self,
        offsets: &HashMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        for (tp, om) in offsets {
            state.commits.push((tp.clone(), om.offset));
        }
        Ok(())
    }
}

struct MockProducer {
    sent: Mutex<Vec<Message>>,
    fail: AtomicBool,
}

impl MockProducer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl BrokerProducer for MockProducer {
    async fn send(&self, message: Message) -> Result<RecordMetadata> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(ClientError::Producer("injected failure".to_string()));
        }
        let meta = RecordMetadata {
            topic: message.topic.clone(),
            partition: 0,
            offset: self.sent.lock().len() as u64,
            timestamp: 0,
        };
        self.sent.lock().push(message);
        Ok(meta)
    }
}

fn records(topic: &str, partition: u32, offsets: std::ops::Range<u64>) -> Vec<Message> {
    offsets
        .map(|offset| {
            Message::builder()
                .topic(topic)
                .partition(partition)
                .offset(offset)
                .payload(format!("payload-{}", offset))
                .build()
                .unwrap()
        })
        .collect()
}

fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        group_id: "g".to_string(),
        poll_await_timeout: Duration::from_millis(10),
        commit_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

fn assert_strictly_increasing(commits: &[u64]) {
    for pair in commits.windows(2) {
        assert!(
            pair[1] > pair[0],
            "commit sequence rolled back: {:?}",
            commits
        );
    }
}

struct SuccessHandler {
    work: Duration,
}

#[async_trait]
impl ConcurrentHandler for SuccessHandler {
    async fn consume_message(
        &self,
        _messages: Vec<Message>,
        _ctx: &ConcurrentContext,
    ) -> Result<ConsumeStatus> {
        if !self.work.is_zero() {
            sleep(self.work).await;
        }
        Ok(ConsumeStatus::Success)
    }
}

/// Marks a prefix successful on the first call, succeeds afterwards
struct PartialThenSuccess {
    marked: usize,
    delay_override: u32,
    calls: AtomicU64,
}

#[async_trait]
impl ConcurrentHandler for PartialThenSuccess {
    async fn consume_message(
        &self,
        _messages: Vec<Message>,
        ctx: &ConcurrentContext,
    ) -> Result<ConsumeStatus> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            for idx in 0..self.marked {
                ctx.mark_success(idx);
            }
            ctx.set_delay_level(self.delay_override);
            Ok(ConsumeStatus::RetryLater)
        } else {
            Ok(ConsumeStatus::Success)
        }
    }
}

/// Succeeds once, then parks every batch until released
struct GatedHandler {
    calls: AtomicU64,
    gate: Notify,
}

#[async_trait]
impl ConcurrentHandler for GatedHandler {
    async fn consume_message(
        &self,
        _messages: Vec<Message>,
        _ctx: &ConcurrentContext,
    ) -> Result<ConsumeStatus> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            self.gate.notified().await;
        }
        Ok(ConsumeStatus::Success)
    }
}

#[tokio::test]
async fn happy_path_commits_past_the_batch() {
    init_logging();
    let broker = BrokerHandle::default();
    let producer = MockProducer::new();
    let tp = TopicPartition::new("orders", 0);
    broker.enqueue(records("orders", 0, 100..110));

    let consumer = PushConsumer::builder()
        .config(test_config())
        .broker(broker.consumer())
        .producer(producer.clone())
        .concurrent_handler(SuccessHandler {
            work: Duration::ZERO,
        })
        .build()
        .unwrap();

    consumer.subscribe(["orders"]).await.unwrap();
    consumer.start().await.unwrap();

    // The group retry topic rides along on the subscription.
    let subscribed = broker.subscribed();
    assert!(subscribed.contains(&"orders".to_string()));
    assert!(subscribed.contains(&topics::retry_topic("g")));

    wait_until("commit of offset 110", || {
        broker.commits_for(&tp).last() == Some(&110)
    })
    .await;

    consumer
        .shutdown_with_timeout(Duration::from_secs(1))
        .await
        .unwrap();

    assert!(producer.sent().is_empty());
    assert_strictly_increasing(&broker.commits_for(&tp));
    assert_eq!(
        consumer.metrics().messages_processed.load(Ordering::Relaxed),
        10
    );
}

#[tokio::test]
async fn partial_batch_republishes_the_tail() {
    init_logging();
    let broker = BrokerHandle::default();
    let producer = MockProducer::new();
    let tp = TopicPartition::new("orders", 0);
    broker.enqueue(records("orders", 0, 100..110));

    let consumer = PushConsumer::builder()
        .config(test_config())
        .broker(broker.consumer())
        .producer(producer.clone())
        .concurrent_handler(PartialThenSuccess {
            marked: 5,
            delay_override: 2,
            calls: AtomicU64::new(0),
        })
        .build()
        .unwrap();

    consumer.subscribe(["orders"]).await.unwrap();
    consumer.start().await.unwrap();

    wait_until("commit of offset 110", || {
        broker.commits_for(&tp).last() == Some(&110)
    })
    .await;
    consumer
        .shutdown_with_timeout(Duration::from_secs(1))
        .await
        .unwrap();

    let sent = producer.sent();
    assert_eq!(sent.len(), 5);
    let mut real_offsets: Vec<u64> = sent
        .iter()
        .map(|m| m.get_header(HEADER_REAL_OFFSET).unwrap().parse().unwrap())
        .collect();
    real_offsets.sort_unstable();
    assert_eq!(real_offsets, vec![105, 106, 107, 108, 109]);
    for msg in &sent {
        assert_eq!(msg.topic, topics::delay_topic(2).unwrap());
        assert_eq!(msg.get_header(HEADER_RETRY_COUNT).unwrap(), "1");
        assert_eq!(msg.get_header(HEADER_REAL_TOPIC).unwrap(), "orders");
        assert_eq!(
            msg.get_header(HEADER_RESEND_TOPIC).unwrap(),
            &topics::retry_topic("g")
        );
    }
    assert_strictly_increasing(&broker.commits_for(&tp));
}

#[tokio::test(start_paused = true)]
async fn publish_failure_defers_locally_and_recovers() {
    init_logging();
    let broker = BrokerHandle::default();
    let producer = MockProducer::new();
    producer.fail.store(true, Ordering::Relaxed);
    let tp = TopicPartition::new("orders", 0);
    broker.enqueue(records("orders", 0, 100..110));

    let consumer = PushConsumer::builder()
        .config(test_config())
        .broker(broker.consumer())
        .producer(producer.clone())
        .concurrent_handler(PartialThenSuccess {
            marked: 5,
            delay_override: 2,
            calls: AtomicU64::new(0),
        })
        .build()
        .unwrap();

    consumer.subscribe(["orders"]).await.unwrap();
    consumer.start().await.unwrap();

    // The marked prefix commits; the tail is stuck behind the failed
    // republish and holds the watermark at 105.
    wait_until("commit of offset 105", || {
        broker.commits_for(&tp).last() == Some(&105)
    })
    .await;
    assert!(producer.sent().is_empty());

    // Five seconds later the deferred task re-runs the handler, which now
    // succeeds, and the watermark moves to the end of the batch.
    wait_until("commit of offset 110", || {
        broker.commits_for(&tp).last() == Some(&110)
    })
    .await;

    consumer
        .shutdown_with_timeout(Duration::from_secs(1))
        .await
        .unwrap();
    assert_strictly_increasing(&broker.commits_for(&tp));
}

#[tokio::test]
async fn full_partition_is_paused_then_resumed() {
    init_logging();
    let broker = BrokerHandle::default();
    let producer = MockProducer::new();
    let tp = TopicPartition::new("orders", 0);
    broker.enqueue(records("orders", 0, 0..100));

    let consumer = PushConsumer::builder()
        .config(ConsumerConfig {
            partition_buffer_capacity: 50,
            ..test_config()
        })
        .broker(broker.consumer())
        .producer(producer.clone())
        .concurrent_handler(SuccessHandler {
            work: Duration::from_millis(20),
        })
        .build()
        .unwrap();

    consumer.subscribe(["orders"]).await.unwrap();
    consumer.start().await.unwrap();

    wait_until("partition paused at capacity", || broker.is_paused(&tp)).await;
    wait_until("partition resumed after draining", || {
        !broker.is_paused(&tp)
    })
    .await;

    // Fetching continues after the resume.
    broker.enqueue(records("orders", 0, 100..110));
    wait_until("commit of offset 110", || {
        broker.commits_for(&tp).last() == Some(&110)
    })
    .await;

    consumer
        .shutdown_with_timeout(Duration::from_secs(1))
        .await
        .unwrap();
    assert_strictly_increasing(&broker.commits_for(&tp));
}

#[tokio::test]
async fn revoked_partition_commits_then_drops_late_acks() {
    init_logging();
    let broker = BrokerHandle::default();
    let producer = MockProducer::new();
    let tp = TopicPartition::new("T", 0);
    broker.enqueue(records("T", 0, 105..121));

    let handler = Arc::new(GatedHandler {
        calls: AtomicU64::new(0),
        gate: Notify::new(),
    });
    let handler_ref = handler.clone();

    struct Forward(Arc<GatedHandler>);

    #[async_trait]
    impl ConcurrentHandler for Forward {
        async fn consume_message(
            &self,
            messages: Vec<Message>,
            ctx: &ConcurrentContext,
        ) -> Result<ConsumeStatus> {
            self.0.consume_message(messages, ctx).await
        }
    }

    let consumer = PushConsumer::builder()
        .config(ConsumerConfig {
            consume_batch_size: 6,
            // Keep the periodic flush out of the way; the revoke path has
            // to produce the commit on its own.
            commit_interval: Duration::from_secs(30),
            ..test_config()
        })
        .broker(broker.consumer())
        .producer(producer.clone())
        .concurrent_handler(Forward(handler_ref))
        .build()
        .unwrap();

    consumer.subscribe(["T"]).await.unwrap();
    consumer.start().await.unwrap();

    // First batch (105..=110) acked, second batch claimed and parked.
    wait_until("second batch in flight", || {
        handler.calls.load(Ordering::SeqCst) >= 2
    })
    .await;

    broker.revoke(&[tp.clone()]).await;
    assert_eq!(broker.commits_for(&tp), vec![111]);

    // Release the parked batch; its acks land on a reset buffer.
    handler.gate.notify_waiters();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.commits_for(&tp), vec![111]);

    consumer
        .shutdown_with_timeout(Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(broker.commits_for(&tp), vec![111]);
}
