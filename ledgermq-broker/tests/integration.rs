//! Integration tests: real TCP clients speaking the legacy wire protocol
//! against a broker served from the in-memory log store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use ledgermq_backend::{LogStore, MemoryLogStore, ReaderOptions, StartPosition};
use ledgermq_core::message::{
    decode_frame, encode_batch_item, properties_to_string, props, BatchItem,
};
use ledgermq_core::topic::LegacyTopic;
use ledgermq_core::types::PartitionId;

use ledgermq_broker::config::BrokerConfig;
use ledgermq_broker::context::BrokerContext;
use ledgermq_broker::remoting::code::{pull_flag, request, response};
use ledgermq_broker::remoting::header::{
    ConsumerSendMsgBackRequestHeader, PullMessageRequestHeader, PullMessageResponseHeader,
    SendMessageRequestHeader, SendMessageResponseHeader,
};
use ledgermq_broker::remoting::RemotingCommand;
use ledgermq_broker::route::TopicRouteData;
use ledgermq_broker::subscription::{
    ConsumerData, HeartbeatData, SubscriptionDataWire, SubscriptionGroupConfig,
};
use ledgermq_broker::BrokerServer;

struct TestBroker {
    store: Arc<MemoryLogStore>,
    ctx: Arc<BrokerContext>,
    addr: std::net::SocketAddr,
    server_task: tokio::task::JoinHandle<()>,
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

async fn start_broker() -> TestBroker {
    start_broker_with(|_| {}).await
}

async fn start_broker_with(store_setup: impl FnOnce(&MemoryLogStore)) -> TestBroker {
    let store = Arc::new(MemoryLogStore::new());
    store_setup(&store);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = BrokerConfig::fast_for_testing().with_listener(addr, "internal");

    let server =
        BrokerServer::new(config, Arc::clone(&store) as Arc<dyn LogStore>).unwrap();
    let ctx = server.context();
    let server_task = tokio::spawn(async move {
        let _ = server.run_with_listener(listener).await;
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    TestBroker {
        store,
        ctx,
        addr,
        server_task,
    }
}

struct Client {
    stream: TcpStream,
    next_opaque: i32,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = timeout(Duration::from_secs(5), TcpStream::connect(addr))
            .await
            .expect("connect timeout")
            .expect("connect failed");
        Self {
            stream,
            next_opaque: 1,
        }
    }

    async fn send(&mut self, mut command: RemotingCommand) -> i32 {
        let opaque = self.next_opaque;
        self.next_opaque += 1;
        command.opaque = opaque;
        let frame = command.encode().unwrap();
        self.stream.write_all(&frame).await.unwrap();
        opaque
    }

    async fn read_response(&mut self) -> RemotingCommand {
        let mut length = [0u8; 4];
        self.stream.read_exact(&mut length).await.unwrap();
        let length = u32::from_be_bytes(length) as usize;
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await.unwrap();
        RemotingCommand::decode(Bytes::from(payload)).unwrap()
    }

    async fn request(&mut self, command: RemotingCommand) -> RemotingCommand {
        let opaque = self.send(command).await;
        let response = timeout(Duration::from_secs(5), self.read_response())
            .await
            .expect("response timeout");
        assert_eq!(response.opaque, opaque, "correlation id must match");
        response
    }

    async fn heartbeat(&mut self, group: &str, topic: &str, sub_version: i64) {
        let data = HeartbeatData {
            client_id: "it-client@1".to_string(),
            consumer_data_set: vec![ConsumerData {
                group_name: group.to_string(),
                consume_type: "CONSUME_PASSIVELY".to_string(),
                message_model: "CLUSTERING".to_string(),
                consume_from_where: "CONSUME_FROM_LAST_OFFSET".to_string(),
                subscription_data_set: vec![SubscriptionDataWire {
                    topic: topic.to_string(),
                    sub_string: "*".to_string(),
                    tags_set: Vec::new(),
                    sub_version,
                    expression_type: None,
                }],
                unit_mode: false,
            }],
            producer_data_set: Vec::new(),
        };
        let mut command = RemotingCommand::new_request(request::HEART_BEAT);
        command.body = Bytes::from(serde_json::to_vec(&data).unwrap());
        let response = self.request(command).await;
        assert_eq!(response.code, response::SUCCESS, "heartbeat must succeed");
    }

    async fn produce(
        &mut self,
        topic: &str,
        queue_id: i32,
        body: &[u8],
        properties: &[(&str, &str)],
    ) -> RemotingCommand {
        let properties: HashMap<String, String> = properties
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let header = SendMessageRequestHeader {
            producer_group: "it-producers".to_string(),
            topic: topic.to_string(),
            default_topic: "TBW102".to_string(),
            default_topic_queue_nums: 4,
            queue_id,
            sys_flag: 0,
            born_timestamp: now_millis(),
            flag: 0,
            properties: Some(properties_to_string(&properties)),
            reconsume_times: None,
            unit_mode: false,
            batch: false,
            max_reconsume_times: None,
        };
        let mut command = RemotingCommand::with_header(request::SEND_MESSAGE, &header);
        command.body = Bytes::copy_from_slice(body);
        self.request(command).await
    }

    fn pull_command(
        group: &str,
        topic: &str,
        queue_id: i32,
        queue_offset: i64,
        sys_flag: i32,
        suspend_timeout_millis: i64,
        sub_version: i64,
    ) -> RemotingCommand {
        let header = PullMessageRequestHeader {
            consumer_group: group.to_string(),
            topic: topic.to_string(),
            queue_id,
            queue_offset,
            max_msg_nums: 10,
            sys_flag,
            commit_offset: 0,
            suspend_timeout_millis,
            subscription: None,
            sub_version,
            expression_type: None,
        };
        RemotingCommand::with_header(request::PULL_MESSAGE, &header)
    }

    async fn pull(
        &mut self,
        group: &str,
        topic: &str,
        queue_id: i32,
        queue_offset: i64,
    ) -> RemotingCommand {
        self.request(Self::pull_command(group, topic, queue_id, queue_offset, 0, 0, 0))
            .await
    }
}

fn now_millis() -> i64 {
    i64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis(),
    )
    .unwrap()
}

/// Splits a pull response body into its message frames.
fn split_frames(body: &[u8]) -> Vec<Bytes> {
    let mut frames = Vec::new();
    let mut at = 0;
    while at + 4 <= body.len() {
        let total =
            i32::from_be_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]) as usize;
        assert!(at + total <= body.len(), "frame overruns body");
        frames.push(Bytes::copy_from_slice(&body[at..at + total]));
        at += total;
    }
    assert_eq!(at, body.len(), "trailing bytes after frames");
    frames
}

fn ensure_partition(store: &MemoryLogStore, topic: &str, queue_id: u32) {
    let topic = LegacyTopic::parse(topic).unwrap();
    store.ensure_topic(&topic.partition_name(PartitionId::new(queue_id)));
}

#[tokio::test]
async fn test_happy_pull() {
    let broker = start_broker().await;
    let mut client = Client::connect(broker.addr).await;

    client.heartbeat("it-group", "orders", 1).await;

    let mut offsets = Vec::new();
    for body in [b"m1".as_slice(), b"m2", b"m3"] {
        let response = client.produce("orders", 0, body, &[]).await;
        assert_eq!(response.code, response::SUCCESS);
        let header: SendMessageResponseHeader = response.decode_header().unwrap();
        assert_eq!(header.queue_id, 0);
        assert!(!header.msg_id.is_empty());
        offsets.push(header.queue_offset);
    }
    assert!(offsets[0] < offsets[1] && offsets[1] < offsets[2]);

    let response = client.pull("it-group", "orders", 0, 0).await;
    assert_eq!(response.code, response::SUCCESS);

    let header: PullMessageResponseHeader = response.decode_header().unwrap();
    assert_eq!(header.next_begin_offset, offsets[2]);
    assert_eq!(header.min_offset, offsets[0]);
    assert_eq!(header.max_offset, offsets[2]);

    let frames = split_frames(&response.body);
    assert_eq!(frames.len(), 3);
    for (frame, expected) in frames.iter().zip([b"m1".as_slice(), b"m2", b"m3"]) {
        let decoded = decode_frame(frame).unwrap();
        assert_eq!(decoded.body.as_ref(), expected);
        assert_eq!(decoded.topic, "orders");
        assert!(decoded.queue_offset > 0, "offset patched into frame");
    }

    // Stats moved on both paths.
    assert_eq!(broker.ctx.stats.topic_put_nums("orders"), 3);
    assert_eq!(broker.ctx.stats.group_get_nums("it-group", "orders"), 3);
}

#[tokio::test]
async fn test_empty_long_poll_times_out_with_not_found() {
    let broker = start_broker().await;
    ensure_partition(&broker.store, "quiet", 0);
    let mut client = Client::connect(broker.addr).await;
    client.heartbeat("it-group", "quiet", 1).await;

    let started = Instant::now();
    let opaque = client
        .send(Client::pull_command(
            "it-group",
            "quiet",
            0,
            0,
            pull_flag::SUSPEND,
            500,
            0,
        ))
        .await;

    let response = timeout(Duration::from_secs(5), client.read_response())
        .await
        .expect("suspended pull must eventually answer");
    let elapsed = started.elapsed();

    assert_eq!(response.opaque, opaque);
    assert_eq!(response.code, response::PULL_NOT_FOUND);
    assert!(
        elapsed >= Duration::from_millis(450),
        "answered after only {elapsed:?}"
    );
}

#[tokio::test]
async fn test_long_poll_wakes_on_send() {
    let broker = start_broker().await;
    ensure_partition(&broker.store, "wakeup", 0);
    let mut consumer = Client::connect(broker.addr).await;
    consumer.heartbeat("it-group", "wakeup", 1).await;

    let opaque = consumer
        .send(Client::pull_command(
            "it-group",
            "wakeup",
            0,
            0,
            pull_flag::SUSPEND,
            1500,
            0,
        ))
        .await;

    // Nothing for 200 ms, then a producer shows up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut producer = Client::connect(broker.addr).await;
    let sent = producer.produce("wakeup", 0, b"here", &[]).await;
    assert_eq!(sent.code, response::SUCCESS);

    let started = Instant::now();
    let response = timeout(Duration::from_millis(1000), consumer.read_response())
        .await
        .expect("wakeup must beat the suspend timeout");
    assert_eq!(response.opaque, opaque);
    assert_eq!(response.code, response::SUCCESS);
    assert!(started.elapsed() < Duration::from_millis(500));

    let frames = split_frames(&response.body);
    assert_eq!(frames.len(), 1);
    assert_eq!(decode_frame(&frames[0]).unwrap().body.as_ref(), b"here");
}

#[tokio::test]
async fn test_pull_offset_too_small_moves_offset() {
    let broker = start_broker().await;
    let mut client = Client::connect(broker.addr).await;
    client.heartbeat("it-group", "orders", 1).await;

    for body in [b"m1".as_slice(), b"m2", b"m3"] {
        client.produce("orders", 0, body, &[]).await;
    }
    let probe = client.pull("it-group", "orders", 0, 0).await;
    let probe_header: PullMessageResponseHeader = probe.decode_header().unwrap();
    let min = probe_header.min_offset;
    assert!(min > 1_000);

    let response = client.pull("it-group", "orders", 0, min - 1_000).await;
    assert_eq!(response.code, response::PULL_OFFSET_MOVED);
    let header: PullMessageResponseHeader = response.decode_header().unwrap();
    assert_eq!(header.next_begin_offset, min);
}

#[tokio::test]
async fn test_delayed_send_lands_on_delay_pseudo_topic() {
    let broker = start_broker().await;
    let mut client = Client::connect(broker.addr).await;

    let response = client
        .produce("orders", 2, b"later", &[(props::DELAY, "3")])
        .await;
    assert_eq!(response.code, response::SUCCESS);

    let schedule_partitions = broker.ctx.config.schedule_topic_partitions;
    let delay_partition = 2 % schedule_partitions;
    let delay_topic = LegacyTopic::delay_topic(3);
    let partitioned = delay_topic.partition_name(PartitionId::new(delay_partition));

    // The original topic stayed empty; the pseudo-topic got the message.
    let orders = LegacyTopic::parse("orders").unwrap();
    assert!(broker
        .store
        .partition_bounds(&orders.partition_name(PartitionId::new(2)))
        .await
        .is_err());
    let mut reader = broker
        .store
        .create_reader(
            &partitioned,
            StartPosition::Earliest,
            ReaderOptions {
                name: "it-verify".to_string(),
                receiver_queue_size: 1,
            },
        )
        .await
        .unwrap();
    let entry = reader
        .read_next(Duration::from_millis(100))
        .await
        .unwrap()
        .expect("delayed message stored");
    let decoded = decode_frame(&entry.payload).unwrap();
    assert_eq!(decoded.property(props::REAL_TOPIC), Some("orders"));
    assert_eq!(decoded.property(props::REAL_QUEUE_ID), Some("2"));
    assert_eq!(decoded.body.as_ref(), b"later");
}

#[tokio::test]
async fn test_send_back_escalates_to_dlq() {
    let broker = start_broker().await;
    let mut client = Client::connect(broker.addr).await;
    client.heartbeat("it-group", "orders", 1).await;

    // Group allows zero redeliveries: the first send-back goes terminal.
    broker.ctx.groups.put(SubscriptionGroupConfig {
        retry_max_times: 0,
        ..SubscriptionGroupConfig::new("it-group")
    });

    let sent = client.produce("orders", 0, b"poison", &[]).await;
    let sent_header: SendMessageResponseHeader = sent.decode_header().unwrap();

    let header = ConsumerSendMsgBackRequestHeader {
        offset: sent_header.queue_offset,
        group: "it-group".to_string(),
        delay_level: 0,
        origin_msg_id: Some(sent_header.msg_id.clone()),
        origin_topic: "orders".to_string(),
        unit_mode: false,
        max_reconsume_times: None,
    };
    let response = client
        .request(RemotingCommand::with_header(
            request::CONSUMER_SEND_MSG_BACK,
            &header,
        ))
        .await;
    assert_eq!(response.code, response::SUCCESS);

    let dlq = LegacyTopic::parse("%DLQ%it-group").unwrap();
    let partitioned = dlq.partition_name(PartitionId::new(0));
    let bounds = broker.store.partition_bounds(&partitioned).await.unwrap();
    assert!(bounds.is_some(), "message must land in the DLQ");

    let mut reader = broker
        .store
        .create_reader(
            &partitioned,
            StartPosition::Earliest,
            ReaderOptions {
                name: "it-verify".to_string(),
                receiver_queue_size: 1,
            },
        )
        .await
        .unwrap();
    let entry = reader
        .read_next(Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    let decoded = decode_frame(&entry.payload).unwrap();
    assert_eq!(decoded.body.as_ref(), b"poison");
    assert_eq!(decoded.reconsume_times, 1);
    assert_eq!(decoded.property(props::RETRY_TOPIC), Some("orders"));
    assert_eq!(broker.ctx.stats.send_back_nums("it-group", "orders"), 1);
}

#[tokio::test]
async fn test_route_lookup_advertises_listener_endpoints() {
    let broker = start_broker_with(|store| {
        store.add_broker("b1:6650", &[("internal", "b1.internal:9876")]);
        store.add_broker("b2:6650", &[("internal", "b2.internal:9876")]);
        let topic = LegacyTopic::parse("routed").unwrap();
        for partition in 0..4 {
            store.set_partition_owner(&topic.backend_name(), partition, "b1:6650");
        }
        for partition in 4..8 {
            store.set_partition_owner(&topic.backend_name(), partition, "b2:6650");
        }
    })
    .await;
    let mut client = Client::connect(broker.addr).await;

    let mut command = RemotingCommand::new_request(request::GET_ROUTEINFO_BY_TOPIC);
    command.ext_fields = Some(HashMap::from([(
        "topic".to_string(),
        "routed".to_string(),
    )]));
    let response = client.request(command).await;
    assert_eq!(response.code, response::SUCCESS);

    let route: TopicRouteData = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(route.broker_datas.len(), 2);
    let mut endpoints: Vec<&str> = route
        .broker_datas
        .iter()
        .map(|b| b.broker_addrs[&0].as_str())
        .collect();
    endpoints.sort_unstable();
    assert_eq!(endpoints, vec!["b1.internal:9876", "b2.internal:9876"]);

    assert_eq!(route.queue_datas.len(), 2);
    for queue in &route.queue_datas {
        assert_eq!(queue.read_queue_nums, 4);
        assert_eq!(queue.write_queue_nums, 4);
    }
}

#[tokio::test]
async fn test_route_lookup_unknown_topic() {
    let broker = start_broker().await;
    let mut client = Client::connect(broker.addr).await;

    let mut command = RemotingCommand::new_request(request::GET_ROUTEINFO_BY_TOPIC);
    command.ext_fields = Some(HashMap::from([(
        "topic".to_string(),
        "nowhere".to_string(),
    )]));
    let response = client.request(command).await;
    assert_eq!(response.code, response::TOPIC_NOT_EXIST);
}

#[tokio::test]
async fn test_stale_subscription_version_is_rejected() {
    let broker = start_broker().await;
    let mut client = Client::connect(broker.addr).await;
    client.heartbeat("it-group", "orders", 5).await;
    client.produce("orders", 0, b"x", &[]).await;

    let response = client
        .request(Client::pull_command("it-group", "orders", 0, 0, 0, 0, 10))
        .await;
    assert_eq!(response.code, response::SUBSCRIPTION_NOT_LATEST);

    // Matching (or newer) stored version pulls fine.
    let response = client
        .request(Client::pull_command("it-group", "orders", 0, 0, 0, 0, 5))
        .await;
    assert_eq!(response.code, response::SUCCESS);
}

#[tokio::test]
async fn test_pull_without_heartbeat_retries() {
    let broker = start_broker().await;
    let mut client = Client::connect(broker.addr).await;
    client.produce("orders", 0, b"x", &[]).await;

    // Inline subscription skips the stored-subscription checks, but the
    // session lookup still requires registration.
    let header = PullMessageRequestHeader {
        consumer_group: "never-registered".to_string(),
        topic: "orders".to_string(),
        queue_id: 0,
        queue_offset: 0,
        max_msg_nums: 10,
        sys_flag: pull_flag::SUBSCRIPTION,
        commit_offset: 0,
        suspend_timeout_millis: 0,
        subscription: Some("*".to_string()),
        sub_version: 0,
        expression_type: Some("TAG".to_string()),
    };
    let response = client
        .request(RemotingCommand::with_header(request::PULL_MESSAGE, &header))
        .await;
    assert_eq!(response.code, response::PULL_RETRY_IMMEDIATELY);
    assert_eq!(response.remark.as_deref(), Some("store getMessage return null"));
}

#[tokio::test]
async fn test_batch_send_and_pull() {
    let broker = start_broker().await;
    let mut client = Client::connect(broker.addr).await;
    client.heartbeat("it-group", "orders", 1).await;

    let mut body = BytesMut::new();
    for payload in [b"b1".as_slice(), b"b2"] {
        body.extend_from_slice(&encode_batch_item(&BatchItem {
            flag: 0,
            body: Bytes::copy_from_slice(payload),
            properties: HashMap::new(),
        }));
    }

    let header = SendMessageRequestHeader {
        producer_group: "it-producers".to_string(),
        topic: "orders".to_string(),
        default_topic: "TBW102".to_string(),
        default_topic_queue_nums: 4,
        queue_id: 1,
        sys_flag: 0,
        born_timestamp: now_millis(),
        flag: 0,
        properties: None,
        reconsume_times: None,
        unit_mode: false,
        batch: true,
        max_reconsume_times: None,
    };
    let mut command = RemotingCommand::new_request(request::SEND_BATCH_MESSAGE);
    command.ext_fields = Some(header.to_v2_fields());
    command.body = body.freeze();

    let response = client.request(command).await;
    assert_eq!(response.code, response::SUCCESS);
    let send_header: SendMessageResponseHeader = response.decode_header().unwrap();
    assert_eq!(send_header.msg_id.split(',').count(), 2);

    let pulled = client.pull("it-group", "orders", 1, 0).await;
    assert_eq!(pulled.code, response::SUCCESS);
    assert_eq!(split_frames(&pulled.body).len(), 2);
}

#[tokio::test]
async fn test_commit_offset_side_effect() {
    let broker = start_broker().await;
    let mut client = Client::connect(broker.addr).await;
    client.heartbeat("it-group", "orders", 1).await;
    client.produce("orders", 0, b"x", &[]).await;

    let header = PullMessageRequestHeader {
        consumer_group: "it-group".to_string(),
        topic: "orders".to_string(),
        queue_id: 0,
        queue_offset: 0,
        max_msg_nums: 10,
        sys_flag: pull_flag::COMMIT_OFFSET,
        commit_offset: 12_345,
        suspend_timeout_millis: 0,
        subscription: None,
        sub_version: 0,
        expression_type: None,
    };
    let response = client
        .request(RemotingCommand::with_header(request::PULL_MESSAGE, &header))
        .await;
    assert_eq!(response.code, response::SUCCESS);
    assert_eq!(
        broker.ctx.offsets.committed_offset("it-group", "orders", 0),
        Some(12_345)
    );
}

#[tokio::test]
async fn test_tag_filtered_pull_over_tcp() {
    let broker = start_broker().await;
    let mut client = Client::connect(broker.addr).await;

    for (body, tag) in [(b"a1".as_slice(), "alpha"), (b"b1", "beta"), (b"a2", "alpha")] {
        client
            .produce("orders", 0, body, &[(props::TAGS, tag)])
            .await;
    }

    // Inline subscription for "alpha" only; registration is still needed
    // for the session lookup.
    client.heartbeat("filter-group", "orders", 1).await;
    let header = PullMessageRequestHeader {
        consumer_group: "filter-group".to_string(),
        topic: "orders".to_string(),
        queue_id: 0,
        queue_offset: 0,
        max_msg_nums: 10,
        sys_flag: pull_flag::SUBSCRIPTION,
        commit_offset: 0,
        suspend_timeout_millis: 0,
        subscription: Some("alpha".to_string()),
        sub_version: 0,
        expression_type: Some("TAG".to_string()),
    };
    let response = client
        .request(RemotingCommand::with_header(request::PULL_MESSAGE, &header))
        .await;
    assert_eq!(response.code, response::SUCCESS);
    let frames = split_frames(&response.body);
    assert_eq!(frames.len(), 2);
    for frame in &frames {
        assert_eq!(decode_frame(frame).unwrap().tags(), Some("alpha"));
    }
}

#[tokio::test]
async fn test_unsupported_code() {
    let broker = start_broker().await;
    let mut client = Client::connect(broker.addr).await;
    let response = client.request(RemotingCommand::new_request(999)).await;
    assert_eq!(response.code, response::REQUEST_CODE_NOT_SUPPORTED);
}
