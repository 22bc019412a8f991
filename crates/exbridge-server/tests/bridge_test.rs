//! Bridge end-to-end tests over real sockets

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;

use arrow_array::{Array, Float64Array, Int32Array, Int64Array, StringArray};
use exbridge_common::{BridgeConfig, NodeAddr};
use exbridge_forwarder::{FlightReceiver, FlightSink, MemorySink, SinkEvent, StreamSink};
use exbridge_protocol::{
    ColumnSchema, CompressionCodec, ExportClient, PayloadBuilder, TypePolicy, Value, ACK,
    UNAUTHORIZED_REPLY,
};
use exbridge_server::BridgeServer;
use tokio::sync::oneshot;

const Q1_SCHEMA: &str =
    r#"{"columns":[{"name":"id","type":"INTEGER"},{"name":"v","type":"VARCHAR"}]}"#;

fn pick_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .expect("bind ephemeral port")
        .local_addr()
        .unwrap()
        .port()
}

fn q1_schema() -> Arc<ColumnSchema> {
    Arc::new(ColumnSchema::parse(Q1_SCHEMA.as_bytes(), TypePolicy::Permissive).unwrap())
}

fn q1_payload() -> Vec<u8> {
    let mut builder = PayloadBuilder::new(q1_schema());
    builder
        .push_row(&[Value::Int(1), Value::from("a")])
        .unwrap();
    builder.push_row(&[Value::Null, Value::from("b")]).unwrap();
    builder.finish().to_vec()
}

/// Start a bridge on an ephemeral port; dropping the sender stops accepting.
async fn start_bridge(
    mut config: BridgeConfig,
    sink: Arc<dyn StreamSink>,
) -> (SocketAddr, oneshot::Sender<()>) {
    config.listen_addr = NodeAddr::new("127.0.0.1", pick_port());
    let server = BridgeServer::new(config, sink).unwrap();
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server
            .serve_with_shutdown(listener, async {
                let _ = stop_rx.await;
            })
            .await
            .unwrap();
    });
    (addr, stop_tx)
}

async fn start_receiver() -> (FlightReceiver, u16) {
    let port = pick_port();
    let receiver = FlightReceiver::new();
    let server = receiver.clone();
    let listen: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
    tokio::spawn(async move {
        server.serve(listen).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    (receiver, port)
}

/// Wait for in-flight sessions to record their final sink calls.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_q1_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();
    let sink = MemorySink::new();
    let (addr, _stop) = start_bridge(BridgeConfig::default(), Arc::new(sink.clone())).await;

    let mut client = ExportClient::connect(addr).await.unwrap();
    client.send_query_id("Q1").await.unwrap();
    client.send_schema_json(Q1_SCHEMA).await.unwrap();
    client.send_batch(&q1_payload()).await.unwrap();
    assert_eq!(client.finish().await.unwrap(), ACK);

    let events = sink.events_for("Q1");
    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], SinkEvent::Open { schema, .. } if schema.fields().len() == 2));
    match &events[1] {
        SinkEvent::Write { batch, .. } => {
            assert_eq!(batch.num_rows(), 2);
            let ids = batch.column(0).as_any().downcast_ref::<Int32Array>().unwrap();
            assert_eq!(ids.value(0), 1);
            assert!(ids.is_null(1));
        }
        other => panic!("expected write, got {other:?}"),
    }
    assert!(matches!(events[2], SinkEvent::Close { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_truncated_batch_gets_no_ack() {
    let sink = MemorySink::new();
    let (addr, _stop) = start_bridge(BridgeConfig::default(), Arc::new(sink.clone())).await;

    let payload = q1_payload();
    let mut client = ExportClient::connect(addr).await.unwrap();
    client.send_query_id("Q1").await.unwrap();
    client.send_schema_json(Q1_SCHEMA).await.unwrap();
    client
        .send_batch(&payload[..payload.len() - 2])
        .await
        .unwrap();
    let reply = client.finish().await.unwrap_or_default();

    assert!(reply.is_empty());
    settle().await;
    assert_eq!(sink.opens_for("Q1"), 1);
    assert_eq!(sink.aborts_for("Q1"), 1);
    assert_eq!(sink.closes_for("Q1"), 0);
    assert_eq!(sink.rows_for("Q1"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sink_write_failure_gets_no_ack() {
    let sink = MemorySink::new().failing_write_at(0);
    let (addr, _stop) = start_bridge(BridgeConfig::default(), Arc::new(sink.clone())).await;

    let mut client = ExportClient::connect(addr).await.unwrap();
    client.send_query_id("Q1").await.unwrap();
    client.send_schema_json(Q1_SCHEMA).await.unwrap();
    client.send_batch(&q1_payload()).await.unwrap();
    let reply = client.finish().await.unwrap_or_default();

    assert!(reply.is_empty());
    settle().await;
    assert_eq!(sink.aborts_for("Q1"), 1);
    assert_eq!(sink.closes_for("Q1"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions_do_not_interfere() {
    let sink = MemorySink::new();
    let (addr, _stop) = start_bridge(BridgeConfig::default(), Arc::new(sink.clone())).await;

    let mut handles = Vec::new();
    for (query_id, batches) in [("QA", 3usize), ("QB", 5usize)] {
        handles.push(tokio::spawn(async move {
            let mut client = ExportClient::connect(addr).await.unwrap();
            client.send_query_id(query_id).await.unwrap();
            client.send_schema_json(Q1_SCHEMA).await.unwrap();
            for i in 0..batches {
                let mut builder = PayloadBuilder::new(q1_schema());
                builder
                    .push_row(&[Value::Int(i as i32), Value::from(query_id)])
                    .unwrap();
                client.send_batch(&builder.finish()).await.unwrap();
                tokio::task::yield_now().await;
            }
            client.finish_acked().await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(sink.rows_for("QA"), 3);
    assert_eq!(sink.rows_for("QB"), 5);
    for batch in sink.batches_for("QB") {
        let v = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(v.value(0), "QB");
    }
    assert_eq!(sink.closes_for("QA"), 1);
    assert_eq!(sink.closes_for("QB"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_session_does_not_stop_accepting() {
    let sink = MemorySink::new();
    let (addr, _stop) = start_bridge(BridgeConfig::default(), Arc::new(sink.clone())).await;

    let mut bad = ExportClient::connect(addr).await.unwrap();
    bad.send_query_id("bad").await.unwrap();
    bad.send_schema_json("not json").await.unwrap();
    assert!(bad.read_response().await.unwrap_or_default().is_empty());

    let mut good = ExportClient::connect(addr).await.unwrap();
    good.send_query_id("good").await.unwrap();
    good.send_schema_json(Q1_SCHEMA).await.unwrap();
    good.send_batch(&q1_payload()).await.unwrap();
    good.finish_acked().await.unwrap();

    assert_eq!(sink.opens_for("bad"), 0);
    assert_eq!(sink.rows_for("good"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auth_token() {
    let sink = MemorySink::new();
    let config = BridgeConfig {
        auth_token: Some("s3cret".to_string()),
        ..Default::default()
    };
    let (addr, _stop) = start_bridge(config, Arc::new(sink.clone())).await;

    let mut denied = ExportClient::connect(addr).await.unwrap();
    denied.send_token("wrong").await.unwrap();
    assert_eq!(denied.read_response().await.unwrap(), UNAUTHORIZED_REPLY);

    let mut allowed = ExportClient::connect(addr).await.unwrap();
    allowed.send_token("s3cret").await.unwrap();
    allowed.send_query_id("Q1").await.unwrap();
    allowed.send_schema(&q1_schema()).await.unwrap();
    allowed.send_batch(&q1_payload()).await.unwrap();
    allowed.finish_acked().await.unwrap();

    assert_eq!(sink.opens_for("Q1"), 1);
    assert_eq!(sink.rows_for("Q1"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_max_connections_queues_sessions() {
    let sink = MemorySink::new();
    let config = BridgeConfig {
        max_connections: Some(1),
        ..Default::default()
    };
    let (addr, _stop) = start_bridge(config, Arc::new(sink.clone())).await;

    let mut first = ExportClient::connect(addr).await.unwrap();
    first.send_query_id("first").await.unwrap();
    first.send_schema_json(Q1_SCHEMA).await.unwrap();

    let second = tokio::spawn(async move {
        let mut client = ExportClient::connect(addr).await.unwrap();
        client.send_query_id("second").await.unwrap();
        client.send_schema_json(Q1_SCHEMA).await.unwrap();
        client.finish_acked().await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.opens_for("second"), 0);

    first.send_batch(&q1_payload()).await.unwrap();
    first.finish_acked().await.unwrap();
    second.await.unwrap();

    assert_eq!(sink.opens_for("first"), 1);
    assert_eq!(sink.opens_for("second"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_accepting() {
    let sink = MemorySink::new();
    let (addr, stop) = start_bridge(BridgeConfig::default(), Arc::new(sink)).await;
    stop.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forwards_through_flight() {
    let _ = tracing_subscriber::fmt::try_init();
    let (receiver, flight_port) = start_receiver().await;

    let config = BridgeConfig {
        sink_addr: NodeAddr::new("127.0.0.1", flight_port),
        sink_timeout_secs: Some(5),
        ..Default::default()
    };
    let sink: Arc<dyn StreamSink> = Arc::new(FlightSink::from_config(&config));
    let (addr, _stop) = start_bridge(config, sink).await;

    let schema = Arc::new(
        ColumnSchema::parse(
            br#"{"columns":[{"name":"n","type":"BIGINT"},{"name":"x","type":"DOUBLE"},{"name":"when","type":"TIMESTAMP"}]}"#,
            TypePolicy::Permissive,
        )
        .unwrap(),
    );
    let mut client = ExportClient::connect(addr).await.unwrap();
    client.send_query_id("sales_export").await.unwrap();
    client.send_schema(&schema).await.unwrap();
    for chunk in 0..3i64 {
        let mut builder = PayloadBuilder::new(schema.clone());
        for i in 0..4i64 {
            builder
                .push_row(&[
                    Value::BigInt(chunk * 10 + i),
                    if i == 3 { Value::Null } else { Value::Double(i as f64 / 2.0) },
                    Value::from("2024-05-01 10:00:00"),
                ])
                .unwrap();
        }
        client.send_batch(&builder.finish()).await.unwrap();
    }
    client.finish_acked().await.unwrap();

    assert_eq!(receiver.rows("sales_export"), 12);
    let batches = receiver.batches("sales_export");
    assert_eq!(batches.len(), 3);
    let n = batches[2].column(0).as_any().downcast_ref::<Int64Array>().unwrap();
    assert_eq!(n.value(0), 20);
    let x = batches[0].column(1).as_any().downcast_ref::<Float64Array>().unwrap();
    assert_eq!(x.value(1), 0.5);
    assert!(x.is_null(3));
    let when = batches[1].column(2).as_any().downcast_ref::<StringArray>().unwrap();
    assert_eq!(when.value(0), "2024-05-01 10:00:00");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_session_commits_nothing_downstream() {
    let (receiver, flight_port) = start_receiver().await;
    let config = BridgeConfig {
        sink_addr: NodeAddr::new("127.0.0.1", flight_port),
        sink_timeout_secs: Some(5),
        ..Default::default()
    };
    let sink: Arc<dyn StreamSink> = Arc::new(FlightSink::from_config(&config));
    let (addr, _stop) = start_bridge(config, sink).await;

    let payload = q1_payload();
    let mut client = ExportClient::connect(addr).await.unwrap();
    client.send_query_id("partial").await.unwrap();
    client.send_schema_json(Q1_SCHEMA).await.unwrap();
    client.send_batch(&payload).await.unwrap();
    client
        .send_batch(&payload[..payload.len() - 2])
        .await
        .unwrap();
    let reply = client.finish().await.unwrap_or_default();
    assert!(reply.is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(receiver.rows("partial"), 0);
    assert!(receiver.destinations().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_compressed_sessions() {
    let sink = MemorySink::new();
    let config = BridgeConfig {
        negotiate_compression: true,
        ..Default::default()
    };
    let (addr, _stop) = start_bridge(config, Arc::new(sink.clone())).await;

    for (query_id, codec) in [
        ("plain", CompressionCodec::None),
        ("zlib", CompressionCodec::Zlib),
        ("lz4", CompressionCodec::Lz4),
    ] {
        let mut client = ExportClient::connect(addr).await.unwrap();
        client.send_query_id(query_id).await.unwrap();
        client.send_compression(codec).await.unwrap();
        client.send_schema_json(Q1_SCHEMA).await.unwrap();
        client.send_batch(&q1_payload()).await.unwrap();
        client.send_batch(&q1_payload()).await.unwrap();
        client.finish_acked().await.unwrap();

        assert_eq!(sink.rows_for(query_id), 4, "{codec}");
        let v = sink.batches_for(query_id)[1]
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .value(0)
            .to_string();
        assert_eq!(v, "a");
    }
}
