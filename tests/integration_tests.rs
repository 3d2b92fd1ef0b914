use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use prost::Message;
use tokio::sync::watch;
use transit_tracker::codec::{SchemaVersion, codec_for};
use transit_tracker::consumer::{Consumer, ConsumerConfig};
use transit_tracker::fetch::BasicClient;
use transit_tracker::gtfs_rt;
use transit_tracker::model::{ExcludedRoutes, StopStatus, VehiclePosition};
use transit_tracker::poller::{FeedPoller, PollerConfig, TickError};
use transit_tracker::publisher::{Publisher, PublisherConfig, RetryPolicy};
use transit_tracker::store::MemoryStore;
use transit_tracker::stream::{MemoryStreamLog, StreamLog};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOPIC: &str = "vehicle-data";
const GROUP: &str = "vehicle-data-group";

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn position(route: &str, vehicle: &str, trip: &str, secs: i64) -> VehiclePosition {
    VehiclePosition {
        vehicle_id: vehicle.to_string(),
        trip_id: trip.to_string(),
        route_id: route.to_string(),
        latitude: 47.4979,
        longitude: 19.0402,
        bearing: Some(90.0),
        speed: Some(8.5),
        timestamp: ts(secs),
        current_stop_sequence: Some(3),
        current_status: Some(StopStatus::StoppedAt),
        stop_id: Some("F00001".to_string()),
        vehicle_label: None,
        license_plate: Some("ABC-123".to_string()),
        wheelchair_accessible: Some(true),
        ingested_at: ts(secs),
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

fn publisher(log: Arc<dyn StreamLog>) -> Arc<Publisher> {
    Arc::new(Publisher::new(
        log,
        PublisherConfig {
            topic: TOPIC.to_string(),
            retry: fast_retry(),
        },
    ))
}

fn consumer(log: Arc<MemoryStreamLog>, store: Arc<MemoryStore>) -> Consumer {
    Consumer::new(
        log,
        store,
        ConsumerConfig {
            topic: TOPIC.to_string(),
            group: GROUP.to_string(),
            workers: 3,
            excluded: ExcludedRoutes::new(["9999"]),
            store_backoff: RetryPolicy {
                max_attempts: u32::MAX,
                ..fast_retry()
            },
            ..ConsumerConfig::default()
        },
    )
}

/// Consumes everything currently in the log and returns once it is drained.
async fn drain(log: &Arc<MemoryStreamLog>, store: &Arc<MemoryStore>) {
    log.close();
    let (_tx, rx) = watch::channel(false);
    consumer(Arc::clone(log), Arc::clone(store))
        .run(rx)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_excluded_route_never_stored() {
    let log = Arc::new(MemoryStreamLog::new());
    let store = Arc::new(MemoryStore::new());
    let publisher = publisher(log.clone());

    publisher
        .publish(&position("31", "V1", "T1", 1_700_000_000))
        .await
        .unwrap();
    publisher
        .publish(&position("9999", "V2", "T2", 1_700_000_000))
        .await
        .unwrap();

    drain(&log, &store).await;

    let rows = store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].position.route_id, "31");
    assert!(store.route("9999").is_none());
    assert_eq!(log.commits(TOPIC).len(), 2);
}

#[tokio::test]
async fn test_same_record_published_twice_stores_one_row() {
    let log = Arc::new(MemoryStreamLog::new());
    let store = Arc::new(MemoryStore::new());
    let publisher = publisher(log.clone());

    let p = position("31", "V1", "T1", 1_700_000_000);
    publisher.publish(&p).await.unwrap();
    publisher.publish(&p).await.unwrap();

    log.close();
    let (_tx, rx) = watch::channel(false);
    let snapshot = consumer(log.clone(), store.clone()).run(rx).await.unwrap();

    assert_eq!(store.rows().len(), 1);
    assert_eq!(store.writes().len(), 1);
    assert_eq!(snapshot.stored, 1);
    assert_eq!(snapshot.duplicates, 1);
}

#[tokio::test]
async fn test_redelivery_keeps_later_content() {
    let log = Arc::new(MemoryStreamLog::new());
    let store = Arc::new(MemoryStore::new());
    let publisher = publisher(log.clone());

    let first = position("31", "V1", "T1", 1_700_000_000);
    let mut later = first.clone();
    later.ingested_at = first.ingested_at + chrono::Duration::seconds(10);
    later.current_status = Some(StopStatus::InTransitTo);

    publisher.publish(&first).await.unwrap();
    publisher.publish(&later).await.unwrap();
    drain(&log, &store).await;

    let rows = store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].position.current_status, Some(StopStatus::InTransitTo));
    assert_eq!(rows[0].source_sequence, Some(1));
}

#[tokio::test]
async fn test_routes_are_stored_in_log_order() {
    let log = Arc::new(MemoryStreamLog::new());
    let store = Arc::new(MemoryStore::new());
    let publisher = publisher(log.clone());

    for i in 0..20 {
        for route in ["31", "9", "M2", "105"] {
            publisher
                .publish(&position(route, &format!("{route}-V"), "T", 1_700_000_000 + i))
                .await
                .unwrap();
        }
    }
    drain(&log, &store).await;

    assert_eq!(store.rows().len(), 80);
    for route in ["31", "9", "M2", "105"] {
        let sequences: Vec<u64> = store
            .writes()
            .iter()
            .filter(|r| r.position.route_id == route)
            .filter_map(|r| r.source_sequence)
            .collect();
        assert_eq!(sequences.len(), 20);
        assert!(
            sequences.windows(2).all(|w| w[0] < w[1]),
            "route {route} stored out of order: {sequences:?}"
        );
    }
}

#[tokio::test]
async fn test_store_failure_is_retried_without_commit() {
    let log = Arc::new(MemoryStreamLog::new());
    let store = Arc::new(MemoryStore::new());
    store.fail_next(1);
    publisher(log.clone())
        .publish(&position("31", "V1", "T1", 1_700_000_000))
        .await
        .unwrap();

    log.close();
    let (_tx, rx) = watch::channel(false);
    let snapshot = consumer(log.clone(), store.clone()).run(rx).await.unwrap();

    assert_eq!(store.attempts(), 2);
    assert_eq!(store.rows().len(), 1);
    assert_eq!(snapshot.store_failures, 1);
    assert_eq!(log.commits(TOPIC).len(), 1);
}

#[tokio::test]
async fn test_uncommitted_record_is_redelivered_after_restart() {
    let log = Arc::new(MemoryStreamLog::new());
    let store = Arc::new(MemoryStore::new());
    store.fail_next(u32::MAX);
    publisher(log.clone())
        .publish(&position("31", "V1", "T1", 1_700_000_000))
        .await
        .unwrap();

    let (tx, rx) = watch::channel(false);
    let first = consumer(log.clone(), store.clone());
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
    });
    first.run(rx).await.unwrap();
    assert!(log.commits(TOPIC).is_empty());
    assert!(store.rows().is_empty());
    stopper.abort();

    store.fail_next(0);
    drain(&log, &store).await;

    assert_eq!(store.rows().len(), 1);
    assert_eq!(log.commits(TOPIC).len(), 1);
}

#[tokio::test]
async fn test_invalid_record_is_committed_and_counted() {
    let log = Arc::new(MemoryStreamLog::new());
    let store = Arc::new(MemoryStore::new());

    log.publish(TOPIC, "31", "bad", bytes::Bytes::from_static(b"{\"broken\""))
        .await
        .unwrap();
    let mut skewed = position("31", "V1", "T1", 1_700_000_000);
    skewed.ingested_at = skewed.timestamp + chrono::Duration::hours(5);
    publisher(log.clone()).publish(&skewed).await.unwrap();

    log.close();
    let (_tx, rx) = watch::channel(false);
    let snapshot = consumer(log.clone(), store.clone()).run(rx).await.unwrap();

    assert!(store.rows().is_empty());
    assert_eq!(snapshot.poison, 1);
    assert_eq!(snapshot.rejected, 1);
    assert_eq!(log.commits(TOPIC).len(), 2);
}

#[tokio::test]
async fn test_unstorable_records_do_not_stall_other_routes() {
    // Fewer log partitions than workers, so one partition is split.
    let log = Arc::new(MemoryStreamLog::with_partitions(2));
    let store = Arc::new(MemoryStore::new());
    let publisher = publisher(log.clone());

    let mut nul = position("5", "V0", "T0", 1_700_000_000);
    nul.stop_id = Some("F\0".to_string());
    publisher.publish(&nul).await.unwrap();

    let routes = ["31", "9", "M2", "105", "5"];
    for i in 0..300i64 {
        let route = routes[i as usize % routes.len()];
        publisher
            .publish(&position(route, &format!("V{i}"), "T1", 1_700_000_000 + i))
            .await
            .unwrap();
    }
    log.close();

    store.refuse_next(1);
    let config = ConsumerConfig {
        topic: TOPIC.to_string(),
        group: GROUP.to_string(),
        workers: 4,
        channel_capacity: 8,
        store_backoff: RetryPolicy {
            max_attempts: u32::MAX,
            ..fast_retry()
        },
        ..ConsumerConfig::default()
    };
    let (_tx, rx) = watch::channel(false);
    let snapshot = tokio::time::timeout(
        Duration::from_secs(10),
        Consumer::new(log.clone(), store.clone(), config.clone()).run(rx),
    )
    .await
    .expect("consumer stalled")
    .unwrap();

    assert_eq!(snapshot.received, 301);
    assert_eq!(snapshot.settled(), 301);
    assert_eq!(snapshot.rejected, 2);
    assert_eq!(snapshot.store_failures, 0);
    assert_eq!(store.rows().len(), 299);
    assert_eq!(log.commits(TOPIC).len(), 301);

    // Everything was committed, so a restart has nothing left to read.
    let (_tx, rx) = watch::channel(false);
    let again = Consumer::new(log.clone(), store.clone(), config).run(rx).await.unwrap();
    assert_eq!(again.received, 0);
}

fn feed_bytes(now: i64) -> Vec<u8> {
    let entity = |id: &str, route: &str| gtfs_rt::FeedEntity {
        id: id.to_string(),
        vehicle: Some(gtfs_rt::VehiclePosition {
            trip: Some(gtfs_rt::TripDescriptor {
                trip_id: Some(format!("trip-{id}")),
                route_id: Some(route.to_string()),
                ..Default::default()
            }),
            vehicle: Some(gtfs_rt::VehicleDescriptor {
                id: Some(format!("veh-{id}")),
                ..Default::default()
            }),
            position: Some(gtfs_rt::Position {
                latitude: 47.5,
                longitude: 19.05,
                ..Default::default()
            }),
            timestamp: Some(now as u64),
            ..Default::default()
        }),
        ..Default::default()
    };

    gtfs_rt::FeedMessage {
        header: gtfs_rt::FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            timestamp: Some(now as u64),
            ..Default::default()
        },
        entity: vec![entity("1", "31"), entity("2", "9999")],
    }
    .encode_to_vec()
}

fn poller(url: String, log: Arc<dyn StreamLog>) -> FeedPoller {
    FeedPoller::new(
        Box::new(BasicClient::new()),
        codec_for(SchemaVersion::V2),
        publisher(log),
        PollerConfig {
            feed_url: url,
            interval: Duration::from_secs(10),
            publish_concurrency: 4,
        },
    )
}

#[tokio::test]
async fn test_feed_to_store_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vehicles.pb"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(feed_bytes(Utc::now().timestamp())))
        .mount(&server)
        .await;

    let log = Arc::new(MemoryStreamLog::new());
    let store = Arc::new(MemoryStore::new());
    let poller = poller(format!("{}/vehicles.pb", server.uri()), log.clone());

    let report = poller.tick().await.unwrap();
    assert_eq!(report.decoded, 2);
    assert_eq!(report.published, 2);
    assert_eq!(report.routes, 2);

    drain(&log, &store).await;

    let rows = store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].position.route_id, "31");
    assert_eq!(rows[0].position.vehicle_id, "veh-1");
}

#[tokio::test]
async fn test_fetch_failure_skips_tick() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let log = Arc::new(MemoryStreamLog::new());
    let poller = poller(server.uri(), log.clone());

    let err = poller.tick().await.unwrap_err();
    assert!(matches!(err, TickError::Fetch(_)));
    assert!(log.envelopes(TOPIC).is_empty());
    assert_eq!(poller.stats().snapshot().fetch_failures, 1);
}

#[tokio::test]
async fn test_undecodable_feed_skips_tick() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFFu8, 0xFF, 0xFF]))
        .mount(&server)
        .await;

    let log = Arc::new(MemoryStreamLog::new());
    let poller = poller(server.uri(), log.clone());

    assert!(matches!(poller.tick().await, Err(TickError::Decode(_))));
    assert!(log.envelopes(TOPIC).is_empty());
}

#[tokio::test]
async fn test_poller_stops_on_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(feed_bytes(Utc::now().timestamp())))
        .mount(&server)
        .await;

    let log = Arc::new(MemoryStreamLog::new());
    let poller = poller(server.uri(), log.clone());
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn(async move { poller.run(rx).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    // The first tick fires immediately; the next one is 10s away.
    assert_eq!(log.envelopes(TOPIC).len(), 2);
}
