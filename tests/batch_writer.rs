//! Batch slicing and failure modes of `BatchWriter`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{client, client_with_metrics, config, rows, CountingMetrics, Fault, FakeService, Route};
use serde::Serialize;
use serde_json::json;
use snowpipe_stream::{
    BatchFailure, ChannelState, MetricsErrorKind, Record, RecordError, SessionError,
    TransportError, WriteError, WriteMode,
};
use tokio_util::sync::CancellationToken;

// 4 KiB framing reserve plus a 100-byte row budget.
const TIGHT_REQUEST_BYTES: usize = 4096 + 100;

// `{"k":"…"}` is 8 bytes of framing around the value.
fn row_of_len(len: usize) -> serde_json::Value {
    json!({ "k": "x".repeat(len - 8) })
}

#[derive(Serialize)]
struct Event {
    id: u64,
    kind: &'static str,
}

#[tokio::test(start_paused = true)]
async fn test_batches_preserve_input_order() {
    let service = FakeService::new();
    let client = client(&service, config().with_batch_limits(10, 64 * 1024));
    let mut session = client.channel("ordered");
    session.open().await.unwrap();

    let events = (0..25).map(|id| Event { id, kind: "click" });
    let summary = client
        .batch_writer(WriteMode::FailFast)
        .write(events, &mut session)
        .await
        .unwrap();

    assert_eq!(summary.records_attempted, 25);
    assert_eq!(summary.records_accepted, 25);
    assert_eq!(summary.batches_accepted, 3);
    assert_eq!(summary.batches_failed, 0);
    assert!(!summary.cancelled);

    let inserts = service.seen_on(Route::Insert);
    let sizes: Vec<usize> = inserts
        .iter()
        .map(|s| s.body.as_ref().unwrap()["rows"].as_array().unwrap().len())
        .collect();
    assert_eq!(sizes, [10, 10, 5]);

    let ids: Vec<u64> = inserts
        .iter()
        .flat_map(|s| s.body.as_ref().unwrap()["rows"].as_array().unwrap().clone())
        .map(|row| row["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids, (0..25).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_record_at_budget_is_sent_and_over_budget_is_rejected_locally() {
    let service = FakeService::new();
    let client = client(&service, config().with_batch_limits(100, TIGHT_REQUEST_BYTES));
    let mut session = client.channel("budget");
    session.open().await.unwrap();

    let records = vec![row_of_len(100), row_of_len(101), row_of_len(100)];
    let summary = client
        .batch_writer(WriteMode::BestEffort)
        .write(records, &mut session)
        .await
        .unwrap();

    // Two exact-budget rows cannot share a request.
    assert_eq!(summary.batches_accepted, 2);
    assert_eq!(summary.records_accepted, 2);
    assert_eq!(summary.records_attempted, 3);
    assert_eq!(summary.batches_failed, 1);

    let failed = &summary.failed_batches[0];
    assert_eq!(failed.records, 1..2);
    assert!(failed.bytes.is_empty());
    assert!(matches!(
        failed.error,
        BatchFailure::Record(RecordError::TooLarge {
            index: 1,
            bytes: 101,
            budget: 100
        })
    ));

    let inserts = service.seen_on(Route::Insert);
    assert_eq!(inserts.len(), 2);
    for insert in inserts {
        let rows = insert.body.unwrap()["rows"].as_array().unwrap().clone();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].to_string().len(), 100);
    }
}

#[tokio::test(start_paused = true)]
async fn test_over_budget_record_aborts_fail_fast_without_network_call() {
    let service = FakeService::new();
    let client = client(&service, config().with_batch_limits(100, TIGHT_REQUEST_BYTES));
    let mut session = client.channel("budget");
    session.open().await.unwrap();

    let records = vec![row_of_len(40), row_of_len(101), row_of_len(40)];
    let err = client
        .batch_writer(WriteMode::FailFast)
        .write(records, &mut session)
        .await
        .unwrap_err();

    match &err {
        WriteError::Aborted {
            records, source, ..
        } => {
            assert_eq!(records, &(1..2));
            assert!(matches!(
                source,
                BatchFailure::Record(RecordError::TooLarge { index: 1, .. })
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.summary().records_attempted, 1);
    assert_eq!(err.summary().records_accepted, 0);
    assert!(service.seen_on(Route::Insert).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_non_object_records_are_rejected() {
    let service = FakeService::new();
    let client = client(&service, config());
    let mut session = client.channel("shapes");
    session.open().await.unwrap();

    let mut row = Record::new();
    row.set_i64("id", 7).set_str("kind", "view");
    let records = vec![row.into_value(), json!([1, 2]), json!("text")];
    let summary = client
        .batch_writer(WriteMode::BestEffort)
        .write(records, &mut session)
        .await
        .unwrap();

    assert_eq!(summary.records_accepted, 1);
    assert_eq!(summary.batches_failed, 2);
    assert!(summary.failed_batches.iter().all(|f| matches!(
        f.error,
        BatchFailure::Record(RecordError::NotAnObject { .. })
    )));
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_counted_in_summary() {
    let service = FakeService::new();
    let metrics = Arc::new(CountingMetrics::default());
    let client = client_with_metrics(&service, config(), metrics.clone());
    let mut session = client.channel("retried");
    session.open().await.unwrap();

    service.fail_status(Route::Insert, 500, 3);
    let summary = client
        .batch_writer(WriteMode::FailFast)
        .write(rows(10), &mut session)
        .await
        .unwrap();

    assert_eq!(summary.records_accepted, 10);
    assert_eq!(summary.batches_accepted, 1);
    assert_eq!(summary.retries, 3);
    assert_eq!(service.seen_on(Route::Insert).len(), 4);
    assert_eq!(service.rows("retried"), 10);
}

#[tokio::test(start_paused = true)]
async fn test_best_effort_records_failed_range_and_continues() {
    let service = FakeService::new();
    let metrics = Arc::new(CountingMetrics::default());
    let client = client_with_metrics(
        &service,
        config().with_batch_limits(5, 64 * 1024),
        metrics.clone(),
    );
    let mut session = client.channel("lossy");
    session.open().await.unwrap();

    service.fail_status(Route::Insert, 500, 4);
    let summary = client
        .batch_writer(WriteMode::BestEffort)
        .write(rows(10), &mut session)
        .await
        .unwrap();

    assert_eq!(summary.records_attempted, 10);
    assert_eq!(summary.records_accepted, 5);
    assert_eq!(summary.batches_accepted, 1);
    assert_eq!(summary.batches_failed, 1);
    assert_eq!(summary.retries, 3);

    let failed = &summary.failed_batches[0];
    assert_eq!(failed.records, 0..5);
    assert_eq!(failed.bytes.start, 0);
    assert!(failed.bytes.end > 0);
    assert!(matches!(
        failed.error,
        BatchFailure::Insert(SessionError::Insert {
            source: TransportError::Transient { attempts: 4, .. },
            ..
        })
    ));

    // The channel was reopened before the next batch.
    assert_eq!(service.opens(), 2);
    assert_eq!(service.rows("lossy"), 5);
    assert_eq!(session.state(), ChannelState::Open);
    assert_eq!(metrics.errors_of(MetricsErrorKind::Insert), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_record_splits_batch_in_best_effort() {
    let service = FakeService::new();
    let client = client(&service, config());
    let mut session = client.channel("split");
    session.open().await.unwrap();

    service.fail_status(Route::Insert, 500, 8);
    let records = vec![json!({"id": 0}), json!([1]), json!({"id": 2}), json!({"id": 3})];
    let summary = client
        .batch_writer(WriteMode::BestEffort)
        .write(records, &mut session)
        .await
        .unwrap();

    assert_eq!(summary.records_attempted, 4);
    assert_eq!(summary.records_accepted, 0);
    assert_eq!(summary.batches_failed, 3);

    let ranges: Vec<_> = summary
        .failed_batches
        .iter()
        .map(|f| (f.records.clone(), f.bytes.clone()))
        .collect();
    // `{"id":0}` is 8 bytes; `{"id":2},{"id":3}` is 17.
    assert_eq!(ranges, [(0..1, 0..8), (1..2, 8..8), (2..4, 8..25)]);
    assert!(matches!(
        summary.failed_batches[1].error,
        BatchFailure::Record(RecordError::NotAnObject { index: 1 })
    ));

    // Every failed insert range names exactly the rows that were sent.
    let inserts = service.seen_on(Route::Insert);
    assert_eq!(inserts.len(), 8);
    let sent_ids = |i: usize| -> Vec<u64> {
        inserts[i].body.as_ref().unwrap()["rows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|row| row["id"].as_u64().unwrap())
            .collect()
    };
    assert_eq!(sent_ids(0), [0]);
    assert_eq!(sent_ids(4), [2, 3]);
    assert_eq!(service.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_request_body_fails_batch_without_sending() {
    let service = FakeService::new();
    let client = client(&service, config().with_batch_limits(100, TIGHT_REQUEST_BYTES));
    let mut session = client.channel("long-token");
    // The continuation token alone outgrows the framing reserve.
    service.pad_continuation_tokens(4096);
    session.open().await.unwrap();

    let summary = client
        .batch_writer(WriteMode::BestEffort)
        .write([row_of_len(100)], &mut session)
        .await
        .unwrap();

    assert_eq!(summary.records_accepted, 0);
    assert_eq!(summary.batches_failed, 1);
    assert_eq!(summary.retries, 0);
    let failed = &summary.failed_batches[0];
    assert_eq!(failed.records, 0..1);
    match &failed.error {
        BatchFailure::Insert(SessionError::Insert {
            source: TransportError::BodyTooLarge { bytes, limit },
            ..
        }) => {
            assert!(*bytes > TIGHT_REQUEST_BYTES);
            assert_eq!(*limit, TIGHT_REQUEST_BYTES);
        }
        other => panic!("unexpected failure: {other:?}"),
    }
    assert!(service.seen_on(Route::Insert).is_empty());
    assert_eq!(service.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_aborts_with_failed_range() {
    let service = FakeService::new();
    let client = client(&service, config().with_batch_limits(5, 64 * 1024));
    let mut session = client.channel("strict");
    session.open().await.unwrap();

    service.fail_status(Route::Insert, 503, 4);
    let err = client
        .batch_writer(WriteMode::FailFast)
        .write(rows(10), &mut session)
        .await
        .unwrap_err();

    match &err {
        WriteError::Aborted {
            records,
            source: BatchFailure::Insert(SessionError::Insert { byte_range, .. }),
            ..
        } => {
            assert_eq!(records, &(0..5));
            assert_eq!(byte_range.start, 0);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    let summary = err.summary();
    assert_eq!(summary.records_attempted, 5);
    assert_eq!(summary.records_accepted, 0);
    assert_eq!(summary.batches_failed, 1);
    assert_eq!(summary.retries, 3);

    // The second batch was never sent.
    assert_eq!(service.seen_on(Route::Insert).len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_is_fatal_in_best_effort() {
    let service = FakeService::new();
    let client = client(&service, config().with_batch_limits(5, 64 * 1024));
    let mut session = client.channel("revoked");
    session.open().await.unwrap();

    service.fail_status(Route::Insert, 401, 2);
    let err = client
        .batch_writer(WriteMode::BestEffort)
        .write(rows(10), &mut session)
        .await
        .unwrap_err();

    match &err {
        WriteError::Fatal { source, .. } => {
            assert!(matches!(source, SessionError::Auth { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.summary().records_accepted, 0);
    assert_eq!(session.state(), ChannelState::Errored);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_start_sends_nothing() {
    let service = FakeService::new();
    let client = client(&service, config());
    let mut session = client.channel("idle");
    session.open().await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let summary = client
        .batch_writer(WriteMode::FailFast)
        .with_cancellation(token)
        .write(rows(3), &mut session)
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.in_flight, None);
    assert_eq!(summary.records_attempted, 0);
    assert!(service.seen_on(Route::Insert).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_in_flight_insert() {
    let service = FakeService::new();
    let client = client(&service, config().with_batch_limits(5, 64 * 1024));
    let mut session = client.channel("interrupted");
    session.open().await.unwrap();

    service.fail(Route::Insert, [Fault::Hang]);
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let summary = client
        .batch_writer(WriteMode::BestEffort)
        .with_cancellation(token)
        .write(rows(10), &mut session)
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.records_accepted, 0);
    assert_eq!(summary.in_flight, Some(0..5));
    assert_eq!(service.seen_on(Route::Insert).len(), 1);
    assert_eq!(session.state(), ChannelState::Inserting);

    // Status reconciles the abandoned insert; close still works.
    session.status().await.unwrap();
    assert_eq!(session.state(), ChannelState::Open);
    session.close().await;
    assert_eq!(session.state(), ChannelState::Closed);
}
