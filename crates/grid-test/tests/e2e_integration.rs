//! End-to-end integration tests for Gridbase.
//!
//! These run the full stack — client façade, RPC core, wire codec,
//! in-memory transport, server façade, query engine, SQLite — and cover
//! the concrete scenarios S1–S6 plus the cross-component properties.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use grid_common::{
    CellValue, DocAction, EngineError, Query, QueryCursor, StreamingOptions,
};
use grid_rpc::{CancelSource, StreamingData};
use grid_test::{rpc_pair, table1_rows, table1_schema, EchoHandler, TestHarness};

fn options(chunk_rows: usize) -> StreamingOptions {
    StreamingOptions {
        timeout_ms: 60_000,
        chunk_rows,
    }
}

/// S1: a call with a plain value echoes back with no chunk tail.
#[tokio::test]
async fn test_s1_echo() {
    let (near, _far, _end) = rpc_pair(Arc::new(EchoHandler));
    let result = near
        .make_call(StreamingData::from_value(json!("hello world")), None)
        .await
        .unwrap();
    assert_eq!(result.value, Some(json!("hello world")));
    assert!(result.chunks.is_none());
}

/// S2: table lifecycle — create, fill, fetch.
#[tokio::test]
async fn test_s2_table_lifecycle() {
    let harness = TestHarness::start().await;
    let client = harness.client();

    let created = client.apply_actions(&[table1_schema()]).await.unwrap();
    assert_eq!(created.results, vec![serde_json::Value::Null]);

    client
        .apply_actions(&[DocAction::from_json(&json!([
            "BulkAddRecord",
            "Table1",
            [1, 2, 3],
            {"Name": ["A", "B", "C"], "Age": [10, 20, 30]}
        ]))
        .unwrap()])
        .await
        .unwrap();

    let result = client.fetch_query(&Query::table("Table1")).await.unwrap();
    assert_eq!(result.table_data.id, vec![1, 2, 3]);
    assert_eq!(
        result.table_data.col("Name").unwrap(),
        &vec![
            CellValue::Text("A".into()),
            CellValue::Text("B".into()),
            CellValue::Text("C".into())
        ]
    );
    assert_eq!(
        result.table_data.col("Age").unwrap(),
        &vec![CellValue::Int(10), CellValue::Int(20), CellValue::Int(30)]
    );
}

/// S3: filter and sort.
#[tokio::test]
async fn test_s3_filter_and_sort() {
    let harness = TestHarness::start().await;
    let client = harness.client();
    client.apply_actions(&[table1_schema()]).await.unwrap();
    client
        .apply_actions(&[DocAction::from_json(&json!([
            "BulkAddRecord",
            "Table1",
            [1, 2, 3],
            {"Name": ["A", "B", "C"], "Age": [10, 20, 30]}
        ]))
        .unwrap()])
        .await
        .unwrap();

    let query = Query {
        filters: Some(json!(["GtE", ["Name", "Age"], ["Const", 20]])),
        sort: Some(vec!["-Age".into()]),
        ..Query::table("Table1")
    };
    let result = client.fetch_query(&query).await.unwrap();
    assert_eq!(result.table_data.id, vec![3, 2]);
}

/// S4: cursor pagination over 3000 rows in batches of 1000.
#[tokio::test]
async fn test_s4_cursor_pagination() {
    let harness = TestHarness::start().await;
    harness.seed_table1(3000).await.unwrap();
    let client = harness.client();

    let mut cursor = None;
    let mut batches = Vec::new();
    loop {
        let query = Query {
            sort: Some(vec!["id".into()]),
            limit: Some(1000),
            cursor: cursor.clone(),
            ..Query::table("Table1")
        };
        let result = client.fetch_query(&query).await.unwrap();
        if result.table_data.id.is_empty() {
            break;
        }
        cursor = Some(QueryCursor::after(vec![json!(
            *result.table_data.id.last().unwrap()
        )]));
        batches.push(result.table_data.id);
    }

    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|batch| batch.len() == 1000));
    let all: Vec<i64> = batches.into_iter().flatten().collect();
    assert_eq!(all, (1..=3000).collect::<Vec<i64>>());
}

/// S5: streaming 200000 rows in 400 chunks of 500.
#[tokio::test]
async fn test_s5_streaming() {
    let harness = TestHarness::start().await;
    harness.seed_table1(200_000).await.unwrap();
    let client = harness.client();

    let query = Query {
        sort: Some(vec!["id".into()]),
        ..Query::table("Table1")
    };
    let mut stream = client
        .fetch_query_streaming(&query, &options(500), None)
        .await
        .unwrap();
    assert_eq!(stream.col_ids[0], "id");

    let mut chunk_count = 0usize;
    let mut row_count = 0usize;
    let mut id_sum: i64 = 0;
    while let Some(rows) = stream.next_rows().await {
        let rows = rows.unwrap();
        assert_eq!(rows.len(), 500);
        chunk_count += 1;
        row_count += rows.len();
        for row in rows {
            id_sum += row[0].as_int().unwrap();
        }
    }
    assert_eq!(chunk_count, 400);
    assert_eq!(row_count, 200_000);
    assert_eq!(id_sum, 20_000_100_000);
}

/// S6: cancelling a streaming read mid-consumption; a fresh stream
/// still succeeds.
#[tokio::test]
async fn test_s6_cancelled_streaming() {
    let harness = TestHarness::start().await;
    harness.seed_table1(5_000).await.unwrap();
    let client = harness.client();

    let source = CancelSource::new();
    let query = Query {
        sort: Some(vec!["id".into()]),
        ..Query::table("Table1")
    };
    let mut stream = client
        .fetch_query_streaming(&query, &options(100), Some(source.signal()))
        .await
        .unwrap();

    let first = stream.next_rows().await.unwrap().unwrap();
    assert_eq!(first.len(), 100);
    source.fire("user cancelled");

    let mut saw_abort = false;
    while let Some(rows) = stream.next_rows().await {
        match rows {
            Ok(_) => continue,
            Err(error) => {
                assert!(error.is_abort(), "unexpected error: {error}");
                saw_abort = true;
                break;
            }
        }
    }
    assert!(saw_abort);

    // A fresh streaming read succeeds after the aborted one.
    let mut fresh = client
        .fetch_query_streaming(&query, &options(100), None)
        .await
        .unwrap();
    let rows = fresh.next_rows().await.unwrap().unwrap();
    assert_eq!(rows[0][0], CellValue::Int(1));
    fresh.close();
}

/// P7 end to end: streamed chunks concatenate to the eager result.
#[tokio::test]
async fn test_streaming_matches_fetch() {
    let harness = TestHarness::start().await;
    harness.seed_table1(1234).await.unwrap();
    let client = harness.client();

    let query = Query {
        filters: Some(json!(["Gt", ["Name", "Age"], ["Const", 500]])),
        sort: Some(vec!["-Age".into()]),
        ..Query::table("Table1")
    };

    let eager = client.fetch_query(&query).await.unwrap();

    let mut stream = client
        .fetch_query_streaming(&query, &options(97), None)
        .await
        .unwrap();
    let mut streamed_ids = Vec::new();
    let id_index = stream.col_ids.iter().position(|c| c == "id").unwrap();
    while let Some(rows) = stream.next_rows().await {
        for row in rows.unwrap() {
            streamed_ids.push(row[id_index].as_int().unwrap());
        }
    }
    assert_eq!(streamed_ids, eager.table_data.id);
}

/// Action broadcasts reach every connection, stripped when large.
#[tokio::test]
async fn test_action_broadcast_and_stripping() {
    let mut harness = TestHarness::start_with_clients(2).await;
    let observer = harness.connect_client();
    harness.seed_table1(0).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _guard = observer.on_action(move |set| {
        let _ = tx.send(set.clone());
    });

    // Small action arrives intact.
    harness.client().apply_actions(&[table1_rows((1..=3).collect())]).await.unwrap();
    let small = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(small.actions[0].row_count(), 3);

    // Large action arrives stripped: empty row ids, keys preserved.
    harness
        .client()
        .apply_actions(&[table1_rows((10..=400).collect())])
        .await
        .unwrap();
    let large = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(large.actions[0].row_count(), 0);
    match &large.actions[0] {
        DocAction::BulkAddRecord { columns, .. } => {
            assert!(columns.contains_key("Name"));
            assert!(columns["Name"].is_empty());
        }
        other => panic!("unexpected action {other:?}"),
    }
    assert!(large.action_num > small.action_num);
}

/// P4: disconnect rejects pending calls with the disconnect reason and
/// stops notifying listeners on that connection.
#[tokio::test]
async fn test_disconnect_propagation() {
    let harness = TestHarness::start().await;
    harness.seed_table1(50_000).await.unwrap();
    let client = harness.client().clone();

    // Park a slow streaming call, then cut the connection.
    let query = Query {
        sort: Some(vec!["id".into()]),
        ..Query::table("Table1")
    };
    let mut stream = client
        .fetch_query_streaming(&query, &options(100), None)
        .await
        .unwrap();
    let _ = stream.next_rows().await.unwrap().unwrap();

    harness.client_ends[0].close("network gone");

    let mut saw_disconnect = false;
    while let Some(rows) = stream.next_rows().await {
        if let Err(error) = rows {
            assert_eq!(error, EngineError::Disconnected("network gone".into()));
            saw_disconnect = true;
            break;
        }
    }
    assert!(saw_disconnect);

    let error = client.fetch_query(&Query::table("Table1")).await.unwrap_err();
    assert!(matches!(error, EngineError::Transport(_) | EngineError::Disconnected(_)));
}

/// Unknown methods fail with the documented error.
#[tokio::test]
async fn test_unknown_method() {
    let harness = TestHarness::start().await;
    let error = harness
        .client()
        .rpc()
        .make_call(StreamingData::from_value(json!(["mystery", 1])), None)
        .await
        .unwrap_err();
    assert_eq!(error, EngineError::UnknownMethod("mystery".into()));
}

/// Errors keep their kind across the wire.
#[tokio::test]
async fn test_error_kinds_cross_the_wire() {
    let harness = TestHarness::start().await;
    let client = harness.client();

    // Builder error: unknown filter tag.
    let query = Query {
        filters: Some(json!(["Explode", 1])),
        ..Query::table("Table1")
    };
    let error = client.fetch_query(&query).await.unwrap_err();
    assert!(matches!(error, EngineError::Builder(_)));

    // Not-implemented action.
    let error = client
        .apply_actions(&[DocAction::from_json(&json!([
            "ModifyColumn", "Table1", "Age", {"type": "Text"}
        ]))
        .unwrap()])
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::NotImplemented(_)));
}

/// P9 end to end: a failing action set leaves the store unchanged.
#[tokio::test]
async fn test_apply_atomicity() {
    let harness = TestHarness::start().await;
    harness.seed_table1(5).await.unwrap();
    let client = harness.client();

    let before = client.fetch_query(&Query::table("Table1")).await.unwrap();
    let error = client
        .apply_actions(&[
            table1_rows(vec![100]),
            DocAction::from_json(&json!(["BulkRemoveRecord", "Missing", [1]])).unwrap(),
        ])
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::Store(_)));

    let after = client.fetch_query(&Query::table("Table1")).await.unwrap();
    assert_eq!(after.table_data, before.table_data);
}

/// includePrevious projects the previous row id under the current order.
#[tokio::test]
async fn test_include_previous_over_the_wire() {
    let harness = TestHarness::start().await;
    harness.seed_table1(4).await.unwrap();
    let client = harness.client();

    let query = Query {
        sort: Some(vec!["id".into()]),
        include_previous: true,
        ..Query::table("Table1")
    };
    let result = client.fetch_query(&query).await.unwrap();
    assert_eq!(result.table_data.id, vec![1, 2, 3, 4]);
    assert_eq!(
        result.table_data.col("_grist_Previous").unwrap(),
        &vec![
            CellValue::Null,
            CellValue::Int(1),
            CellValue::Int(2),
            CellValue::Int(3)
        ]
    );
}
