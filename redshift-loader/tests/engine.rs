mod common;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use redshift_loader::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use redshift_loader::engine::Engine;
use redshift_loader::error::ErrorKind;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};

use common::*;

/// Input that never ends: once read, it requests shutdown and stays pending.
struct ShutdownWhenIdle(ShutdownTx);

impl AsyncRead for ShutdownWhenIdle {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.0.shutdown();
        Poll::Pending
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn records_load_only_the_columns_of_the_registered_schema() {
    let target = TestTarget::new(|_| {});

    let output = target
        .run(&[
            schema("users", id_title_properties(), &["id"]),
            record("users", json!({"id": 1, "title": "a", "undeclared": 5})),
            record("users", json!({"id": 2})),
        ])
        .await;

    let summary = output.result.unwrap();
    assert_eq!(summary.records, 2);
    assert_eq!(summary.rows_loaded, 2);

    let users = target.table("users").await;
    let columns = users
        .columns
        .iter()
        .map(|column| column.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(columns, vec!["id", "title"]);
    assert_eq!(users.primary_keys, vec!["id".to_string()]);
    assert_eq!(sorted_values(&users, "title"), vec![None, text("a")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn last_record_wins_for_a_primary_key_within_a_batch() {
    let target = TestTarget::new(|_| {});

    let output = target
        .run(&[
            schema("users", id_title_properties(), &["id"]),
            record("users", json!({"id": 1, "title": "a"})),
            record("users", json!({"id": 1, "title": "b"})),
        ])
        .await;

    assert_eq!(output.result.unwrap().rows_loaded, 1);

    let users = target.table("users").await;
    assert_eq!(users.rows.len(), 1);
    assert_eq!(users.column_values("id"), vec![text("1")]);
    assert_eq!(users.column_values("title"), vec![text("b")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_without_primary_key_append_every_record() {
    let target = TestTarget::new(|config| config.batch.max_rows = 100);

    let mut lines = vec![schema(
        "events",
        json!({"seq": {"type": "integer"}}),
        &[],
    )];
    lines.extend((0..200).map(|seq| record("events", json!({"seq": seq}))));

    let summary = target.run(&lines).await.result.unwrap();

    assert_eq!(summary.batches, 2);
    assert_eq!(summary.rows_loaded, 200);
    assert_eq!(target.table("events").await.rows.len(), 200);
    assert_eq!(
        target.warehouse.loads().await,
        vec![(table("events"), 100), (table("events"), 100)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn record_for_unregistered_stream_aborts_without_later_checkpoints() {
    let target = TestTarget::new(|config| config.batch.max_rows = 1);

    let output = target
        .run(&[
            schema("users", id_title_properties(), &["id"]),
            record("users", json!({"id": 1, "title": "a"})),
            state(json!({"bookmark": 1})),
            record("orders", json!({"id": 7})),
            state(json!({"bookmark": 2})),
        ])
        .await;

    let err = output.result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownStream);
    assert!(
        output
            .states
            .iter()
            .all(|state| state == r#"{"bookmark":1}"#)
    );
    assert!(target.warehouse.table(&table("orders")).await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoints_are_emitted_in_arrival_order() {
    let target = TestTarget::new(|config| config.batch.max_rows = 1);

    let output = target
        .run(&[
            state(json!({"bookmark": 1})),
            schema("users", id_title_properties(), &["id"]),
            schema("events", json!({"seq": {"type": "integer"}}), &[]),
            record("users", json!({"id": 1, "title": "a"})),
            state(json!({"bookmark": 2})),
            record("events", json!({"seq": 1})),
            record("users", json!({"id": 2, "title": "b"})),
            state(json!({"bookmark": 3})),
        ])
        .await;

    let summary = output.result.unwrap();
    assert_eq!(summary.checkpoints, 3);
    assert_eq!(
        output.states,
        vec![
            r#"{"bookmark":1}"#,
            r#"{"bookmark":2}"#,
            r#"{"bookmark":3}"#
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoints_are_held_until_their_batches_are_merged() {
    let target = TestTarget::new(|_| {});
    target
        .warehouse
        .fail_next_loads([ErrorKind::WarehouseQueryFailed])
        .await;

    let output = target
        .run(&[
            state(json!({"bookmark": 1})),
            schema("users", id_title_properties(), &["id"]),
            record("users", json!({"id": 1, "title": "a"})),
            state(json!({"bookmark": 2})),
        ])
        .await;

    assert_eq!(output.result.unwrap_err().kind(), ErrorKind::LoadError);
    assert_eq!(output.states, vec![r#"{"bookmark":1}"#]);
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_ceiling_flushes_the_stream_with_most_buffered_bytes() {
    let target = TestTarget::new(|config| {
        config.memory_limit_bytes = 17_000;
        config.keep_staged_objects = true;
    });

    let mut lines = Vec::new();
    for position in 1..=5 {
        let stream = format!("s{position}");
        lines.push(schema(&stream, id_title_properties(), &["id"]));
        lines.push(record(
            &stream,
            json!({"id": 1, "title": "x".repeat(1_000 * position)}),
        ));
    }
    // Pushes the total over the ceiling. `s5` holds more bytes than `s2`.
    lines.push(record("s2", json!({"id": 2, "title": "y".repeat(2_500)})));
    lines.push(record("s5", json!({"id": 2, "title": "z"})));

    let summary = target.run(&lines).await.result.unwrap();
    assert_eq!(summary.batches, 6);

    let s5 = target.staged_keys("s5/").await;
    assert_eq!(s5.len(), 2);
    assert!(s5[0].starts_with("s5/0000000001-5-"));
    assert!(s5[1].starts_with("s5/0000000002-6-"));

    let s2 = target.staged_keys("s2/").await;
    assert_eq!(s2.len(), 1);
    assert!(s2[0].starts_with("s2/0000000001-2-"));
    assert_eq!(target.table("s2").await.rows.len(), 2);

    for stream in ["s1/", "s3/", "s4/"] {
        assert_eq!(target.staged_keys(stream).await.len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn blank_lines_are_skipped() {
    let target = TestTarget::new(|_| {});

    let output = target
        .run(&[
            schema("users", id_title_properties(), &["id"]),
            String::new(),
            record("users", json!({"id": 1})),
            "   ".to_string(),
            state(json!({"bookmark": 1})),
        ])
        .await;

    let summary = output.result.unwrap();
    assert_eq!(summary.messages, 3);
    assert_eq!(output.states, vec![r#"{"bookmark":1}"#]);
}

#[tokio::test(flavor = "multi_thread")]
async fn null_states_are_accepted_but_not_forwarded() {
    let target = TestTarget::new(|_| {});

    let output = target
        .run(&[
            schema("users", id_title_properties(), &["id"]),
            record("users", json!({"id": 1})),
            r#"{"type":"STATE","value":null}"#.to_string(),
            state(json!({"bookmark": 1})),
            r#"{"type":"STATE","value":null}"#.to_string(),
        ])
        .await;

    let summary = output.result.unwrap();
    assert_eq!(summary.messages, 5);
    assert_eq!(summary.checkpoints, 1);
    assert_eq!(output.states, vec![r#"{"bookmark":1}"#]);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_lines_fail_the_run() {
    let target = TestTarget::new(|_| {});

    let output = target
        .run(&[
            schema("users", id_title_properties(), &["id"]),
            "{not json".to_string(),
        ])
        .await;

    assert_eq!(
        output.result.unwrap_err().kind(),
        ErrorKind::MalformedMessage
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_flushes_buffered_records_and_releases_checkpoints() {
    let target = TestTarget::new(|_| {});
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let lines = [
        schema("users", id_title_properties(), &["id"]),
        record("users", json!({"id": 1, "title": "a"})),
        record("users", json!({"id": 2, "title": "b"})),
        state(json!({"bookmark": 1})),
    ];
    let input = format!("{}\n", lines.join("\n"));
    let input = BufReader::new(input.as_bytes().chain(ShutdownWhenIdle(shutdown_tx)));

    let mut output = Vec::new();
    let summary = Engine::new(target.context(), shutdown_rx)
        .run(input, &mut output)
        .await
        .unwrap();

    assert_eq!(summary.records, 2);
    assert_eq!(summary.batches, 1);
    assert_eq!(String::from_utf8(output).unwrap(), "{\"bookmark\":1}\n");
    assert_eq!(target.table("users").await.rows.len(), 2);
}
