mod common;

use redshift_config::shared::SchemaMappingEntry;
use redshift_loader::naming::TableName;
use serde_json::json;

use common::*;

#[tokio::test(flavor = "multi_thread")]
async fn replaying_a_batch_leaves_the_table_unchanged() {
    let target = TestTarget::new(|_| {});
    let lines = [
        schema("users", id_title_properties(), &["id"]),
        record("users", json!({"id": 1, "title": "a"})),
        record("users", json!({"id": 2, "title": "b"})),
        state(json!({"bookmark": 1})),
    ];

    let first = target.run(&lines).await;
    first.result.unwrap();
    let after_first = target.table("users").await;

    let second = target.run(&lines).await;
    second.result.unwrap();
    let after_second = target.table("users").await;

    assert_eq!(after_first.records(), after_second.records());
    assert_eq!(after_second.rows.len(), 2);
    assert_eq!(first.states, second.states);
    assert_eq!(target.warehouse.schema_changes().await.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn hard_delete_removes_rows_marked_as_deleted() {
    let target = TestTarget::new(|config| {
        config.hard_delete = true;
        config.batch.max_rows = 2;
    });

    let output = target
        .run(&[
            schema("users", id_title_properties(), &["id"]),
            record("users", json!({"id": 1, "title": "a"})),
            record("users", json!({"id": 2, "title": "b"})),
            record(
                "users",
                json!({"id": 1, "_sdc_deleted_at": "2024-01-01T00:00:00Z"}),
            ),
            record("users", json!({"id": 3, "title": "c"})),
        ])
        .await;

    let summary = output.result.unwrap();
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.rows_loaded, 3);

    let users = target.table("users").await;
    assert_eq!(sorted_values(&users, "id"), vec![text("2"), text("3")]);
    assert!(
        users
            .columns
            .iter()
            .any(|column| column.name == "_sdc_batched_at")
    );
    assert!(
        users
            .column_values("_sdc_batched_at")
            .iter()
            .all(Option::is_some)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn skip_updates_keeps_existing_rows() {
    let target = TestTarget::new(|config| {
        config.skip_updates = true;
        config.batch.max_rows = 1;
    });

    let output = target
        .run(&[
            schema("users", id_title_properties(), &["id"]),
            record("users", json!({"id": 1, "title": "a"})),
            record("users", json!({"id": 1, "title": "b"})),
            record("users", json!({"id": 2, "title": "c"})),
        ])
        .await;

    let summary = output.result.unwrap();
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.rows_loaded, 2);

    let users = target.table("users").await;
    assert_eq!(sorted_values(&users, "title"), vec![text("a"), text("c")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn activating_a_version_replaces_the_table() {
    let target = TestTarget::new(|_| {});

    let output = target
        .run(&[
            schema("users", id_title_properties(), &["id"]),
            versioned_record("users", 1, json!({"id": 1, "title": "a"})),
            versioned_record("users", 1, json!({"id": 2, "title": "b"})),
            activate_version("users", 1),
            state(json!({"bookmark": 1})),
            versioned_record("users", 2, json!({"id": 3, "title": "c"})),
            activate_version("users", 2),
            state(json!({"bookmark": 2})),
        ])
        .await;

    output.result.unwrap();
    assert_eq!(
        output.states,
        vec![r#"{"bookmark":1}"#, r#"{"bookmark":2}"#]
    );

    assert_eq!(target.warehouse.table_names().await, vec![table("users")]);
    let users = target.table("users").await;
    assert_eq!(users.column_values("id"), vec![text("3")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn activating_a_version_without_records_keeps_the_table() {
    let target = TestTarget::new(|_| {});

    let output = target
        .run(&[
            schema("users", id_title_properties(), &["id"]),
            versioned_record("users", 1, json!({"id": 1, "title": "a"})),
            activate_version("users", 1),
            activate_version("users", 1),
            activate_version("users", 2),
            state(json!({"bookmark": 1})),
        ])
        .await;

    output.result.unwrap();
    assert_eq!(output.states, vec![r#"{"bookmark":1}"#]);
    assert_eq!(target.warehouse.table_names().await, vec![table("users")]);
    assert_eq!(
        target.table("users").await.column_values("id"),
        vec![text("1")]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn streams_land_in_mapped_schemas_with_grants() {
    let target = TestTarget::new(|config| {
        config.schema_mapping.insert(
            "crm".to_string(),
            SchemaMappingEntry {
                target_schema: "sales".to_string(),
                select_permissions: vec!["analysts".to_string()],
            },
        );
        config.default_select_permissions = vec!["readers".to_string()];
    });

    let output = target
        .run(&[
            schema("crm-contacts", id_title_properties(), &["id"]),
            record("crm-contacts", json!({"id": 1, "title": "a"})),
            schema("events", json!({"seq": {"type": "integer"}}), &[]),
            record("events", json!({"seq": 1})),
        ])
        .await;
    output.result.unwrap();

    let contacts = target
        .warehouse
        .table(&TableName::new("sales", "contacts"))
        .await
        .unwrap();
    assert_eq!(contacts.rows.len(), 1);
    assert_eq!(contacts.grants, vec!["analysts".to_string()]);

    let events = target.table("events").await;
    assert_eq!(events.grants, vec!["readers".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn nested_objects_are_flattened_into_columns() {
    let target = TestTarget::new(|config| config.data_flattening_max_level = 1);

    let output = target
        .run(&[
            schema(
                "users",
                json!({
                    "id": {"type": "integer"},
                    "address": {
                        "type": ["null", "object"],
                        "properties": {"city": {"type": ["null", "string"]}}
                    }
                }),
                &["id"],
            ),
            record("users", json!({"id": 1, "address": {"city": "Oslo"}})),
        ])
        .await;
    output.result.unwrap();

    let users = target.table("users").await;
    assert_eq!(users.column_values("address__city"), vec![text("Oslo")]);
}
