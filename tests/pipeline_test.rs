use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tempfile::tempdir;

use siphon::{MemoryDestination, Pipeline, Resource, Source, WriteDisposition};

fn order_rows() -> Vec<serde_json::Value> {
    vec![
        json!({
            "id": 1,
            "customer": {"name": "Ada", "city": "Seattle"},
            "items": [{"sku": "a", "qty": 2}, {"sku": "b", "qty": 1}],
            "placed_at": "2024-06-01T12:00:00Z",
        }),
        json!({
            "id": 2,
            "customer": {"name": "Grace", "city": "Portland"},
            "items": [{"sku": "c", "qty": 5}],
            "placed_at": "2024-06-02T08:30:00Z",
        }),
    ]
}

#[tokio::test]
async fn full_run_flattens_and_loads_nested_data() -> Result<()> {
    let dir = tempdir()?;
    let destination = Arc::new(MemoryDestination::new());
    let pipeline = Pipeline::new("orders", dir.path(), destination.clone())?;

    let source = Source::new("shop").resource(Resource::new("orders", order_rows()))?;
    let info = pipeline.run(source).await?;

    assert!(info.is_success());
    assert_eq!(info.table_rows["orders"], 2);
    assert_eq!(info.table_rows["orders__items"], 3);

    let orders = destination.rows("orders");
    assert_eq!(orders[0]["customer__name"], json!("Ada"));
    assert_eq!(orders[0]["_siphon_load_id"], json!(info.load_id));

    let items = destination.rows("orders__items");
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["_siphon_parent_id"], orders[0]["_siphon_id"]);
    assert_eq!(items[0]["_siphon_list_idx"], json!(0));

    // the package was archived and the load recorded
    assert!(pipeline.storage().pending_packages()?.is_empty());
    assert_eq!(destination.completed_loads().len(), 1);

    // schema knows the inferred timestamp type
    let schema = pipeline.schema()?;
    assert_eq!(
        schema.table("orders").unwrap().columns["placed_at"]
            .data_type
            .as_str(),
        "timestamp"
    );
    assert_eq!(
        schema.table("orders__items").unwrap().parent.as_deref(),
        Some("orders")
    );
    Ok(())
}

#[tokio::test]
async fn derived_resource_loads_alongside_parent() -> Result<()> {
    let dir = tempdir()?;
    let destination = Arc::new(MemoryDestination::new());
    let pipeline = Pipeline::new("users", dir.path(), destination.clone())?;

    let source = Source::new("crm")
        .resource(Resource::new(
            "users",
            vec![json!({"id": 1, "name": "Ada"}), json!({"id": 2, "name": "Grace"})],
        ))?
        .resource(Resource::derived("user_emails", "users", |user| {
            let id = user["id"].as_i64().unwrap_or_default();
            vec![json!({"user_id": id, "email": format!("u{}@example.com", id)})]
        }))?;

    let info = pipeline.run(source).await?;
    assert_eq!(info.table_rows["users"], 2);
    assert_eq!(info.table_rows["user_emails"], 2);
    assert_eq!(
        destination.rows("user_emails")[0]["email"],
        json!("u1@example.com")
    );
    Ok(())
}

#[tokio::test]
async fn append_accumulates_and_replace_overwrites_across_runs() -> Result<()> {
    let dir = tempdir()?;
    let destination = Arc::new(MemoryDestination::new());
    let pipeline = Pipeline::new("events", dir.path(), destination.clone())?;

    for run in 0..2 {
        let source = Source::new("feed")
            .resource(Resource::new(
                "log",
                vec![json!({"run": run, "kind": "log"})],
            ))?
            .resource(
                Resource::new("latest", vec![json!({"run": run, "kind": "latest"})])
                    .write_disposition(WriteDisposition::Replace),
            )?;
        let info = pipeline.run(source).await?;
        assert!(info.is_success());
    }

    assert_eq!(destination.rows("log").len(), 2);
    let latest = destination.rows("latest");
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0]["run"], json!(1));
    Ok(())
}

#[tokio::test]
async fn schema_evolves_when_new_columns_appear() -> Result<()> {
    let dir = tempdir()?;
    let destination = Arc::new(MemoryDestination::new());
    let pipeline = Pipeline::new("evolve", dir.path(), destination.clone())?;

    let source = Source::new("s").resource(Resource::new("t", vec![json!({"a": 1})]))?;
    pipeline.run(source).await?;
    let v1 = pipeline.schema()?.version;

    let source = Source::new("s").resource(Resource::new("t", vec![json!({"a": 2, "b": "x"})]))?;
    pipeline.run(source).await?;
    let schema = pipeline.schema()?;
    assert_eq!(schema.version, v1 + 1);
    assert!(schema.table("t").unwrap().columns.contains_key("b"));

    // both schema versions were pushed to the destination
    assert_eq!(destination.stored_schema_hashes().len(), 2);
    Ok(())
}

#[tokio::test]
async fn pending_package_survives_restart_and_resumes() -> Result<()> {
    let dir = tempdir()?;
    let destination = Arc::new(MemoryDestination::new());

    // first pipeline instance extracts and normalizes but never loads
    let load_id = {
        let pipeline = Pipeline::new("resume", dir.path(), destination.clone())?;
        let source =
            Source::new("s").resource(Resource::new("t", vec![json!({"id": 1})]))?;
        let extract_info = pipeline.extract(source)?;
        pipeline.normalize(&extract_info.load_id)?;
        extract_info.load_id
    };

    // a fresh instance over the same working dir picks the package up
    let pipeline = Pipeline::new("resume", dir.path(), destination.clone())?;
    assert_eq!(pipeline.storage().pending_packages()?, vec![load_id.clone()]);
    let infos = pipeline.load_pending().await?;
    assert_eq!(infos.len(), 1);
    assert!(infos[0].is_success());
    assert_eq!(destination.rows("t").len(), 1);
    assert_eq!(pipeline.storage().archived_packages()?, vec![load_id]);
    Ok(())
}
