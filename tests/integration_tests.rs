use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use parquedb::config::ParqueDbConfig;
use parquedb::error::{EventErrorKind, ParqueError, QueryErrorKind};
use parquedb::query::QueryOptions;
use parquedb::relationship::RelationDef;
use parquedb::{GetOptions, ParqueDb};
use serde_json::json;
use tempfile::TempDir;

/// Database fixture rooted in a temp directory.
async fn open_db(dir: &TempDir) -> ParqueDb {
    let mut config = ParqueDbConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    ParqueDb::open_in_memory(config).await.unwrap()
}

fn posts_author_relation() -> RelationDef {
    RelationDef {
        source_ns: "posts".to_string(),
        name: "author".to_string(),
        target_ns: "authors".to_string(),
        inverse: "posts".to_string(),
        singular: true,
    }
}

#[tokio::test]
async fn test_document_lifecycle() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let created = db
        .create("posts", "p1", json!({"$type": "Post", "title": "hello"}), None)
        .await
        .unwrap();
    assert_eq!(created.version, 1);
    assert_eq!(created.entity_type, "Post");

    let updated = db
        .update("posts", "p1", json!({"$set": {"title": "world"}}), None, None)
        .await
        .unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.fields["title"], json!("world"));

    let doc = db.get("posts", "p1", &GetOptions::default()).await.unwrap();
    assert_eq!(doc["title"], json!("world"));
    assert_eq!(doc["version"], json!(2));

    db.delete("posts", "p1", None, None, false).await.unwrap();
    assert!(db.get("posts", "p1", &GetOptions::default()).await.is_err());

    // Soft-deleted documents stay readable on opt-in.
    let doc = db
        .get(
            "posts",
            "p1",
            &GetOptions {
                include_deleted: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(doc["version"], json!(3));
    assert!(doc["deletedAt"].is_string());
}

#[tokio::test]
async fn test_create_existing_rejected() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.create("posts", "p1", json!({"a": 1}), None).await.unwrap();
    let err = db.create("posts", "p1", json!({"a": 2}), None).await.unwrap_err();
    assert!(matches!(err, ParqueError::Validation { .. }));
}

#[tokio::test]
async fn test_version_conflict_scenario() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.create("posts", "p1", json!({"title": "t"}), None)
        .await
        .unwrap();

    let err = db
        .update(
            "posts",
            "p1",
            json!({"$set": {"title": "u"}}),
            Some(999),
            None,
        )
        .await
        .unwrap_err();

    match err {
        ParqueError::VersionConflict {
            expected,
            actual,
            ns,
            id,
        } => {
            assert_eq!(expected, 999);
            assert_eq!(actual, Some(1));
            assert_eq!(ns, "posts");
            assert_eq!(id, "p1");
        }
        other => panic!("expected version conflict, got {other:?}"),
    }

    // The matching expectation goes through.
    let entity = db
        .update("posts", "p1", json!({"$set": {"title": "u"}}), Some(1), None)
        .await
        .unwrap();
    assert_eq!(entity.version, 2);
}

#[tokio::test]
async fn test_early_termination_over_compacted_segments() {
    let dir = TempDir::new().unwrap();
    let mut config = ParqueDbConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.storage.row_group_size = 1000;
    config.compaction.window_size = 10_000;
    config.snapshot.auto_snapshot = false;
    let db = ParqueDb::open_in_memory(config).await.unwrap();

    for i in 0..10_000 {
        db.create("posts", &format!("p{i:05}"), json!({"n": i}), None)
            .await
            .unwrap();
    }
    assert!(db.compact().await.unwrap() >= 1);

    let page = db
        .find(
            "posts",
            &json!({}),
            QueryOptions {
                limit: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(page.items.len(), 1);
    assert!(page.stats.used_early_termination);
    assert!(page.has_more);
    // At most the first concurrency batch of row groups is read.
    assert!(
        page.stats.rows_scanned <= 4000,
        "scanned {} rows",
        page.stats.rows_scanned
    );
}

#[tokio::test]
async fn test_pagination_continuity() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    for i in 0..100 {
        db.create("posts", &format!("p{i:03}"), json!({"n": i}), None)
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = db
            .find(
                "posts",
                &json!({}),
                QueryOptions {
                    limit: Some(3),
                    cursor: cursor.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        for item in &page.items {
            seen.push(item["$id"].as_str().unwrap().to_string());
        }
        if !page.has_more {
            assert!(page.next_cursor.is_none());
            break;
        }
        cursor = page.next_cursor.clone();
    }

    // Concatenation of pages equals the full collection, pages disjoint.
    assert_eq!(seen.len(), 100);
    let mut dedup = seen.clone();
    dedup.sort();
    dedup.dedup();
    assert_eq!(dedup.len(), 100);
}

#[tokio::test]
async fn test_changing_sort_between_pages_rejected() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    for i in 0..10 {
        db.create("posts", &format!("p{i}"), json!({"n": i}), None)
            .await
            .unwrap();
    }

    let page = db
        .find(
            "posts",
            &json!({}),
            QueryOptions {
                limit: Some(3),
                sort: vec![parquedb::cursor::SortKey {
                    field: "n".to_string(),
                    direction: 1,
                }],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let cursor = page.next_cursor.unwrap();

    let err = db
        .find(
            "posts",
            &json!({}),
            QueryOptions {
                limit: Some(3),
                cursor: Some(cursor),
                sort: vec![parquedb::cursor::SortKey {
                    field: "n".to_string(),
                    direction: -1,
                }],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ParqueError::Query {
            kind: QueryErrorKind::InvalidCursor,
            ..
        }
    ));
}

#[tokio::test]
async fn test_reverse_relation_scenario() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    db.declare_relation(posts_author_relation());

    db.create("authors", "a1", json!({"name": "Ada"}), None)
        .await
        .unwrap();
    for i in 0..100 {
        db.create("posts", &format!("p{i:03}"), json!({"n": i}), None)
            .await
            .unwrap();
        db.update(
            "posts",
            &format!("p{i:03}"),
            json!({"$link": {"author": "a1"}}),
            None,
            None,
        )
        .await
        .unwrap();
    }

    let started = Instant::now();
    let page = db
        .get_related("authors", "a1", "posts", &json!({}), QueryOptions::default())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(page.total, 100);
    assert_eq!(page.items.len(), 100);
    assert!(
        elapsed.as_millis() < 500,
        "reverse lookup took {elapsed:?}"
    );
}

#[tokio::test]
async fn test_link_unlink_and_hard_delete_edges() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    db.declare_relation(posts_author_relation());

    db.create("authors", "a1", json!({}), None).await.unwrap();
    db.create("posts", "p1", json!({}), None).await.unwrap();
    db.update("posts", "p1", json!({"$link": {"author": "a1"}}), None, None)
        .await
        .unwrap();

    let related = db
        .get_related("authors", "a1", "posts", &json!({}), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(related.total, 1);

    db.update(
        "posts",
        "p1",
        json!({"$unlink": {"author": "$all"}}),
        None,
        None,
    )
    .await
    .unwrap();
    let related = db
        .get_related("authors", "a1", "posts", &json!({}), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(related.total, 0);

    // Re-link, then hard delete the source: the edge disappears again.
    db.update("posts", "p1", json!({"$link": {"author": "a1"}}), None, None)
        .await
        .unwrap();
    db.delete("posts", "p1", None, None, true).await.unwrap();
    let related = db
        .get_related("authors", "a1", "posts", &json!({}), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(related.total, 0);
}

#[tokio::test]
async fn test_link_to_missing_or_deleted_target() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    db.declare_relation(posts_author_relation());
    db.create("posts", "p1", json!({}), None).await.unwrap();

    let err = db
        .update("posts", "p1", json!({"$link": {"author": "ghost"}}), None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ParqueError::Relationship {
            kind: parquedb::error::RelationshipErrorKind::TargetMissing,
            ..
        }
    ));

    db.create("authors", "a1", json!({}), None).await.unwrap();
    db.delete("authors", "a1", None, None, false).await.unwrap();
    let err = db
        .update("posts", "p1", json!({"$link": {"author": "a1"}}), None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ParqueError::Relationship {
            kind: parquedb::error::RelationshipErrorKind::TargetDeleted,
            ..
        }
    ));
}

#[tokio::test]
async fn test_fts_excluded_phrase_scenario() {
    let dir = TempDir::new().unwrap();
    let mut config = ParqueDbConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.fts.filter_stopwords = false;
    let db = ParqueDb::open_in_memory(config).await.unwrap();

    db.register_text_index("docs", vec!["title".to_string()])
        .await
        .unwrap();
    db.create("docs", "doc1", json!({"title": "Database Systems"}), None)
        .await
        .unwrap();
    db.create("docs", "doc2", json!({"title": "Database Management"}), None)
        .await
        .unwrap();
    db.create("docs", "doc3", json!({"title": "Web Systems"}), None)
        .await
        .unwrap();

    let page = db
        .find(
            "docs",
            &json!({"$text": "database -\"database systems\""}),
            QueryOptions::default(),
        )
        .await
        .unwrap();
    let ids: Vec<&str> = page
        .items
        .iter()
        .map(|i| i["$id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["docs/doc2"]);
}

#[tokio::test]
async fn test_text_fallback_without_index() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.create("docs", "d1", json!({"body": "columnar storage engine"}), None)
        .await
        .unwrap();
    db.create("docs", "d2", json!({"body": "row oriented store"}), None)
        .await
        .unwrap();

    // No registered index: the deterministic linear-scan fallback applies.
    let page = db
        .find("docs", &json!({"$text": "columnar"}), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0]["$id"], json!("docs/d1"));
}

#[tokio::test]
async fn test_time_travel_on_deleted_scenario() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    let before_create = Utc::now() - Duration::seconds(60);
    db.create("posts", "p1", json!({"title": "t"}), None)
        .await
        .unwrap();
    db.delete("posts", "p1", None, None, false).await.unwrap();

    let err = db
        .revert_to("posts", "p1", before_create)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ParqueError::Event {
            kind: EventErrorKind::DidNotExist,
            ..
        }
    ));

    let err = db
        .revert_to("posts", "p1", Utc::now() + Duration::seconds(3600))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ParqueError::Event {
            kind: EventErrorKind::FutureTime,
            ..
        }
    ));
}

#[tokio::test]
async fn test_time_travel_reads_old_state() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.create("posts", "p1", json!({"title": "v1"}), None)
        .await
        .unwrap();
    let after_create = Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    db.update("posts", "p1", json!({"$set": {"title": "v2"}}), None, None)
        .await
        .unwrap();

    let old = db.revert_to("posts", "p1", after_create).await.unwrap();
    assert_eq!(old.fields["title"], json!("v1"));
    assert_eq!(old.version, 1);

    let current = db.get("posts", "p1", &GetOptions::default()).await.unwrap();
    assert_eq!(current["title"], json!("v2"));
}

#[tokio::test]
async fn test_double_set_bumps_version_only() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.create("posts", "p1", json!({"title": "t"}), None)
        .await
        .unwrap();
    let first = db
        .update("posts", "p1", json!({"$set": {"title": "same"}}), None, None)
        .await
        .unwrap();
    let second = db
        .update("posts", "p1", json!({"$set": {"title": "same"}}), None, None)
        .await
        .unwrap();

    assert_eq!(second.version, first.version + 1);
    assert_eq!(first.fields, second.fields);
    assert!(second.updated_at >= first.updated_at);
}

#[tokio::test]
async fn test_commit_branch_diff() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.create("posts", "p1", json!({"title": "a"}), None)
        .await
        .unwrap();
    let first = db.commit("main", "initial", "ada").await.unwrap();

    db.create("users", "u1", json!({"name": "Ada"}), None)
        .await
        .unwrap();
    db.update("posts", "p1", json!({"$set": {"title": "b"}}), None, None)
        .await
        .unwrap();
    let second = db.commit("main", "more data", "ada").await.unwrap();

    assert_eq!(second.parents, vec![first.hash.clone()]);
    assert_eq!(db.branch_head("main").await.unwrap(), Some(second.hash.clone()));

    let log = db.log_commits("main", 10).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].message, "more data");

    let diff = db.diff_commits(&first.hash, &second.hash).await.unwrap();
    assert_eq!(diff.added, vec!["users"]);
    assert!(diff.removed.is_empty());
    assert_eq!(diff.modified, vec!["posts"]);
}

#[tokio::test]
async fn test_compaction_then_query_merges_live_tail() {
    let dir = TempDir::new().unwrap();
    let mut config = ParqueDbConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.compaction.window_size = 50;
    let db = ParqueDb::open_in_memory(config).await.unwrap();

    for i in 0..50 {
        db.create("posts", &format!("p{i:02}"), json!({"n": i}), None)
            .await
            .unwrap();
    }
    db.compact().await.unwrap();

    // Mutate a compacted row and add a fresh one after compaction.
    db.update("posts", "p10", json!({"$set": {"n": 777}}), None, None)
        .await
        .unwrap();
    db.create("posts", "p99", json!({"n": 99}), None).await.unwrap();

    let count = db.count("posts", &json!({}), false).await.unwrap();
    assert_eq!(count, 51);

    let page = db
        .find("posts", &json!({"n": 777}), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0]["$id"], json!("posts/p10"));

    let page = db
        .find("posts", &json!({"n": 99}), QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
}

#[tokio::test]
async fn test_event_log_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir).await;
        db.create("posts", "p1", json!({"title": "durable"}), None)
            .await
            .unwrap();
        db.flush().await.unwrap();
        db.shutdown().await.unwrap();
    }

    let db = open_db(&dir).await;
    let doc = db.get("posts", "p1", &GetOptions::default()).await.unwrap();
    assert_eq!(doc["title"], json!("durable"));
}

#[tokio::test]
async fn test_export_import_round_trip() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    for i in 0..10 {
        db.create("posts", &format!("p{i}"), json!({"$type": "Post", "n": i}), None)
            .await
            .unwrap();
    }

    let bytes = db.export_parquet("posts").await.unwrap();

    let dir2 = TempDir::new().unwrap();
    let db2 = open_db(&dir2).await;
    let imported = db2.import_parquet(&bytes).await.unwrap();
    assert_eq!(imported, 10);

    for i in 0..10 {
        let doc = db2
            .get("posts", &format!("p{i}"), &GetOptions::default())
            .await
            .unwrap();
        assert_eq!(doc["n"], json!(i));
        assert_eq!(doc["$type"], json!("Post"));
    }
}

#[tokio::test]
async fn test_hydration_depth_one() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;
    db.declare_relation(posts_author_relation());

    db.create("authors", "a1", json!({"name": "Ada"}), None)
        .await
        .unwrap();
    db.create("posts", "p1", json!({"title": "t"}), None)
        .await
        .unwrap();
    db.update("posts", "p1", json!({"$link": {"author": "a1"}}), None, None)
        .await
        .unwrap();

    // depth 0: raw ids.
    let raw = db.get("posts", "p1", &GetOptions::default()).await.unwrap();
    assert_eq!(raw["author"], json!("a1"));

    // depth 1: outbound hydrated, inbound listed on the target.
    let hydrated = db
        .get(
            "posts",
            "p1",
            &GetOptions {
                depth: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hydrated["author"]["name"], json!("Ada"));

    let author = db
        .get(
            "authors",
            "a1",
            &GetOptions {
                depth: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(author["posts"]["total"], json!(1));
    assert_eq!(author["posts"]["items"], json!(["posts/p1"]));
}

#[tokio::test]
async fn test_vacuum_reports_and_respects_retention() {
    let dir = TempDir::new().unwrap();
    let mut config = ParqueDbConfig::default();
    config.storage.data_dir = dir.path().to_path_buf();
    config.compaction.window_size = 10;
    let db = ParqueDb::open_in_memory(config).await.unwrap();

    for i in 0..10 {
        db.create("posts", &format!("p{i}"), json!({"n": i}), None)
            .await
            .unwrap();
    }
    db.compact().await.unwrap();

    // Everything referenced, nothing to reclaim.
    let report = db.vacuum(true).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(report.orphans_found, 0);
    assert_eq!(report.files_deleted, 0);
    assert!(report.files_scanned >= 1);
}

#[tokio::test]
async fn test_stats_and_metrics_surface() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir).await;

    db.create("posts", "p1", json!({"title": "t"}), None)
        .await
        .unwrap();
    db.find("posts", &json!({}), QueryOptions::default())
        .await
        .unwrap();

    let stats = db.stats();
    assert!(stats.namespaces.contains(&"posts".to_string()));
    assert_eq!(stats.event_log.total_appended, 1);

    let metrics = db.metrics_text();
    assert!(metrics.contains("parquedb_events_appended_total 1"));
    assert!(metrics.contains("parquedb_queries_total"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_during_writes() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(open_db(&dir).await);

    for i in 0..20 {
        db.create("posts", &format!("p{i:02}"), json!({"n": i}), None)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..4 {
        let db = Arc::clone(&db);
        handles.push(tokio::spawn(async move {
            for round in 0..10 {
                if worker == 0 {
                    db.update(
                        "posts",
                        &format!("p{:02}", round % 20),
                        json!({"$inc": {"touched": 1}}),
                        None,
                        None,
                    )
                    .await
                    .unwrap();
                } else {
                    let page = db
                        .find("posts", &json!({}), QueryOptions::default())
                        .await
                        .unwrap();
                    assert_eq!(page.items.len(), 20);
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}
