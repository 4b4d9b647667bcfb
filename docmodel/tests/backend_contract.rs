//! Behavioral contract shared by both storage backends.
//!
//! Every test here runs against the in-memory document store and the SQLite
//! emulation and expects identical observable behavior: same validation
//! failures, same operation semantics, same numeric results from
//! aggregation.

use std::sync::Arc;

use bson::{bson, doc, Bson};
use docmodel::memory::MemoryStore;
use docmodel::prelude::*;
use docmodel::sqlite::SqliteStore;

fn backends() -> Vec<(&'static str, DynBackend)> {
    vec![
        ("memory", Arc::new(MemoryStore::new()) as DynBackend),
        ("sqlite", Arc::new(SqliteStore::in_memory().unwrap()) as DynBackend),
    ]
}

fn guild_schema() -> Schema {
    Schema::builder()
        .field("name", Definition::string())
        .field("level", Definition::int().with_default(1))
        .field("score", Definition::float())
        .field("joined", Definition::datetime())
        .field("tags", Definition::array(Definition::string()))
        .field(
            "roles",
            Definition::array(Definition::object([
                ("id", Definition::string()),
                ("title", Definition::string()),
                ("rank", Definition::int()),
            ])),
        )
        .build()
}

async fn bound_model(backend: DynBackend) -> Model {
    Model::bind(backend, "guilds", guild_schema()).await.unwrap()
}

fn joined_at() -> bson::DateTime {
    bson::DateTime::from_chrono(
        chrono::DateTime::parse_from_rfc3339("2024-05-17T12:30:45.000Z").unwrap(),
    )
}

#[tokio::test]
async fn create_then_lookup_round_trips_the_declared_shape() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;
        let created = model
            .create(doc! {
                "name": "alpha",
                "level": 3_i32,
                "score": 4,
                "joined": joined_at(),
                "tags": ["eu"],
                "roles": [{ "id": "r1", "title": "admin", "rank": 1 }],
            })
            .await
            .unwrap();

        // Force a real backend read.
        model.drop_from_cache(created.id()).await;
        let found = model
            .find_one_by_object_id(created.id())
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{label}: document not found"));

        // Numeric widths normalized at validation, stable through storage.
        let object = found.to_object();
        assert!(!object.contains_key("_id"), "{label}");
        assert_eq!(object.get("name").unwrap(), &bson!("alpha"), "{label}");
        assert_eq!(object.get("level").unwrap(), &Bson::Int64(3), "{label}");
        assert_eq!(object.get("score").unwrap(), &bson!(4.0), "{label}");
        assert_eq!(object.get("joined").unwrap(), &Bson::DateTime(joined_at()), "{label}");
        assert_eq!(object.get("tags").unwrap(), &bson!(["eu"]), "{label}");
        assert_eq!(
            object.get("roles").unwrap(),
            &bson!([{ "id": "r1", "title": "admin", "rank": 1_i64 }]),
            "{label}: round trip mismatch"
        );
    }
}

#[tokio::test]
async fn find_one_returns_the_live_instance() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;
        let created = model.create(doc! { "name": "alpha" }).await.unwrap();

        let a = model.find_one_by_object_id(created.id()).await.unwrap().unwrap();
        let b = model.find_one(doc! { "name": "alpha" }).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b), "{label}: two finds returned distinct handles");

        // Edits through one handle are visible through the other.
        a.prop("level").unwrap().set(9_i64).unwrap();
        assert_eq!(b.prop("level").unwrap().get().unwrap(), Some(bson!(9_i64)), "{label}");

        model.drop_from_cache(created.id()).await;
        let c = model.find_one_by_object_id(created.id()).await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&a, &c), "{label}: cache drop kept the old handle");
    }
}

#[tokio::test]
async fn missing_id_is_none_not_an_error() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;
        let found = model.find_one_by_object_id("no-such-id").await.unwrap();
        assert!(found.is_none(), "{label}");
    }
}

#[tokio::test]
async fn queued_operations_flush_and_persist() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;
        let guild = model
            .create(doc! { "name": "alpha", "tags": ["seed"] })
            .await
            .unwrap();

        guild.prop("level").unwrap().inc(2_i64).unwrap();
        guild.prop("level").unwrap().inc(3_i64).unwrap();
        guild.prop("tags").unwrap().push("fresh").unwrap();
        guild.prop("tags").unwrap().pull("seed").unwrap();
        guild
            .prop("roles")
            .unwrap()
            .push(doc! { "id": "r1", "title": "admin", "rank": 1_i64 })
            .unwrap();
        guild.save().await.unwrap();

        model.drop_from_cache(guild.id()).await;
        let stored = model.find_one_by_object_id(guild.id()).await.unwrap().unwrap();
        assert_eq!(stored.prop("level").unwrap().get().unwrap(), Some(bson!(6_i64)), "{label}");
        assert_eq!(stored.prop("tags").unwrap().val().unwrap(), bson!(["fresh"]), "{label}");
        assert_eq!(
            stored.prop("roles").unwrap().id("r1").prop("title").unwrap().val().unwrap(),
            bson!("admin"),
            "{label}"
        );
    }
}

#[tokio::test]
async fn pulls_persist_exactly_what_the_caller_observed() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;

        // Both pushes pending: the pull cancels them and nothing flushes.
        let fresh = model.create(doc! { "name": "alpha", "tags": [] }).await.unwrap();
        fresh.prop("tags").unwrap().push("x").unwrap();
        fresh.prop("tags").unwrap().push("x").unwrap();
        fresh.prop("tags").unwrap().pull("x").unwrap();
        assert_eq!(fresh.prop("tags").unwrap().val().unwrap(), bson!([]), "{label}");
        fresh.save().await.unwrap();

        // One copy already stored: the pull must reach the backend.
        let seeded = model.create(doc! { "name": "beta", "tags": ["x"] }).await.unwrap();
        seeded.prop("tags").unwrap().push("x").unwrap();
        seeded.prop("tags").unwrap().pull("x").unwrap();
        assert_eq!(seeded.prop("tags").unwrap().val().unwrap(), bson!([]), "{label}");
        seeded.save().await.unwrap();

        for doc in [&fresh, &seeded] {
            let id = doc.id().to_string();
            model.drop_from_cache(&id).await;
            let stored = model.find_one_by_object_id(&id).await.unwrap().unwrap();
            assert_eq!(
                stored.prop("tags").unwrap().val().unwrap(),
                bson!([]),
                "{label}: persisted array diverged from the local snapshot"
            );
        }
    }
}

#[tokio::test]
async fn save_republishes_the_saved_handle() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;
        let guild = model.create(doc! { "name": "alpha" }).await.unwrap();

        // An invalidation cleared the slot while this handle stayed live.
        model.drop_from_cache(guild.id()).await;
        guild.prop("level").unwrap().inc(1_i64).unwrap();
        guild.save().await.unwrap();

        let found = model.find_one_by_object_id(guild.id()).await.unwrap().unwrap();
        assert!(
            Arc::ptr_eq(&guild, &found),
            "{label}: lookup after save materialized a second instance"
        );

        // Same guarantee when there was nothing left to flush.
        model.drop_from_cache(guild.id()).await;
        guild.save().await.unwrap();
        let found = model.find_one_by_object_id(guild.id()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&guild, &found), "{label}");
    }
}

#[tokio::test]
async fn identity_lookup_edit_targets_one_element() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;
        let guild = model
            .create(doc! {
                "name": "alpha",
                "roles": [
                    { "id": "r1", "title": "admin", "rank": 1_i64 },
                    { "id": "r2", "title": "mod", "rank": 2_i64 },
                ],
            })
            .await
            .unwrap();

        guild
            .prop_with("roles.$role.rank", &doc! { "role": "r2" })
            .unwrap()
            .inc(5_i64)
            .unwrap();
        guild.save().await.unwrap();

        model.drop_from_cache(guild.id()).await;
        let stored = model.find_one_by_object_id(guild.id()).await.unwrap().unwrap();
        assert_eq!(
            stored.prop("roles").unwrap().val().unwrap(),
            bson!([
                { "id": "r1", "title": "admin", "rank": 1_i64 },
                { "id": "r2", "title": "mod", "rank": 7_i64 },
            ]),
            "{label}"
        );
    }
}

#[tokio::test]
async fn model_update_touches_all_matches() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;
        for (name, level) in [("alpha", 3_i64), ("beta", 7), ("gamma", 5)] {
            model
                .create(doc! { "name": name, "level": level, "tags": [] })
                .await
                .unwrap();
        }

        let touched = model
            .update(
                doc! { "level": { "$gte": 5 } },
                doc! { "$inc": { "level": 1 }, "$push": { "tags": "veteran" } },
            )
            .await
            .unwrap();
        assert_eq!(touched, 2, "{label}");

        let veterans = model
            .find(doc! { "tags": { "$ne": Bson::Null } })
            .unwrap()
            .sort_asc("level")
            .exec()
            .await
            .unwrap();
        let levels: Vec<Bson> = veterans
            .iter()
            .filter(|d| d.prop("tags").unwrap().val().unwrap() == bson!(["veteran"]))
            .map(|d| d.prop("level").unwrap().val().unwrap())
            .collect();
        assert_eq!(levels, vec![bson!(6_i64), bson!(8_i64)], "{label}");
    }
}

#[tokio::test]
async fn cursors_sort_skip_and_limit() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;
        for (name, level) in [("a", 5_i64), ("b", 1), ("c", 4), ("d", 2), ("e", 3)] {
            model.create(doc! { "name": name, "level": level }).await.unwrap();
        }

        let page = model
            .find(doc! {})
            .unwrap()
            .sort_desc("level")
            .skip(1)
            .limit(2)
            .to_array()
            .await
            .unwrap();
        let names: Vec<Bson> = page
            .iter()
            .map(|d| d.prop("name").unwrap().val().unwrap())
            .collect();
        assert_eq!(names, vec![bson!("c"), bson!("e")], "{label}");

        let count = model.find(doc! { "level": { "$gt": 2 } }).unwrap().count().await.unwrap();
        assert_eq!(count, 3, "{label}");
    }
}

#[tokio::test]
async fn aggregation_results_are_backend_identical() {
    let stages = vec![
        doc! { "$match": { "level": { "$gte": 2 } } },
        doc! { "$group": { "_id": "$name", "total": { "$sum": "$level" }, "mean": { "$avg": "$score" } } },
        doc! { "$sort": { "_id": 1 } },
    ];

    let mut outputs = Vec::new();
    for (label, backend) in backends() {
        let model = bound_model(backend).await;
        for (name, level, score) in [
            ("alpha", 3_i64, 1.5),
            ("alpha", 4, 2.5),
            ("beta", 2, 4.0),
            ("beta", 1, 9.0),
        ] {
            model
                .create(doc! { "name": name, "level": level, "score": score })
                .await
                .unwrap();
        }
        outputs.push((label, model.aggregate(&stages).await.unwrap()));
    }

    let expected = vec![
        doc! { "_id": "alpha", "total": 7_i64, "mean": 2.0 },
        doc! { "_id": "beta", "total": 2_i64, "mean": 4.0 },
    ];
    for (label, out) in outputs {
        assert_eq!(out, expected, "{label}");
    }
}

#[tokio::test]
async fn arithmetic_projection_agrees_across_backends() {
    let stages = vec![
        doc! { "$project": { "value": { "$divide": ["$level", 2] } } },
        doc! { "$sort": { "value": 1 } },
    ];

    for (label, backend) in backends() {
        let model = bound_model(backend).await;
        for level in [1_i64, 2, 3] {
            model.create(doc! { "name": "x", "level": level }).await.unwrap();
        }
        let out = model.aggregate(&stages).await.unwrap();
        let values: Vec<&Bson> = out.iter().map(|d| d.get("value").unwrap()).collect();
        // Division is always floating point.
        assert_eq!(values, vec![&bson!(0.5), &bson!(1.0), &bson!(1.5)], "{label}");
    }
}

#[tokio::test]
async fn unsupported_operators_fail_before_any_io() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;

        let err = model.find(doc! { "name": { "$regex": "^a" } }).unwrap_err();
        assert!(
            matches!(err, StoreError::UnsupportedOperator(ref op) if op == "$regex"),
            "{label}: {err:?}"
        );

        let err = model.aggregate(&[doc! { "$unwind": "$tags" }]).await.unwrap_err();
        assert!(
            matches!(err, StoreError::UnsupportedStage(ref s) if s == "$unwind"),
            "{label}: {err:?}"
        );

        let err = model
            .update(doc! {}, doc! { "$rename": { "name": "title" } })
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::UnsupportedOperator(ref op) if op == "$rename"),
            "{label}: {err:?}"
        );
    }
}

#[tokio::test]
async fn validation_rejects_bad_writes_everywhere() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;

        let err = model.create(doc! { "level": "high" }).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }), "{label}");

        let guild = model.create(doc! { "name": "alpha" }).await.unwrap();
        let err = guild.prop("level").unwrap().set("nope").unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }), "{label}");
        let err = guild.prop("unknown").unwrap().set(1).unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }), "{label}");

        // Nothing was queued by the failed writes.
        guild.save().await.unwrap();
        model.drop_from_cache(guild.id()).await;
        let stored = model.find_one_by_object_id(guild.id()).await.unwrap().unwrap();
        assert_eq!(stored.prop("level").unwrap().val().unwrap(), bson!(1_i64), "{label}");
    }
}

#[tokio::test]
async fn delete_removes_documents_and_reports_counts() {
    for (label, backend) in backends() {
        let model = bound_model(backend).await;
        for level in [1_i64, 2, 3, 4] {
            model.create(doc! { "name": "x", "level": level }).await.unwrap();
        }

        let removed = model.delete(doc! { "level": { "$lte": 2 } }).await.unwrap();
        assert_eq!(removed, 2, "{label}");
        assert_eq!(model.count(doc! {}).await.unwrap(), 2, "{label}");

        let gone = model
            .find_one(doc! { "level": 1 })
            .await
            .unwrap();
        assert!(gone.is_none(), "{label}");
    }
}
