//! Store lifecycle: definitions, persistence round trips, drops, stats.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reflexdb_core::{
    fields, BucketDef, Error, EventKind, FieldDef, Filter, Generator, MemorySnapshotStore, Store,
    StoreOptions, SnapshotStore, Value,
};

fn orders_def() -> BucketDef {
    BucketDef::new("id")
        .field(FieldDef::int("id").generated(Generator::Autoincrement))
        .field(FieldDef::string("sku").required())
}

#[tokio::test]
async fn duplicate_and_missing_buckets() {
    let store = Store::start(StoreOptions::new());
    store.define_bucket("orders", orders_def()).await.unwrap();

    let err = store
        .define_bucket("orders", orders_def())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BucketAlreadyExists { .. }));

    let err = store.bucket("ghost").unwrap_err();
    assert!(matches!(err, Error::BucketNotDefined { .. }));

    assert_eq!(store.bucket_names(), vec!["orders".to_string()]);
    store.stop().await;
}

#[tokio::test]
async fn invalid_definitions_are_rejected() {
    let store = Store::start(StoreOptions::new());

    let missing_key = BucketDef::new("id").field(FieldDef::string("name"));
    assert!(matches!(
        store.define_bucket("b", missing_key).await.unwrap_err(),
        Error::InvalidDefinition { .. }
    ));

    let bad_ttl = BucketDef::new("id")
        .field(FieldDef::string("id"))
        .ttl("soon");
    assert!(matches!(
        store.define_bucket("b", bad_ttl).await.unwrap_err(),
        Error::InvalidDuration { .. }
    ));

    // Nothing was registered along the way.
    assert!(store.bucket_names().is_empty());
    store.stop().await;
}

#[tokio::test]
async fn persistence_round_trip_across_restart() {
    let adapter = Arc::new(MemorySnapshotStore::new());

    // First life: write data, stop (which flushes).
    {
        let store = Store::start(
            StoreOptions::new()
                .persistence(Arc::clone(&adapter) as Arc<dyn reflexdb_core::SnapshotStore>)
                .snapshot_interval(Duration::ZERO),
        );
        store.define_bucket("orders", orders_def()).await.unwrap();
        let orders = store.bucket("orders").unwrap();
        orders
            .insert(fields([("sku", "X".into())]))
            .await
            .unwrap();
        orders
            .insert(fields([("sku", "Y".into())]))
            .await
            .unwrap();
        store.stop().await;
    }

    // Second life: the same adapter restores records and the counter.
    {
        let store = Store::start(
            StoreOptions::new()
                .persistence(Arc::clone(&adapter) as Arc<dyn reflexdb_core::SnapshotStore>)
                .snapshot_interval(Duration::ZERO),
        );

        // Restore must not publish events.
        let inserted: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inserted);
        let _sub = store.on("bucket.*.*", move |event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(event.topic());
            }
        });

        store.define_bucket("orders", orders_def()).await.unwrap();
        let orders = store.bucket("orders").unwrap();

        assert_eq!(orders.count(Filter::all()).await.unwrap(), 2);
        store.settle().await;
        assert!(inserted.lock().is_empty());

        // The autoincrement counter continues rather than reissuing ids.
        let next = orders
            .insert(fields([("sku", "Z".into())]))
            .await
            .unwrap();
        assert_eq!(next.get("id"), Some(&Value::Int(3)));

        store.stop().await;
    }
}

#[tokio::test]
async fn transient_buckets_are_not_snapshotted() {
    let adapter = Arc::new(MemorySnapshotStore::new());
    let store = Store::start(
        StoreOptions::new()
            .persistence(Arc::clone(&adapter) as Arc<dyn reflexdb_core::SnapshotStore>)
            .snapshot_interval(Duration::ZERO),
    );

    store
        .define_bucket(
            "scratch",
            BucketDef::new("id")
                .field(FieldDef::string("id").required())
                .transient(),
        )
        .await
        .unwrap();
    store
        .bucket("scratch")
        .unwrap()
        .insert(fields([("id", "a".into())]))
        .await
        .unwrap();

    store.stop().await;
    assert!(adapter.read("scratch").unwrap().is_none());
}

#[tokio::test]
async fn drop_bucket_forgets_everything() {
    let adapter = Arc::new(MemorySnapshotStore::new());
    let store = Store::start(
        StoreOptions::new()
            .persistence(Arc::clone(&adapter) as Arc<dyn reflexdb_core::SnapshotStore>)
            .snapshot_interval(Duration::ZERO)
            .ttl_check_interval(Duration::ZERO),
    );

    store
        .define_bucket(
            "cache",
            BucketDef::new("id")
                .field(FieldDef::string("id").required())
                .ttl(60_000u64),
        )
        .await
        .unwrap();
    let cache = store.bucket("cache").unwrap();
    cache.insert(fields([("id", "a".into())])).await.unwrap();

    // No per-record events on drop.
    let topics: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&topics);
    store.settle().await;
    let _sub = store.on("bucket.cache.*", move |event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(event.topic());
        }
    });

    store.drop_bucket("cache").unwrap();
    store.settle().await;

    assert!(topics.lock().is_empty());
    assert!(matches!(
        store.bucket("cache").unwrap_err(),
        Error::BucketNotDefined { .. }
    ));

    // Stale handles observe the closed mailbox.
    let err = cache.get("a").await.unwrap_err();
    assert!(matches!(err, Error::BucketClosed { .. }));

    // The stats reflect the removal, and re-defining starts empty (the
    // snapshot blob was forgotten with the bucket).
    let stats = store.get_stats().await.unwrap();
    assert!(stats.buckets.is_empty());
    assert_eq!(stats.ttl_buckets, 0);

    store
        .define_bucket(
            "cache",
            BucketDef::new("id").field(FieldDef::string("id").required()),
        )
        .await
        .unwrap();
    assert_eq!(
        store
            .bucket("cache")
            .unwrap()
            .count(Filter::all())
            .await
            .unwrap(),
        0
    );

    store.stop().await;
}

#[tokio::test]
async fn dropped_bucket_breaks_queries_but_not_the_engine() {
    let store = Store::start(StoreOptions::new());
    store
        .define_bucket(
            "flags",
            BucketDef::new("id").field(FieldDef::string("id").required()),
        )
        .await
        .unwrap();
    store
        .define_bucket(
            "other",
            BucketDef::new("id").field(FieldDef::string("id").required()),
        )
        .await
        .unwrap();

    store
        .define_query("flag_count", |ctx, _| async move {
            let n = ctx.bucket("flags")?.count(Filter::all()).await?;
            Ok(Value::Int(n as i64))
        })
        .unwrap();

    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = store
        .subscribe("flag_count", Value::Null, move |v| {
            sink.lock().push(v.clone());
        })
        .await
        .unwrap();

    store.drop_bucket("flags").unwrap();
    store.settle().await;

    // Unrelated mutations no longer trigger the pruned dependency, and a
    // would-be re-execution failure is swallowed; the subscription lives.
    store
        .bucket("other")
        .unwrap()
        .insert(fields([("id", "x".into())]))
        .await
        .unwrap();
    store.settle().await;

    assert!(seen.lock().is_empty());
    assert_eq!(store.get_stats().await.unwrap().subscriptions, 1);

    store.stop().await;
}

#[tokio::test]
async fn event_payloads_carry_records() {
    let store = Store::start(StoreOptions::new());
    store
        .define_bucket(
            "stock",
            BucketDef::new("sku")
                .field(FieldDef::string("sku").required())
                .field(FieldDef::int("qty").required()),
        )
        .await
        .unwrap();
    let stock = store.bucket("stock").unwrap();

    let events: Arc<Mutex<Vec<(String, EventKind)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _sub = store.on("bucket.stock.*", move |event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push((event.topic(), event.kind.clone()));
        }
    });

    stock
        .insert(fields([("sku", "X".into()), ("qty", 1.into())]))
        .await
        .unwrap();
    stock
        .update("X", fields([("qty", 2.into())]))
        .await
        .unwrap();
    stock.delete("X").await.unwrap();
    store.settle().await;

    let seen = events.lock();
    assert_eq!(seen.len(), 3);

    assert_eq!(seen[0].0, "bucket.stock.inserted");
    let EventKind::Inserted { record } = &seen[0].1 else {
        panic!("expected inserted payload");
    };
    assert_eq!(record.get("qty"), Some(&Value::Int(1)));

    assert_eq!(seen[1].0, "bucket.stock.updated");
    let EventKind::Updated {
        old_record,
        new_record,
    } = &seen[1].1
    else {
        panic!("expected updated payload");
    };
    assert_eq!(old_record.get("qty"), Some(&Value::Int(1)));
    assert_eq!(new_record.get("qty"), Some(&Value::Int(2)));
    assert_eq!(old_record.version(), 1);
    assert_eq!(new_record.version(), 2);

    assert_eq!(seen[2].0, "bucket.stock.deleted");
    let EventKind::Deleted { record } = &seen[2].1 else {
        panic!("expected deleted payload");
    };
    assert_eq!(record.get("qty"), Some(&Value::Int(2)));

    store.stop().await;
}

#[tokio::test]
async fn stats_report_counters() {
    let store = Store::start(StoreOptions::new().ttl_check_interval(Duration::ZERO));
    store
        .define_bucket(
            "cache",
            BucketDef::new("id")
                .field(FieldDef::string("id").required())
                .field(FieldDef::string("kind"))
                .index("kind")
                .ttl(60_000u64),
        )
        .await
        .unwrap();
    store.define_bucket("orders", orders_def()).await.unwrap();

    store
        .bucket("cache")
        .unwrap()
        .insert(fields([("id", "a".into())]))
        .await
        .unwrap();

    store
        .define_query("noop", |_, _| async { Ok(Value::Null) })
        .unwrap();
    let _sub = store
        .subscribe("noop", Value::Null, |_| {})
        .await
        .unwrap();

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.buckets.len(), 2);
    assert_eq!(stats.buckets["cache"].records, 1);
    assert_eq!(stats.buckets["cache"].indexes, 1);
    assert!(stats.buckets["cache"].ttl);
    assert_eq!(stats.buckets["orders"].records, 0);
    assert!(!stats.buckets["orders"].ttl);
    assert_eq!(stats.subscriptions, 1);
    assert_eq!(stats.ttl_buckets, 1);

    store.stop().await;
}

#[tokio::test]
async fn clear_emits_deleted_events_and_wakes_queries() {
    let store = Store::start(StoreOptions::new());
    store
        .define_bucket(
            "flags",
            BucketDef::new("id").field(FieldDef::string("id").required()),
        )
        .await
        .unwrap();
    let flags = store.bucket("flags").unwrap();

    for id in ["a", "b"] {
        flags.insert(fields([("id", id.into())])).await.unwrap();
    }
    store.settle().await;

    let deleted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deleted);
    let _sub = store.on("bucket.flags.deleted", move |event| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(event.key.clone());
        }
    });

    assert_eq!(flags.clear().await.unwrap(), 2);
    store.settle().await;
    assert_eq!(deleted.lock().len(), 2);

    store.stop().await;
}
