//! Reactive queries: dependency tracking, invalidation, re-execution.

mod context;
mod engine;

pub use context::{DependencySet, QueryBucket, QueryContext};
pub use engine::{QuerySubscription, ReactiveEngine};

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use dashmap::DashMap;
    use parking_lot::Mutex;

    use super::*;
    use crate::bucket::{self, BucketHandle};
    use crate::error::Error;
    use crate::events::EventBus;
    use crate::filter::Filter;
    use crate::record::records_value;
    use crate::schema::{BucketDef, FieldDef, Generator, Schema};
    use crate::value::{fields, Value};

    struct Fixture {
        buckets: Arc<DashMap<String, BucketHandle>>,
        bus: EventBus,
        engine: ReactiveEngine,
        _wiring: crate::events::EventSubscription,
    }

    impl Fixture {
        fn new() -> Self {
            let buckets: Arc<DashMap<String, BucketHandle>> = Arc::new(DashMap::new());
            let bus = EventBus::new();
            let engine = ReactiveEngine::start(Arc::clone(&buckets));
            let feeder = engine.clone();
            let wiring = bus.on("bucket.*.*", move |event| {
                feeder.notify(event);
                async {}
            });
            Self {
                buckets,
                bus,
                engine,
                _wiring: wiring,
            }
        }

        fn define(&self, name: &str, def: BucketDef) -> BucketHandle {
            let handle = bucket::spawn(
                Arc::new(Schema::compile(name, def).unwrap()),
                self.bus.clone(),
            );
            self.buckets.insert(name.to_string(), handle.clone());
            handle
        }

        async fn settle(&self) {
            // Events flow bus -> engine -> possible re-runs; drain both
            // until neither has work.
            loop {
                self.bus.settle().await;
                self.engine.settle().await;
                if self.bus.pending() == 0 && self.engine.pending() == 0 {
                    return;
                }
            }
        }
    }

    fn customers_def() -> BucketDef {
        BucketDef::new("id")
            .field(FieldDef::string("id").generated(Generator::Uuid))
            .field(FieldDef::string("name").required())
            .field(FieldDef::string("tier").with_default("basic"))
            .index("tier")
    }

    #[tokio::test]
    async fn test_callback_not_invoked_initially_then_fires_on_change() {
        let fx = Fixture::new();
        let customers = fx.define("customers", customers_def());

        fx.engine
            .define_query("vips", |ctx, _params| async move {
                let records = ctx
                    .bucket("customers")?
                    .find(Filter::all().eq("tier", "vip"))
                    .await?;
                Ok(records_value(records))
            })
            .unwrap();

        let results: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        let sub = fx
            .engine
            .subscribe("vips", Value::Null, move |value| {
                sink.lock().push(value.clone());
            })
            .await
            .unwrap();

        // No initial dispatch.
        assert!(results.lock().is_empty());

        // A non-vip insert re-executes but the result is unchanged.
        customers
            .insert(fields([("name", "A".into()), ("tier", "basic".into())]))
            .await
            .unwrap();
        fx.settle().await;
        assert!(results.lock().is_empty());

        // A vip insert changes the result; one dispatch.
        customers
            .insert(fields([("name", "B".into()), ("tier", "vip".into())]))
            .await
            .unwrap();
        fx.settle().await;
        {
            let seen = results.lock();
            assert_eq!(seen.len(), 1);
            let Value::Array(items) = &seen[0] else {
                panic!("expected array result");
            };
            assert_eq!(items.len(), 1);
        }

        sub.unsubscribe();
    }

    #[tokio::test]
    async fn test_record_level_dependency_isolation() {
        let fx = Fixture::new();
        let stock = fx.define(
            "stock",
            BucketDef::new("sku")
                .field(FieldDef::string("sku").required())
                .field(FieldDef::int("qty").required()),
        );
        stock
            .insert(fields([("sku", "X".into()), ("qty", 1.into())]))
            .await
            .unwrap();
        stock
            .insert(fields([("sku", "Y".into()), ("qty", 1.into())]))
            .await
            .unwrap();
        fx.settle().await;

        fx.engine
            .define_query("x_qty", |ctx, _| async move {
                let record = ctx.bucket("stock")?.get("X").await?;
                Ok(record
                    .and_then(|r| r.get("qty").cloned())
                    .unwrap_or(Value::Null))
            })
            .unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let _sub = fx
            .engine
            .subscribe("x_qty", Value::Null, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        // Unrelated key: no invalidation, no dispatch.
        stock
            .update("Y", fields([("qty", 99.into())]))
            .await
            .unwrap();
        fx.settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // The watched key changes; dispatch fires.
        stock
            .update("X", fields([("qty", 5.into())]))
            .await
            .unwrap();
        fx.settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deep_equal_results_skip_dispatch() {
        let fx = Fixture::new();
        let users = fx.define(
            "users",
            BucketDef::new("id")
                .field(FieldDef::string("id").generated(Generator::Uuid))
                .field(FieldDef::string("role").with_default("member")),
        );

        fx.engine
            .define_query("admin_count", |ctx, _| async move {
                let n = ctx
                    .bucket("users")?
                    .count(Filter::all().eq("role", "admin"))
                    .await?;
                Ok(Value::Int(n as i64))
            })
            .unwrap();

        let dispatches = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&dispatches);
        let _sub = fx
            .engine
            .subscribe("admin_count", Value::Null, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        // Inserting a non-admin re-runs the query; count stays 0.
        users
            .insert(fields([("role", "member".into())]))
            .await
            .unwrap();
        fx.settle().await;
        assert_eq!(dispatches.load(Ordering::SeqCst), 0);

        users
            .insert(fields([("role", "admin".into())]))
            .await
            .unwrap();
        fx.settle().await;
        assert_eq!(dispatches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_query_name_rejected() {
        let fx = Fixture::new();
        fx.engine
            .define_query("q", |_, _| async { Ok(Value::Null) })
            .unwrap();
        let err = fx
            .engine
            .define_query("q", |_, _| async { Ok(Value::Null) })
            .unwrap_err();
        assert!(matches!(err, Error::QueryAlreadyDefined { .. }));
    }

    #[tokio::test]
    async fn test_initial_error_propagates_and_registers_nothing() {
        let fx = Fixture::new();
        fx.engine
            .define_query("broken", |ctx, _| async move {
                // The bucket does not exist.
                ctx.bucket("ghost")?;
                Ok(Value::Null)
            })
            .unwrap();

        let err = fx
            .engine
            .subscribe("broken", Value::Null, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BucketNotDefined { .. }));
        assert_eq!(fx.engine.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_rerun_error_is_swallowed_and_subscription_survives() {
        let fx = Fixture::new();
        let flags = fx.define(
            "flags",
            BucketDef::new("id").field(FieldDef::string("id").required()),
        );

        fx.engine
            .define_query("fragile", |ctx, _| async move {
                let n = ctx.bucket("flags")?.count(Filter::all()).await?;
                if n >= 2 {
                    return Err(Error::QueryNotDefined {
                        name: "simulated failure".into(),
                    });
                }
                Ok(Value::Int(n as i64))
            })
            .unwrap();

        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = fx
            .engine
            .subscribe("fragile", Value::Null, move |v| {
                sink.lock().push(v.clone());
            })
            .await
            .unwrap();

        flags.insert(fields([("id", "a".into())])).await.unwrap();
        fx.settle().await;
        assert_eq!(*seen.lock(), vec![Value::Int(1)]);

        // This run fails; the prior result is retained.
        flags.insert(fields([("id", "b".into())])).await.unwrap();
        fx.settle().await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(fx.engine.subscription_count(), 1);

        // Recovery: dropping back below the threshold re-runs fine, and
        // the comparison is against the retained result (1 -> 1 skips).
        flags.delete("b").await.unwrap();
        fx.settle().await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_dispatch() {
        let fx = Fixture::new();
        let flags = fx.define(
            "flags",
            BucketDef::new("id").field(FieldDef::string("id").required()),
        );

        fx.engine
            .define_query("count", |ctx, _| async move {
                let n = ctx.bucket("flags")?.count(Filter::all()).await?;
                Ok(Value::Int(n as i64))
            })
            .unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let sub = fx
            .engine
            .subscribe("count", Value::Null, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        sub.unsubscribe();
        assert_eq!(fx.engine.subscription_count(), 0);

        flags.insert(fields([("id", "a".into())])).await.unwrap();
        fx.settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_params_make_independent_subscriptions() {
        let fx = Fixture::new();
        let flags = fx.define(
            "flags",
            BucketDef::new("id")
                .field(FieldDef::string("id").required())
                .field(FieldDef::string("kind")),
        );

        fx.engine
            .define_query("by_kind", |ctx, params| async move {
                let kind = params;
                let n = ctx
                    .bucket("flags")?
                    .count(Filter::all().eq("kind", kind))
                    .await?;
                Ok(Value::Int(n as i64))
            })
            .unwrap();

        let red_runs = Arc::new(AtomicUsize::new(0));
        let blue_runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&red_runs);
        let _red = fx
            .engine
            .subscribe("by_kind", "red".into(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        let counter = Arc::clone(&blue_runs);
        let _blue = fx
            .engine
            .subscribe("by_kind", "blue".into(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        flags
            .insert(fields([("id", "a".into()), ("kind", "red".into())]))
            .await
            .unwrap();
        fx.settle().await;

        assert_eq!(red_runs.load(Ordering::SeqCst), 1);
        assert_eq!(blue_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_query_is_one_shot() {
        let fx = Fixture::new();
        let flags = fx.define(
            "flags",
            BucketDef::new("id").field(FieldDef::string("id").required()),
        );
        flags.insert(fields([("id", "a".into())])).await.unwrap();

        fx.engine
            .define_query("count", |ctx, _| async move {
                let n = ctx.bucket("flags")?.count(Filter::all()).await?;
                Ok(Value::Int(n as i64))
            })
            .unwrap();

        assert_eq!(
            fx.engine.run_query("count", Value::Null).await.unwrap(),
            Value::Int(1)
        );
        assert_eq!(fx.engine.subscription_count(), 0);

        let err = fx.engine.run_query("ghost", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::QueryNotDefined { .. }));
    }
}
