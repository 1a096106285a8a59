/// integration tests for the member -> coordinator proxy path
///
use cluster_cache::client::proxy::ProxyClient;
use cluster_cache::client::{Fault, StoreClient};
use cluster_cache::coordinator::Coordinator;
use cluster_cache::message::{IncrTarget, KeySel, Returning, StoreOpts};
use serde_json::json;

#[test]
fn scalar_round_trip() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;

        let put = client
            .put("session:abc", json!({"user": "dpw"}), StoreOpts::scalar())
            .await
            .expect("put is not misuse");
        assert!(!put.is_degraded());

        let got = client
            .get("session:abc".into(), StoreOpts::scalar())
            .await
            .expect("get is not misuse");
        assert_eq!(got.value, Some(json!({"user": "dpw"})));

        let keys = client.keys(Some("session:*")).await.expect("keys");
        assert_eq!(keys.value, vec!["session:abc".to_string()]);

        let stats = client.stats().await.expect("stats");
        assert_eq!(stats.value.keys, 1);
        assert!(stats.value.uptime.is_some());

        let removed = client.del("session:abc", StoreOpts::scalar()).await.expect("del");
        assert!(removed.value);

        let got = client
            .get("session:abc".into(), StoreOpts::scalar())
            .await
            .expect("get");
        assert_eq!(got.value, None);
    });
}

#[test]
fn multi_get() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;

        client.put("a", json!(1), StoreOpts::scalar()).await.expect("put");
        client.put("b", json!(2), StoreOpts::scalar()).await.expect("put");

        let got = client
            .get(
                KeySel::Many(vec!["a".to_string(), "missing".to_string(), "b".to_string()]),
                StoreOpts::scalar(),
            )
            .await
            .expect("get");
        assert_eq!(got.value, Some(json!([1, null, 2])));
    });
}

#[test]
fn map_structure() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;
        let opts = StoreOpts::map("profile:1");

        client
            .put("*", json!({"name": "dpw", "visits": 1}), opts.clone())
            .await
            .expect("bulk write");
        client
            .put("city", json!("seattle"), opts.clone())
            .await
            .expect("field write");

        let one = client.get("name".into(), opts.clone()).await.expect("get");
        assert_eq!(one.value, Some(json!("dpw")));

        let all = client.get("*".into(), opts.clone()).await.expect("get all");
        assert_eq!(
            all.value,
            Some(json!({"name": "dpw", "visits": 1, "city": "seattle"}))
        );

        let removed = client.del("visits", opts.clone()).await.expect("del field");
        assert!(removed.value);

        let missing = client.get("visits".into(), opts).await.expect("get");
        assert_eq!(missing.value, None);
    });
}

#[test]
fn list_structure_and_guarded_pop() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;
        let opts = StoreOpts::list("inbox:42");

        let size = client.put("", json!("msg-1"), opts.clone()).await.expect("add");
        assert_eq!(size.value, Some(1));
        let size = client.put("", json!("msg-2"), opts.clone()).await.expect("add");
        assert_eq!(size.value, Some(2));

        // duplicate add keeps set semantics
        let size = client.put("", json!("msg-2"), opts.clone()).await.expect("add");
        assert_eq!(size.value, Some(2));

        let member = client.get("msg-1".into(), opts.clone()).await.expect("test");
        assert_eq!(member.value, Some(json!(true)));

        let popped = client
            .get("*".into(), opts.clone().with_pop())
            .await
            .expect("pop");
        assert_eq!(popped.value, Some(json!("msg-1")));

        // the guard sentinel prevents msg-1 from being delivered twice
        // even if it were re-queued inside the window
        client.put("", json!("msg-1"), opts.clone()).await.expect("re-add");
        let popped = client
            .get("*".into(), opts.clone().with_pop())
            .await
            .expect("pop");
        assert_eq!(popped.value, Some(json!("msg-2")));

        let popped = client.get("*".into(), opts.with_pop()).await.expect("pop");
        assert_eq!(popped.value, None, "re-queued msg-1 was claimed already");
    });
}

#[test]
fn setmax_race_keeps_the_max() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;

        // many members race conditional writes; the coordinator's
        // serialized dispatch guarantees the final value is the max
        let mut handles = Vec::new();
        for v in [7i64, 3, 11, 5, 9, 2, 10] {
            let member = ProxyClient::connect(&coordinator).await;
            handles.push(async_std::task::spawn(async move {
                member
                    .put("high-water", json!(v), StoreOpts::scalar().with_setmax())
                    .await
                    .expect("setmax");
            }));
        }
        for handle in handles {
            handle.await;
        }

        let client = ProxyClient::connect(&coordinator).await;
        let got = client
            .get("high-water".into(), StoreOpts::scalar())
            .await
            .expect("get");
        assert_eq!(got.value, Some(json!(11)));
    });
}

#[test]
fn incr_counters() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;

        let first = client
            .incr(IncrTarget::key("unread:7", 1.0), StoreOpts::scalar())
            .await
            .expect("incr");
        assert_eq!(first.value.new, Some(json!(1.0)));

        let second = client
            .incr(
                IncrTarget::key("unread:7", 2.0),
                StoreOpts::scalar().with_returning(Returning::Both),
            )
            .await
            .expect("incr");
        assert_eq!(second.value.old, Some(json!(1.0)));
        assert_eq!(second.value.new, Some(json!(3.0)));

        let fields = client
            .incr(
                IncrTarget::Fields(vec![("sent".to_string(), 1.0), ("recv".to_string(), 4.0)]),
                StoreOpts::map("counts:7"),
            )
            .await
            .expect("incr fields");
        assert_eq!(fields.value.new, Some(json!({"sent": 1.0, "recv": 4.0})));
    });
}

#[test]
fn backend_outage_fails_open() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;
        assert!(coordinator.shutdown());

        let got = client.get("k".into(), StoreOpts::scalar()).await.expect("get");
        assert_eq!(got.value, None);
        assert_eq!(got.fault, Some(Fault::Transport));

        let removed = client.del("k", StoreOpts::scalar()).await.expect("del");
        assert_eq!(removed.value, false);
        assert!(removed.is_degraded());

        let keys = client.keys(None).await.expect("keys");
        assert!(keys.value.is_empty());
        assert!(keys.is_degraded());
    });
}
