/// integration tests for the token bucket limiter over the proxy path
///
use cluster_cache::client::proxy::ProxyClient;
use cluster_cache::client::StoreClient;
use cluster_cache::coordinator::Coordinator;
use cluster_cache::message::LimiterOpts;
use std::time::Duration;

#[test]
fn monotonic_denial_under_overload() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;
        let opts = LimiterOpts::new("api:overload").with_bucket(1.0, 1.0, 100);

        // 5 requests paced well under the interval: 1 allowed, 4 denied
        let mut allowed = 0;
        let mut denied = 0;
        for _ in 0..5 {
            let verdict = client.limiter(opts.clone()).await.expect("limiter");
            assert!(!verdict.is_degraded());
            if verdict.value.allowed() {
                allowed += 1;
            } else {
                assert!(verdict.value.delay > 0);
                denied += 1;
            }
            async_std::task::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(allowed, 1);
        assert_eq!(denied, 4);
    });
}

#[test]
fn refill_after_interval() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;
        let opts = LimiterOpts::new("api:refill").with_bucket(1.0, 1.0, 100);

        let verdict = client.limiter(opts.clone()).await.expect("limiter");
        assert!(verdict.value.allowed());

        async_std::task::sleep(Duration::from_millis(120)).await;

        let verdict = client.limiter(opts).await.expect("limiter");
        assert!(verdict.value.allowed(), "a full interval refills the bucket");
    });
}

#[test]
fn reset_clears_after_n_requests() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;
        let opts = LimiterOpts::new("api:reset")
            .with_bucket(10.0, 10.0, 100)
            .with_reset(3.0);

        for expected in 1..=3u64 {
            let verdict = client.limiter(opts.clone()).await.expect("limiter");
            assert_eq!(verdict.value.total, expected);
        }

        // the state was cleared, so the counter restarts
        let verdict = client.limiter(opts).await.expect("limiter");
        assert_eq!(verdict.value.total, 1);
    });
}

#[test]
fn consume_weight_drains_faster() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;
        let opts = LimiterOpts::new("api:weighted")
            .with_bucket(10.0, 10.0, 60_000)
            .with_consume(5.0);

        let verdict = client.limiter(opts.clone()).await.expect("limiter");
        assert!(verdict.value.allowed());
        assert_eq!(verdict.value.count, 5.0);

        let verdict = client.limiter(opts.clone()).await.expect("limiter");
        assert!(verdict.value.allowed());

        // ~0 tokens left now, the third weighted request is starved
        let verdict = client.limiter(opts).await.expect("limiter");
        assert!(verdict.value.delay > 0);
    });
}
