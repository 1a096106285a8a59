/// integration tests for the lock primitive over the proxy path
///
use cluster_cache::client::proxy::ProxyClient;
use cluster_cache::client::StoreClient;
use cluster_cache::coordinator::Coordinator;
use cluster_cache::lock::LockOpts;
use std::time::Duration;

#[test]
fn exclusive_until_unlocked() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let member1 = ProxyClient::connect(&coordinator).await;
        let member2 = ProxyClient::connect(&coordinator).await;

        let first = member1.lock("create-tables", LockOpts::new()).await.expect("lock");
        assert!(first.value);

        let second = member2.lock("create-tables", LockOpts::new()).await.expect("lock");
        assert!(!second.value);

        member1.unlock("create-tables").await.expect("unlock");

        let third = member2.lock("create-tables", LockOpts::new()).await.expect("lock");
        assert!(third.value);
    });
}

#[test]
fn concurrent_lockers_single_winner() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let member = ProxyClient::connect(&coordinator).await;
            handles.push(async_std::task::spawn(async move {
                member
                    .lock("one-shot", LockOpts::new())
                    .await
                    .expect("lock")
                    .value
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    });
}

#[test]
fn ttl_expiry_releases() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;

        let first = client
            .lock("short", LockOpts::new().with_ttl(100))
            .await
            .expect("lock");
        assert!(first.value);

        let blocked = client
            .lock("short", LockOpts::new().with_ttl(100))
            .await
            .expect("lock");
        assert!(!blocked.value);

        async_std::task::sleep(Duration::from_millis(150)).await;

        let reacquired = client
            .lock("short", LockOpts::new().with_ttl(100))
            .await
            .expect("lock");
        assert!(reacquired.value, "an expired lock can be taken again");
    });
}

#[test]
fn force_takes_over() {
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let client = ProxyClient::connect(&coordinator).await;

        assert!(client.lock("ddl", LockOpts::new()).await.expect("lock").value);
        assert!(
            client
                .lock("ddl", LockOpts::new().with_force())
                .await
                .expect("lock")
                .value
        );
    });
}

#[test]
fn unlock_ignores_ownership() {
    // known weakness, preserved deliberately: unlock never checks the
    // caller holds the lock, so any member can force-release an orphaned
    // lock (and, equally, someone else's live one)
    async_std::task::block_on(async move {
        let coordinator = Coordinator::start(1_000).await;
        let owner = ProxyClient::connect(&coordinator).await;
        let stranger = ProxyClient::connect(&coordinator).await;

        let held = owner
            .lock("orphaned", LockOpts::new().with_owner("owner-1"))
            .await
            .expect("lock");
        assert!(held.value);

        stranger.unlock("orphaned").await.expect("unlock");

        let taken = stranger
            .lock("orphaned", LockOpts::new().with_owner("stranger-2"))
            .await
            .expect("lock");
        assert!(taken.value, "the stranger released a lock it never held");
    });
}
