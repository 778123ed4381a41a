use super::*;
use std::time::Duration;

fn pool_config() -> PoolConfig {
    PoolConfig {
        preferred_protocols: Vec::new(),
        preferred_countries: Vec::new(),
        quarantine_period: Duration::from_secs(60),
        idle_horizon: Duration::from_secs(30),
    }
}

async fn pool_with(routes: Vec<Route>) -> RoutePool {
    let pool = RoutePool::new(pool_config());
    pool.add_routes(routes).await;
    pool
}

#[tokio::test]
async fn test_fresh_pool_picks_least_recently_used() {
    let pool = pool_with(vec![
        Route::new("10.0.0.1", 1080, ProtocolKind::Socks5),
        Route::new("10.0.0.2", 1080, ProtocolKind::Socks5),
    ])
    .await;

    let filter = RouteFilter::default();
    let first = pool.select_route(&filter).await.unwrap();
    assert_eq!(first.route_id, "10.0.0.1:1080");

    // The other route has never been used, so it is strictly more attractive now
    let excluded = filter.excluding(&first.route_id);
    let second = pool.select_route(&excluded).await.unwrap();
    assert_eq!(second.route_id, "10.0.0.2:1080");
}

#[tokio::test]
async fn test_preferences_fall_back_to_any_active_route() {
    let pool = pool_with(vec![
        Route::new("10.0.0.1", 8080, ProtocolKind::Http).with_country("US"),
    ])
    .await;

    let filter = RouteFilter {
        protocols: vec![ProtocolKind::Socks5],
        countries: vec!["de".into()],
        exclude: HashSet::new(),
    };
    let route = pool.select_route(&filter).await.unwrap();
    assert_eq!(route.protocol, ProtocolKind::Http);
}

#[tokio::test]
async fn test_preferences_are_honored_when_possible() {
    let pool = pool_with(vec![
        Route::new("10.0.0.1", 8080, ProtocolKind::Http),
        Route::new("10.0.0.2", 1080, ProtocolKind::Socks5).with_country("DE"),
        Route::new("10.0.0.3", 1080, ProtocolKind::Socks5).with_country("US"),
    ])
    .await;

    let filter = RouteFilter {
        protocols: vec![ProtocolKind::Socks5],
        countries: vec!["de".into()],
        exclude: HashSet::new(),
    };
    for _ in 0..10 {
        let route = pool.select_route(&filter).await.unwrap();
        assert_eq!(route.route_id, "10.0.0.2:1080");
    }
}

#[tokio::test]
async fn test_exclusion_is_dropped_as_last_resort() {
    let pool = pool_with(vec![Route::new("10.0.0.1", 1080, ProtocolKind::Socks5)]).await;
    let filter = RouteFilter::default().excluding("10.0.0.1:1080");
    let route = pool.select_route(&filter).await.unwrap();
    assert_eq!(route.route_id, "10.0.0.1:1080");
}

#[tokio::test]
async fn test_route_death_is_never_revived_by_selection() {
    let pool = pool_with(vec![Route::new("10.0.0.1", 1080, ProtocolKind::Socks5)]).await;

    assert_eq!(
        pool.report_outcome("10.0.0.1:1080", RouteOutcome::Failure)
            .await
            .unwrap(),
        None
    );
    pool.report_outcome("10.0.0.1:1080", RouteOutcome::Failure)
        .await
        .unwrap();
    let transition = pool
        .report_outcome("10.0.0.1:1080", RouteOutcome::Failure)
        .await
        .unwrap();
    assert_eq!(transition, Some(RouteState::Dead));

    let result = pool.select_route(&RouteFilter::default()).await;
    assert!(matches!(result, Err(Error::PoolExhausted(_))));

    // Still retained for audit
    let route = pool.get("10.0.0.1:1080").await.unwrap();
    assert_eq!(route.state, RouteState::Dead);
    assert_eq!(pool.len().await, 1);
}

#[tokio::test]
async fn test_healthy_route_is_quarantined_not_killed() {
    let mut route = Route::new("10.0.0.1", 1080, ProtocolKind::Socks5);
    route.success_count = 20;
    let pool = pool_with(vec![route]).await;

    for _ in 0..3 {
        pool.report_outcome("10.0.0.1:1080", RouteOutcome::Failure)
            .await
            .unwrap();
    }

    let route = pool.get("10.0.0.1:1080").await.unwrap();
    assert!(matches!(route.state, RouteState::Quarantined { .. }));
    assert!(pool.select_route(&RouteFilter::default()).await.is_err());

    let stats = pool.stats().await;
    assert_eq!(stats.quarantined, 1);
    assert_eq!(stats.active, 0);
}

#[tokio::test]
async fn test_quarantine_expires() {
    let mut config = pool_config();
    config.quarantine_period = Duration::ZERO;
    let pool = RoutePool::new(config);
    let mut route = Route::new("10.0.0.1", 1080, ProtocolKind::Socks5);
    route.success_count = 20;
    pool.add_routes(vec![route]).await;

    for _ in 0..3 {
        pool.report_outcome("10.0.0.1:1080", RouteOutcome::Failure)
            .await
            .unwrap();
    }

    let route = pool.select_route(&RouteFilter::default()).await.unwrap();
    assert_eq!(route.state, RouteState::Active);
    assert_eq!(route.consecutive_failures, 0);
}

#[tokio::test]
async fn test_success_resets_consecutive_failures() {
    let pool = pool_with(vec![Route::new("10.0.0.1", 1080, ProtocolKind::Socks5)]).await;
    pool.report_outcome("10.0.0.1:1080", RouteOutcome::Failure)
        .await
        .unwrap();
    pool.report_outcome("10.0.0.1:1080", RouteOutcome::Success)
        .await
        .unwrap();

    let route = pool.get("10.0.0.1:1080").await.unwrap();
    assert_eq!(route.consecutive_failures, 0);
    assert_eq!(route.failure_count, 1);
    assert_eq!(route.success_count, 1);
}

#[tokio::test]
async fn test_throttle_counts_only_across_rotations() {
    let pool = pool_with(vec![Route::new("10.0.0.1", 1080, ProtocolKind::Socks5)]).await;
    let filter = RouteFilter::default();

    pool.select_route(&filter).await.unwrap();
    pool.report_outcome("10.0.0.1:1080", RouteOutcome::Throttled)
        .await
        .unwrap();
    pool.report_outcome("10.0.0.1:1080", RouteOutcome::Throttled)
        .await
        .unwrap();
    assert_eq!(
        pool.get("10.0.0.1:1080").await.unwrap().consecutive_failures,
        0,
        "throttles within one selection are not failures"
    );

    // Handed out again and still throttled
    pool.select_route(&filter).await.unwrap();
    pool.report_outcome("10.0.0.1:1080", RouteOutcome::Throttled)
        .await
        .unwrap();
    let route = pool.get("10.0.0.1:1080").await.unwrap();
    assert_eq!(route.consecutive_failures, 1);
    assert_eq!(route.failure_count, 0, "throttles never count as hard failures");
}

#[tokio::test]
async fn test_unknown_route_outcome_is_an_error() {
    let pool = pool_with(vec![]).await;
    assert!(matches!(
        pool.report_outcome("nope:1", RouteOutcome::Success).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_duplicates_merge_metadata() {
    let pool = pool_with(vec![Route::new("10.0.0.1", 1080, ProtocolKind::Socks5)]).await;
    pool.report_outcome("10.0.0.1:1080", RouteOutcome::Success)
        .await
        .unwrap();

    let added = pool
        .add_routes(vec![
            Route::new("10.0.0.1", 1080, ProtocolKind::Socks5).with_country("FR"),
            Route::new("10.0.0.2", 1080, ProtocolKind::Socks5),
        ])
        .await;
    assert_eq!(added, 1);
    assert_eq!(pool.len().await, 2);

    let merged = pool.get("10.0.0.1:1080").await.unwrap();
    assert_eq!(merged.country_code.as_deref(), Some("FR"));
    assert_eq!(merged.success_count, 1, "health history survives a merge");
}

#[tokio::test]
async fn test_stats_and_reset_dead() {
    let pool = pool_with(vec![
        Route::new("10.0.0.1", 1080, ProtocolKind::Socks5).with_country("DE"),
        Route::new("10.0.0.2", 8080, ProtocolKind::Http),
    ])
    .await;
    for _ in 0..3 {
        pool.report_outcome("10.0.0.2:8080", RouteOutcome::Failure)
            .await
            .unwrap();
    }
    pool.report_outcome("10.0.0.1:1080", RouteOutcome::Success)
        .await
        .unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.active, 1);
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.by_protocol.get(&ProtocolKind::Http), Some(&1));
    assert_eq!(stats.by_country.get("DE"), Some(&1));
    assert!((stats.avg_success_rate - 0.5).abs() < 1e-9);

    assert_eq!(pool.reset_dead().await, 1);
    let revived = pool.get("10.0.0.2:8080").await.unwrap();
    assert_eq!(revived.state, RouteState::Active);
    assert_eq!(revived.failure_count, 0);
}

#[tokio::test]
async fn test_concurrent_reports_are_not_lost() {
    let pool = Arc::new(
        pool_with(vec![
            Route::new("10.0.0.1", 1080, ProtocolKind::Socks5),
            Route::new("10.0.0.2", 1080, ProtocolKind::Socks5),
        ])
        .await,
    );

    let mut handles = Vec::new();
    for i in 0..50 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let id = if i % 2 == 0 { "10.0.0.1:1080" } else { "10.0.0.2:1080" };
            pool.report_outcome(id, RouteOutcome::Success).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(pool.get("10.0.0.1:1080").await.unwrap().success_count, 25);
    assert_eq!(pool.get("10.0.0.2:1080").await.unwrap().success_count, 25);
}

#[test]
fn test_pick_index_weighted_draw_favors_heavy_routes() {
    let now = Utc::now();
    let weights = [0.05, 1.9];
    let used = [Some(now), Some(now)];
    let heavy = (0..1000).filter(|_| pick_index(&weights, &used) == 1).count();
    assert!(heavy > 900, "heavy route chosen {} times", heavy);
}

#[test]
fn test_protocol_inference() {
    assert_eq!(ProtocolKind::infer("proxy_socks5_list"), ProtocolKind::Socks5);
    assert_eq!(ProtocolKind::infer("SOCKS4"), ProtocolKind::Socks4);
    assert_eq!(ProtocolKind::infer("https_proxies"), ProtocolKind::Https);
    assert_eq!(ProtocolKind::infer("anything"), ProtocolKind::Http);
}
