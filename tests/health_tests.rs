mod common;

#[cfg(test)]
mod health_tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use cslb::Config;

    use crate::common::{test_balancer, MockDialer, MockResolver, TestHttpServer};

    #[tokio::test]
    async fn test_good_then_failed_dial_round_trip() {
        let resolver = MockResolver::new();
        let dialer = MockDialer::new().await;
        let config = Config {
            disable_health_checks: true,
            ..Default::default()
        };
        let balancer = test_balancer(config, resolver, dialer);

        let now = Instant::now();
        balancer.record_dial(now, "s1.example.net", 443, None).await;
        balancer
            .record_dial(now, "s1.example.net", 443, Some("connection reset"))
            .await;

        let snapshot = balancer.health_snapshot().await;
        let entry = snapshot
            .iter()
            .find(|e| e.target == "s1.example.net:443")
            .expect("record exists");
        assert_eq!(entry.good_dials, 1);
        assert_eq!(entry.failed_dials, 1);
        assert!(entry.next_dial_in_secs > 0, "veto must be armed");
        assert!(!entry.is_good);
        assert_eq!(entry.last_dial_status, "connection reset");
    }

    #[tokio::test]
    async fn test_cleaner_sweeps_expired_records() {
        let resolver = MockResolver::new();
        let dialer = MockDialer::new().await;
        let config = Config {
            disable_health_checks: true,
            health_ttl: Duration::from_secs(1),
            ..Default::default()
        };
        let balancer = test_balancer(config, resolver, dialer);
        balancer.start().await;

        let now = Instant::now();
        balancer.record_dial(now, "residual.example.net", 443, Some("seed")).await;
        for i in 0..20 {
            balancer
                .record_dial(now, &format!("{i}.example.net"), 80, None)
                .await;
        }
        assert_eq!(balancer.health_cache_len().await, 21);

        // TTL 1s, cleaner interval TTL/5 + 1s: two ticks fit in 2.6s.
        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert_eq!(balancer.health_cache_len().await, 0);

        balancer
            .record_dial(Instant::now(), "fresh.example.net", 80, None)
            .await;
        assert_eq!(balancer.health_cache_len().await, 1);
        balancer.shutdown();
    }

    // A target that advertises a probe URL in TXT gets checked shortly after
    // it enters the cache, and the verdict follows the body content both
    // ways.
    #[tokio::test]
    async fn test_prober_follows_body_content() {
        let server = TestHttpServer::start("hc1", "payload", "all OK here").await;
        let port = server.port();

        let resolver = MockResolver::new();
        resolver.append_srv("http", "tcp", "probed.example.net", "localhost", port, 10, 10);
        // TXT strings arrive in pieces and must be concatenated.
        let url = format!("http://127.0.0.1:{port}/health");
        let (head, tail) = url.split_at(url.len() / 2);
        resolver.append_txt(&format!("_{port}._cslb.localhost"), &[head, tail]);

        let dialer = MockDialer::new().await;
        let config = Config {
            health_check_frequency: Duration::from_secs(1),
            ..Default::default()
        };
        let balancer = test_balancer(config, Arc::clone(&resolver), dialer);

        // Entering the SRV cache spawns the prober.
        balancer
            .lookup_srv(Instant::now(), "http", "tcp", "probed.example.net")
            .await;

        // First probe fires after ~1s.
        tokio::time::sleep(Duration::from_millis(1600)).await;
        let key = format!("localhost:{port}");
        let entry = balancer
            .health_snapshot()
            .await
            .into_iter()
            .find(|e| e.target == key)
            .expect("record exists");
        assert!(server.hc_hits() >= 1, "probe never reached the server");
        assert!(entry.is_good, "healthy body should keep the target good");
        assert_eq!(entry.probe_url, url);
        assert!(entry.last_health_check_status.contains("200"));

        // An OK-less body rotates the target out...
        server.set_hc_body("definitely not the phrase");
        tokio::time::sleep(Duration::from_millis(1300)).await;
        let entry = balancer
            .health_snapshot()
            .await
            .into_iter()
            .find(|e| e.target == key)
            .expect("record exists");
        assert!(!entry.is_good, "non-matching body must mark unhealthy");

        // ...and a later OK body rotates it back in.
        server.set_hc_body("feeling OK again");
        tokio::time::sleep(Duration::from_millis(1300)).await;
        let entry = balancer
            .health_snapshot()
            .await
            .into_iter()
            .find(|e| e.target == key)
            .expect("record exists");
        assert!(entry.is_good, "matching body must restore health");

        server.shutdown();
        balancer.shutdown();
    }

    // A transport-level probe failure is terminal: the target goes unhealthy
    // and the prober stops asking.
    #[tokio::test]
    async fn test_prober_transport_failure_is_terminal() {
        let server = TestHttpServer::start("hc2", "payload", "OK").await;
        let port = server.port();

        let resolver = MockResolver::new();
        resolver.append_srv("http", "tcp", "dying.example.net", "localhost", port, 10, 10);
        resolver.append_txt(
            &format!("_{port}._cslb.localhost"),
            &[&format!("http://127.0.0.1:{port}/health")],
        );

        let dialer = MockDialer::new().await;
        let config = Config {
            health_check_frequency: Duration::from_secs(1),
            ..Default::default()
        };
        let balancer = test_balancer(config, Arc::clone(&resolver), dialer);
        balancer
            .lookup_srv(Instant::now(), "http", "tcp", "dying.example.net")
            .await;

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(server.hc_hits() >= 1);

        server.shutdown();
        tokio::time::sleep(Duration::from_millis(1300)).await;

        let key = format!("localhost:{port}");
        let entry = balancer
            .health_snapshot()
            .await
            .into_iter()
            .find(|e| e.target == key)
            .expect("record exists");
        assert!(!entry.is_good, "dead probe endpoint must mark unhealthy");

        // The worker exited: the verdict must not flip back by itself.
        let hits_after_death = server.hc_hits();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(server.hc_hits(), hits_after_death, "prober kept running");
        let entry = balancer
            .health_snapshot()
            .await
            .into_iter()
            .find(|e| e.target == key)
            .expect("record exists");
        assert!(!entry.is_good);
        balancer.shutdown();
    }

    #[tokio::test]
    async fn test_missing_or_malformed_txt_disables_probing() {
        let resolver = MockResolver::new();
        resolver.append_srv("http", "tcp", "quiet.example.net", "s1.example.net", 80, 10, 10);
        resolver.append_srv("http", "tcp", "quiet.example.net", "s2.example.net", 80, 10, 10);
        // s1 has no TXT at all; s2 has one that does not parse as a URL.
        resolver.append_txt("_80._cslb.s2.example.net", &["http:\nnot a url"]);

        let dialer = MockDialer::new().await;
        let config = Config {
            health_check_frequency: Duration::from_secs(1),
            ..Default::default()
        };
        let balancer = test_balancer(config, Arc::clone(&resolver), dialer);
        balancer
            .lookup_srv(Instant::now(), "http", "tcp", "quiet.example.net")
            .await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let snapshot = balancer.health_snapshot().await;
        for target in ["s1.example.net:80", "s2.example.net:80"] {
            let entry = snapshot
                .iter()
                .find(|e| e.target == target)
                .expect("record exists");
            assert!(entry.is_good, "{target} must stay good without a probe");
            assert!(
                entry.last_health_check_status.is_empty(),
                "{target} must never have been probed"
            );
        }
        balancer.shutdown();
    }

    // Probers notice record expiry and stop within one frequency tick.
    #[tokio::test]
    async fn test_prober_exits_after_record_expiry() {
        let server = TestHttpServer::start("hc3", "payload", "OK").await;
        let port = server.port();

        let resolver = MockResolver::new();
        resolver.append_srv("http", "tcp", "short.example.net", "localhost", port, 10, 10);
        resolver.append_txt(
            &format!("_{port}._cslb.localhost"),
            &[&format!("http://127.0.0.1:{port}/health")],
        );

        let dialer = MockDialer::new().await;
        let config = Config {
            health_check_frequency: Duration::from_secs(1),
            health_ttl: Duration::from_secs(2),
            ..Default::default()
        };
        let balancer = test_balancer(config, Arc::clone(&resolver), dialer);
        balancer
            .lookup_srv(Instant::now(), "http", "tcp", "short.example.net")
            .await;

        // Record expires at t=2s; the prober may land one probe at t=1s but
        // must be gone by t=3s.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        let hits_at_expiry = server.hc_hits();
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(
            server.hc_hits(),
            hits_at_expiry,
            "prober outlived its record's expiry"
        );
        server.shutdown();
        balancer.shutdown();
    }
}
