/// Randomized tests for usage accounting
///
/// Random traffic is recorded from many concurrent tasks while syncs run
/// and fail at random. Whatever the interleaving, every recorded byte must
/// be delivered exactly once.
mod common;

use common::{client_endpoint, credentials, session_config, MockAccessManager, MockClientStream};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tunnel_core::session::{SessionManager, SessionStatus};
use tunnel_core::usage::Traffic;

/// 并发记录与同步交错，最终上报总量等于记录总量
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_usage_conservation_under_concurrent_sync() {
    let mock = MockAccessManager::new();
    let manager = Arc::new(SessionManager::new(mock.clone(), session_config()));
    let ep = client_endpoint();
    let session = manager.create_or_get(&credentials("c1"), ep).await.unwrap();
    for i in 0..4 {
        manager
            .admit_stream(session.id(), &format!("s{}", i), MockClientStream::new(), ep)
            .unwrap();
    }

    let mut writers = Vec::new();
    for _ in 0..4 {
        let manager = manager.clone();
        let id = session.id();
        writers.push(tokio::spawn(async move {
            let mut recorded = Traffic::default();
            for _ in 0..500 {
                let (sent, received) = {
                    let mut rng = rand::rng();
                    (rng.random_range(0..10_000u64), rng.random_range(0..10_000u64))
                };
                manager.record_usage(id, sent, received).unwrap();
                recorded += Traffic::new(sent, received);
                if sent % 7 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            recorded
        }));
    }

    let syncer = {
        let manager = manager.clone();
        let mock = mock.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let fail = rand::rng().random_bool(0.3);
                mock.set_fail_reports(fail);
                manager.sync_all().await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            mock.set_fail_reports(false);
        })
    };

    let mut expected = Traffic::default();
    for writer in writers {
        expected += writer.await.unwrap();
    }
    syncer.await.unwrap();

    manager.shutdown().await;
    assert_eq!(session.status(), SessionStatus::Disposed);
    assert_eq!(mock.delivered_total(session.id()), expected);
    assert_eq!(session.total_usage(), expected);
}

/// 随机的接入、分离和用量操作不会让会话进入非法状态
#[tokio::test]
async fn test_random_stream_operations() {
    let mock = MockAccessManager::new();
    let manager = SessionManager::new(mock.clone(), session_config());
    let ep = client_endpoint();
    let session = manager.create_or_get(&credentials("c1"), ep).await.unwrap();

    let mut rng = rand::rng();
    let mut attached: Vec<String> = Vec::new();
    let mut expected = Traffic::default();

    for step in 0..1000 {
        match rng.random_range(0..4) {
            0 => {
                let id = format!("s{}", rng.random_range(0..20));
                let result = manager.admit_stream(session.id(), &id, MockClientStream::new(), ep);
                if attached.contains(&id) {
                    assert!(result.is_err(), "step {}: duplicate {} accepted", step, id);
                } else {
                    result.unwrap();
                    attached.push(id);
                }
            }
            1 if !attached.is_empty() => {
                let id = attached.swap_remove(rng.random_range(0..attached.len()));
                manager
                    .detach_stream(session.id(), &id, rng.random_bool(0.5))
                    .await
                    .unwrap();
            }
            2 => {
                let (sent, received) = (rng.random_range(0..1000), rng.random_range(0..1000));
                manager.record_usage(session.id(), sent, received).unwrap();
                expected += Traffic::new(sent, received);
            }
            _ => {
                manager.sync_all().await;
            }
        }

        assert_eq!(session.stream_count(), attached.len());
        if !attached.is_empty() {
            assert_eq!(session.status(), SessionStatus::Active);
        }
    }

    manager.shutdown().await;
    assert_eq!(session.stream_count(), 0);
    assert_eq!(mock.delivered_total(session.id()), expected);
}
