use std::time::Duration;

use bookshelf::book::Book;
use bookshelf_core::{
    run_daemon, BackoffStrategy, BrokerError, ConnectionHandle, ConnectionSupervisor,
    ReconnectPolicy, Repository, RequestContext, SupervisorState,
};
use tests_common::{start_fake, FakeConnector, FakeDatabase, FakeSession};
use tokio::time::{sleep, timeout, Instant};

/// Poll until `cond` holds. Fails the test after a minute of (possibly virtual) time.
async fn eventually(mut cond: impl FnMut() -> bool) {
    timeout(Duration::from_secs(60), async {
        while !cond() {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn reconnected(handle: &ConnectionHandle<FakeSession>, attempts: u64) {
    eventually(|| {
        handle.reconnect_attempts() >= attempts && handle.state() == SupervisorState::Connected
    })
    .await;
}

#[tokio::test]
async fn start_installs_a_session_and_is_idempotent() {
    let mut stack = start_fake(ReconnectPolicy::default()).await.unwrap();
    assert_eq!(stack.handle.state(), SupervisorState::Connected);
    assert_eq!(stack.supervisor.state(), SupervisorState::Connected);

    stack.supervisor.start().await.unwrap();
    assert_eq!(stack.connector.attempts(), 1);
    assert_eq!(stack.handle.current().unwrap().generation(), 1);
}

#[tokio::test]
async fn refused_initial_connection_is_not_retried() {
    let connector = FakeConnector::new(FakeDatabase::new());
    connector.refuse_next(1);
    let mut supervisor = ConnectionSupervisor::new(connector.clone(), ReconnectPolicy::default());

    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, BrokerError::Connection { .. }), "{err:?}");
    assert_eq!(supervisor.state(), SupervisorState::Disconnected);
    assert_eq!(connector.attempts(), 1);
    assert!(matches!(
        supervisor.handle().lease().await,
        Err(BrokerError::ConnectionUnavailable { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn hanging_handshake_times_out() {
    let connector = FakeConnector::new(FakeDatabase::new());
    connector.set_hang(true);
    let policy = ReconnectPolicy::default().with_connect_timeout(Duration::from_secs(2));
    let mut supervisor = ConnectionSupervisor::new(connector, policy);

    let started = Instant::now();
    let err = supervisor.start().await.unwrap_err();
    assert!(matches!(err, BrokerError::Connection { .. }), "{err:?}");
    assert!(err.describe().contains("timed out"), "{}", err.describe());
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(supervisor.state(), SupervisorState::Disconnected);
}

#[tokio::test]
async fn lost_session_is_replaced() {
    let stack = start_fake(ReconnectPolicy::fixed(Duration::from_millis(20)))
        .await
        .unwrap();
    let repo = stack.repository();
    let mut ctx = RequestContext::new();
    repo.insert(&mut ctx, &Book::new("Solaris", "Stanislaw Lem"))
        .await
        .unwrap();

    stack.connector.sever();
    reconnected(&stack.handle, 1).await;

    assert_eq!(stack.connector.attempts(), 2);
    assert_eq!(stack.handle.current().unwrap().generation(), 2);
    let books = repo.list(&mut ctx).await.unwrap();
    assert_eq!(books.len(), 1);
}

#[tokio::test]
async fn every_loss_in_a_sequence_is_recovered() {
    let stack = start_fake(ReconnectPolicy::fixed(Duration::from_millis(20)))
        .await
        .unwrap();
    let repo = stack.repository();
    let mut ctx = RequestContext::new();

    for round in 1..=5u64 {
        let before = stack.handle.current().unwrap().generation();
        stack.connector.sever();
        reconnected(&stack.handle, round).await;

        assert_eq!(stack.handle.reconnect_attempts(), round);
        assert_eq!(stack.handle.state(), SupervisorState::Connected);
        assert!(stack.handle.current().unwrap().generation() > before);
        repo.insert(&mut ctx, &Book::new(format!("Volume {round}"), "Nobody"))
            .await
            .unwrap();
    }
    assert_eq!(stack.connector.attempts(), 6);
    assert_eq!(repo.list(&mut ctx).await.unwrap().len(), 5);
}

#[tokio::test(start_paused = true)]
async fn requests_fail_fast_during_backoff() {
    let stack = start_fake(ReconnectPolicy::default()).await.unwrap();
    let repo = stack.repository();
    let lost_at = Instant::now();

    stack.connector.sever();
    eventually(|| stack.handle.state() == SupervisorState::Disconnected).await;

    let mut ctx = RequestContext::new();
    let err = repo.list(&mut ctx).await.unwrap_err();
    assert!(matches!(err, BrokerError::ConnectionUnavailable { .. }), "{err:?}");
    assert!(err.is_connection_loss());

    stack.handle.wait_for(SupervisorState::Connected).await;
    assert!(lost_at.elapsed() >= Duration::from_secs(10));
    assert_eq!(stack.handle.reconnect_attempts(), 1);
    repo.list(&mut ctx).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retries_until_the_database_accepts_again() {
    let policy = ReconnectPolicy {
        backoff: Duration::from_secs(1),
        strategy: BackoffStrategy::Exponential {
            max: Duration::from_secs(3),
        },
        connect_timeout: Duration::from_secs(1),
    };
    let stack = start_fake(policy).await.unwrap();
    let lost_at = Instant::now();

    stack.connector.refuse_next(2);
    stack.connector.sever();
    reconnected(&stack.handle, 3).await;

    // 1s + 2s + 3s (capped) of backoff before the third attempt succeeds.
    assert!(lost_at.elapsed() >= Duration::from_secs(6));
    assert_eq!(stack.handle.reconnect_attempts(), 3);
    assert_eq!(stack.connector.attempts(), 4);
}

#[tokio::test]
async fn stale_loss_reports_are_ignored() {
    let stack = start_fake(ReconnectPolicy::fixed(Duration::from_millis(20)))
        .await
        .unwrap();
    let generation = stack.handle.current().unwrap().generation();

    stack.handle.report_loss(generation + 41, "report from a session that never existed");
    sleep(Duration::from_millis(100)).await;

    assert_eq!(stack.handle.state(), SupervisorState::Connected);
    assert_eq!(stack.handle.reconnect_attempts(), 0);
    assert_eq!(stack.connector.attempts(), 1);

    stack.connector.sever();
    reconnected(&stack.handle, 1).await;
    // The first session's generation is stale now.
    stack.handle.report_loss(generation, "late report");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(stack.handle.reconnect_attempts(), 1);
    assert_eq!(stack.handle.state(), SupervisorState::Connected);
}

#[tokio::test]
async fn stop_closes_the_session_and_is_idempotent() {
    let mut stack = start_fake(ReconnectPolicy::default()).await.unwrap();
    let slot = stack.handle.current().unwrap();

    stack.supervisor.stop().await.unwrap();
    stack.supervisor.stop().await.unwrap();

    assert_eq!(stack.handle.state(), SupervisorState::Disconnected);
    assert!(matches!(
        stack.handle.lease().await,
        Err(BrokerError::ConnectionUnavailable { .. })
    ));
    let lease = slot.lease().await;
    assert!(bookshelf_core::Session::is_closed(&*lease));
}

#[tokio::test]
async fn state_changes_are_published() {
    let stack = start_fake(ReconnectPolicy::fixed(Duration::from_millis(50)))
        .await
        .unwrap();
    let mut states = stack.handle.subscribe();
    assert_eq!(*states.borrow_and_update(), SupervisorState::Connected);

    stack.connector.sever();
    states
        .wait_for(|s| *s != SupervisorState::Connected)
        .await
        .unwrap();
    timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == SupervisorState::Connected),
    )
    .await
    .expect("reconnect")
    .unwrap();
}

#[tokio::test]
async fn supervisor_runs_as_a_daemon() {
    let db = FakeDatabase::new();
    let mut supervisor = ConnectionSupervisor::new(FakeConnector::new(db), ReconnectPolicy::default());
    let handle = supervisor.handle();

    run_daemon(&mut supervisor, async {
        assert_eq!(handle.state(), SupervisorState::Connected);
    })
    .await
    .unwrap();
    assert_eq!(handle.state(), SupervisorState::Disconnected);
}
