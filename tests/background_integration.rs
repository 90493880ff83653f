//! Background core integration tests
//!
//! These tests drive the tracker, error sink, mail dispatcher and shutdown
//! coordinator together, using the in-memory mail transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::oneshot;

use membership_service::config::{MailConfig, ShutdownSettings};
use membership_service::documents::ManualGenerator;
use membership_service::error::{AppError, TaskError};
use membership_service::error_sink;
use membership_service::mail::{MailDispatcher, MailError, MemoryTransport, Message};
use membership_service::membership::{
    MembershipRepository, MembershipService, MemoryRepository, NewUser, Plan, RepositoryError,
    User,
};
use membership_service::shutdown::{
    start_background, BackgroundServices, ShutdownCoordinator, ShutdownState,
};
use membership_service::tasks::{TaskSpawner, TaskTracker};
use membership_service::template::TemplateStore;

fn start_with(transport: Arc<MemoryTransport>) -> (BackgroundServices, ShutdownCoordinator) {
    start_background(
        &MailConfig::default(),
        &ShutdownSettings::default(),
        transport,
        Arc::new(TemplateStore::new()),
    )
    .expect("background services should start")
}

fn message(to: &str, subject: &str) -> Message {
    Message::builder(to, subject)
        .data("hello")
        .build()
        .expect("valid message")
}

async fn wait_for_attempts(transport: &MemoryTransport, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.attempts() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("dispatcher should attempt delivery");
}

/// Increments a shared counter when the owning task ends, however it ends
struct EndMarker(Arc<AtomicUsize>);

impl Drop for EndMarker {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Task Tracker
// ============================================================================

#[tokio::test]
async fn test_wait_all_returns_after_mixed_tasks_end() {
    let (reporter, _sink) = error_sink::channel();
    let spawner = TaskSpawner::new(TaskTracker::new(), reporter);
    let ended = Arc::new(AtomicUsize::new(0));
    let total = 30;

    for i in 0..total {
        let marker = EndMarker(ended.clone());
        spawner
            .spawn("mixed", async move {
                let _marker = marker;
                tokio::time::sleep(Duration::from_millis((i % 5) as u64 * 5)).await;
                match i % 3 {
                    0 => Ok(()),
                    1 => Err(TaskError::Other(format!("task {} failed", i))),
                    _ => panic!("task {} panicked", i),
                }
            })
            .unwrap();
    }

    spawner.tracker().wait_all().await;

    assert_eq!(ended.load(Ordering::SeqCst), total);
    assert_eq!(spawner.tracker().in_flight(), 0);
}

#[tokio::test]
async fn test_wait_all_with_no_tasks_returns_immediately() {
    let tracker = TaskTracker::new();
    tokio::time::timeout(Duration::from_millis(100), tracker.wait_all())
        .await
        .expect("idle tracker should not block");
}

// ============================================================================
// Error Sink
// ============================================================================

#[tokio::test]
async fn test_errors_reported_before_drain_are_all_logged() {
    let (services, coordinator) = start_with(Arc::new(MemoryTransport::new()));

    for i in 0..25 {
        services
            .spawner
            .spawn("failing", async move {
                tokio::task::yield_now().await;
                Err(TaskError::Other(format!("failure {}", i)))
            })
            .unwrap();
    }

    services.shutdown.request_shutdown("test");
    let report = coordinator.run().await;

    assert_eq!(report.errors_logged, 25);
    assert_eq!(services.errors.reported(), 25);
    assert_eq!(services.errors.logged(), 25);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stress_no_error_lost_across_runs() {
    for run in 0..20 {
        let (services, coordinator) = start_with(Arc::new(MemoryTransport::new()));
        let coordinator = tokio::spawn(coordinator.run());

        let tasks = 100;
        for i in 0..tasks {
            services
                .spawner
                .spawn("stress", async move {
                    for _ in 0..(i % 4) {
                        tokio::task::yield_now().await;
                    }
                    // Reported as the very last thing before the task ends
                    Err(TaskError::Other(format!("run {} task {}", run, i)))
                })
                .unwrap();
        }

        services.shutdown.request_shutdown("stress");
        let report = coordinator.await.expect("coordinator should not panic");

        assert_eq!(report.errors_logged, tasks as u64, "run {}", run);
        assert_eq!(services.errors.logged(), tasks as u64, "run {}", run);
        assert_eq!(services.shutdown.state(), ShutdownState::Terminated);
    }
}

// ============================================================================
// Shutdown Coordinator
// ============================================================================

#[tokio::test]
async fn test_second_request_during_drain_has_no_effect() {
    let (services, coordinator) = start_with(Arc::new(MemoryTransport::new()));
    let (release_tx, release_rx) = oneshot::channel::<()>();

    services
        .spawner
        .spawn("slow", async move {
            let _ = release_rx.await;
            Ok(())
        })
        .unwrap();

    assert!(services.shutdown.request_shutdown("first"));
    let coordinator = tokio::spawn(coordinator.run());

    let mut state = services.shutdown.subscribe();
    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == ShutdownState::Draining),
    )
    .await
    .expect("coordinator should start draining")
    .expect("state channel open");

    assert!(!services.shutdown.request_shutdown("second"));
    assert_eq!(services.shutdown.state(), ShutdownState::Draining);
    assert!(!coordinator.is_finished());

    release_tx.send(()).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(2), coordinator)
        .await
        .expect("shutdown should finish once the task ends")
        .unwrap();

    assert!(!report.drain_timed_out);
    assert_eq!(services.shutdown.state(), ShutdownState::Terminated);
}

#[tokio::test]
async fn test_shutdown_waits_for_error_mail_and_sleep_tasks() {
    let transport = Arc::new(MemoryTransport::new());
    let (services, coordinator) = start_with(transport.clone());
    let started = Instant::now();

    services
        .spawner
        .spawn("reports_error", async {
            Err(TaskError::Other("expected failure".into()))
        })
        .unwrap();

    let mailer = services.mailer.clone();
    services
        .spawner
        .spawn("sends_mail", async move {
            mailer.send(message("user@example.com", "Hello")).await?;
            Ok(())
        })
        .unwrap();

    services
        .spawner
        .spawn("sleeps", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        })
        .unwrap();

    services.shutdown.request_shutdown("test");
    let report = coordinator.run().await;

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(report.errors_logged, 1);
    assert_eq!(report.mail_delivered, 1);
    assert_eq!(transport.sent_count(), 1);
    assert_eq!(services.tracker.in_flight(), 0);
}

#[tokio::test]
async fn test_shutdown_drops_mail_backlog() {
    let transport = Arc::new(MemoryTransport::with_delay(Duration::from_millis(200)));
    let (services, coordinator) = start_with(transport.clone());

    for i in 0..5 {
        services
            .mailer
            .send(message("user@example.com", &format!("Message {}", i)))
            .await
            .unwrap();
    }
    // The first message is in flight; four are still queued
    wait_for_attempts(&transport, 1).await;

    services.shutdown.request_shutdown("test");
    let report = coordinator.run().await;

    assert_eq!(report.mail_delivered, 1);
    assert_eq!(report.mail_dropped, 4);
    assert_eq!(report.errors_logged, 0);
    assert_eq!(transport.attempts(), 1);
    assert_eq!(services.mailer.stats().dropped_total, 4);
}

// ============================================================================
// Requests in flight across shutdown
// ============================================================================

/// Demo repository whose subscription write takes 100ms
struct SlowRepository {
    inner: MemoryRepository,
}

#[async_trait]
impl MembershipRepository for SlowRepository {
    async fn get_by_email(&self, email: &str) -> Result<User, RepositoryError> {
        self.inner.get_by_email(email).await
    }

    async fn get_one(&self, id: i64) -> Result<User, RepositoryError> {
        self.inner.get_one(id).await
    }

    async fn insert(&self, new_user: &NewUser) -> Result<User, RepositoryError> {
        self.inner.insert(new_user).await
    }

    async fn get_all(&self) -> Result<Vec<Plan>, RepositoryError> {
        self.inner.get_all().await
    }

    async fn get_plan(&self, id: i64) -> Result<Plan, RepositoryError> {
        self.inner.get_plan(id).await
    }

    async fn subscribe_user_to_plan(
        &self,
        user_id: i64,
        plan_id: i64,
    ) -> Result<(), RepositoryError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.inner.subscribe_user_to_plan(user_id, plan_id).await
    }
}

fn slow_membership(services: &BackgroundServices, dir: &std::path::Path) -> MembershipService {
    MembershipService::new(
        Arc::new(SlowRepository {
            inner: MemoryRepository::with_demo_data(),
        }),
        services.spawner.clone(),
        services.mailer.clone(),
        ManualGenerator::new(dir),
        services.shutdown.clone(),
    )
}

#[tokio::test]
async fn test_subscribe_in_flight_at_shutdown_is_drained() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let (services, coordinator) = start_with(transport.clone());
    let membership = slow_membership(&services, tmp.path());

    let request = tokio::spawn(async move {
        membership.subscribe_to_plan("admin@example.com", 3).await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    services.shutdown.request_shutdown("test");
    let report = coordinator.run().await;

    let user = request.await.unwrap().expect("request admitted before shutdown");
    assert_eq!(user.plan.map(|p| p.id), Some(3));

    // Both background tasks ran to completion inside the drain: their mails
    // were queued, and each was either delivered or counted as backlog.
    assert_eq!(services.shutdown.state(), ShutdownState::Terminated);
    assert_eq!(services.tracker.in_flight(), 0);
    assert_eq!(services.mailer.stats().queued_total, 2);
    assert_eq!(report.mail_delivered + report.mail_dropped, 2);
    assert_eq!(report.mail_failed, 0);
    assert_eq!(report.errors_logged, 0);
    assert_eq!(services.errors.reported(), 0);
    assert!(report.drain_duration >= Duration::from_millis(50));
}

#[tokio::test]
async fn test_subscribe_after_drain_started_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let (services, coordinator) = start_with(transport.clone());
    let membership = slow_membership(&services, tmp.path());

    // Hold the drain open so the request lands while it is in progress
    let (release_tx, release_rx) = oneshot::channel::<()>();
    services
        .spawner
        .spawn("holds_drain", async move {
            let _ = release_rx.await;
            Ok(())
        })
        .unwrap();

    services.shutdown.request_shutdown("test");
    let coordinator = tokio::spawn(coordinator.run());
    let mut state = services.shutdown.subscribe();
    state
        .wait_for(|s| *s == ShutdownState::Draining)
        .await
        .unwrap();

    let err = membership
        .subscribe_to_plan("admin@example.com", 3)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unavailable(_)));
    assert_eq!(services.tracker.in_flight(), 1);

    release_tx.send(()).unwrap();
    let report = coordinator.await.unwrap();
    assert_eq!(report.mail_delivered + report.mail_dropped, 0);
    assert_eq!(services.mailer.stats().queued_total, 0);
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn test_spawns_after_close_are_refused() {
    let (services, coordinator) = start_with(Arc::new(MemoryTransport::new()));

    services.shutdown.request_shutdown("test");
    coordinator.run().await;

    assert!(services.tracker.is_closed());
    assert!(services.spawner.spawn("late", async { Ok(()) }).is_err());
    assert!(services
        .mailer
        .send_tracked(&services.spawner, message("user@example.com", "Late"))
        .is_err());
    assert_eq!(services.tracker.in_flight(), 0);
}

// ============================================================================
// Mail backpressure
// ============================================================================

#[tokio::test]
async fn test_queue_applies_backpressure_at_capacity() {
    let transport = Arc::new(MemoryTransport::new());
    let (reporter, _sink) = error_sink::channel();
    let (dispatcher, mailer) = MailDispatcher::new(
        &MailConfig::default(),
        transport.clone(),
        Arc::new(TemplateStore::new()),
        reporter,
    )
    .unwrap();
    assert_eq!(mailer.capacity(), 100);

    let completed = Arc::new(AtomicUsize::new(0));
    let mut producers = Vec::new();
    for i in 0..150 {
        let mailer = mailer.clone();
        let completed = completed.clone();
        producers.push(tokio::spawn(async move {
            mailer
                .send(message("user@example.com", &format!("Message {}", i)))
                .await
                .unwrap();
            completed.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // No consumer yet: exactly the capacity gets through
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(completed.load(Ordering::SeqCst), 100);
    assert_eq!(mailer.pending(), 100);
    assert!(matches!(
        mailer.try_send(message("user@example.com", "Extra")),
        Err(MailError::QueueFull)
    ));

    let mut blocked = tokio_test::task::spawn(mailer.send(message("user@example.com", "Extra")));
    tokio_test::assert_pending!(blocked.poll());
    drop(blocked);

    let (done_tx, done_rx) = oneshot::channel();
    let dispatcher = tokio::spawn(dispatcher.run(done_rx));

    for producer in producers {
        producer.await.unwrap();
    }
    wait_for_attempts(&transport, 150).await;

    done_tx.send(()).unwrap();
    let summary = dispatcher.await.unwrap();

    assert_eq!(completed.load(Ordering::SeqCst), 150);
    assert_eq!(summary.delivered, 150);
    assert_eq!(summary.dropped, 0);
    assert_eq!(transport.sent_count(), 150);
}
