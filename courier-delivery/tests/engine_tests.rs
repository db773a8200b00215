//! End-to-end delivery pipeline tests against a scripted SMTP server.

mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use courier_common::EmailAddress;
use courier_delivery::{
    DeliveryEngine, DeliveryJob, EngineConfig, JobId, MemorySink, Priority,
    SuppressionReason, SuppressionScope, TerminalStatus, WebhookEvent,
};
use courier_delivery::warmup::{WarmupSchedule, WarmupStep};

use support::mock_server::{MockSmtpServer, ReceivedCommand};

const TEST_DOMAIN: &str = "example.com";

fn test_config(server: SocketAddr) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.workers = 2;
    config.helo_hostname = "sender.example".to_owned();
    config.claim_wait_ms = 50;
    config
        .resolver
        .mx_overrides
        .insert(TEST_DOMAIN.to_owned(), server.to_string());
    config
}

fn test_engine(config: EngineConfig) -> (Arc<DeliveryEngine>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let engine = DeliveryEngine::new(config, sink.clone(), sink.clone())
        .expect("engine construction");
    (Arc::new(engine), sink)
}

fn job_to(recipient: &str) -> DeliveryJob {
    DeliveryJob {
        id: JobId::generate(),
        sender: EmailAddress::parse("news@sender.example").unwrap(),
        sender_name: Some("Example News".into()),
        recipient: EmailAddress::parse(recipient).unwrap(),
        subject: "Weekly update".into(),
        html_body: None,
        text_body: Some("hello there".into()),
        account_id: "acct-1".into(),
        campaign_id: None,
        priority: Priority::Bulk,
        retry_count: 0,
        created_at: SystemTime::now(),
    }
}

#[tokio::test]
async fn happy_path_delivers_and_reports_sent() {
    let server = MockSmtpServer::start().await.unwrap();
    let (engine, sink) = test_engine(test_config(server.addr()));

    let job = job_to("user@example.com");
    let job_id = job.id;
    engine.process_job(job).await;

    assert_eq!(sink.status_of(job_id), Some(TerminalStatus::Sent));
    let update = &sink.updates()[0];
    assert!(update.tracking_id.is_some());

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, WebhookEvent::SENT);

    let messages = server.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Subject: Weekly update"));
    assert!(messages[0].contains("From: Example News <news@sender.example>"));
}

#[tokio::test]
async fn dot_lines_in_the_body_survive_the_data_phase() {
    let server = MockSmtpServer::start().await.unwrap();
    let (engine, sink) = test_engine(test_config(server.addr()));

    let mut job = job_to("user@example.com");
    job.text_body = Some("before\n.\nafter\n.starts with a dot".into());
    let job_id = job.id;
    engine.process_job(job).await;

    assert_eq!(sink.status_of(job_id), Some(TerminalStatus::Sent));

    let messages = server.messages().await;
    assert_eq!(messages.len(), 1);
    // Everything after the lone dot line must still arrive, and the
    // stuffing dots must not leak into the stored body.
    assert!(messages[0].contains("before\r\n.\r\nafter\r\n.starts with a dot\r\n"));
}

#[tokio::test]
async fn suppressed_recipient_never_touches_the_network() {
    let server = MockSmtpServer::start().await.unwrap();
    let (engine, sink) = test_engine(test_config(server.addr()));

    let job = job_to("blocked@example.com");
    let job_id = job.id;
    engine.suppression().add(
        &job.recipient,
        SuppressionScope::Global,
        SuppressionReason::HardBounce,
    );

    engine.process_job(job).await;

    assert_eq!(sink.status_of(job_id), Some(TerminalStatus::Suppressed));
    assert_eq!(server.connections(), 0);
    // No quota consumed either.
    assert_eq!(engine.limiter().sent_today("sender.example", chrono::Utc::now()), 0);
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn account_scoped_suppression_blocks_only_that_account() {
    let server = MockSmtpServer::start().await.unwrap();
    let (engine, sink) = test_engine(test_config(server.addr()));

    let recipient = EmailAddress::parse("optout@example.com").unwrap();
    engine.suppression().add(
        &recipient,
        SuppressionScope::Account("acct-1".into()),
        SuppressionReason::Manual,
    );

    let blocked = job_to("optout@example.com");
    let blocked_id = blocked.id;
    engine.process_job(blocked).await;
    assert_eq!(sink.status_of(blocked_id), Some(TerminalStatus::Suppressed));

    let mut allowed = job_to("optout@example.com");
    allowed.account_id = "acct-2".into();
    let allowed_id = allowed.id;
    engine.process_job(allowed).await;
    assert_eq!(sink.status_of(allowed_id), Some(TerminalStatus::Sent));
}

#[tokio::test]
async fn hard_bounce_suppresses_globally_and_blocks_the_next_job() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response(550, "5.1.1 User unknown")
        .build()
        .await
        .unwrap();
    let (engine, sink) = test_engine(test_config(server.addr()));

    let first = job_to("gone@example.com");
    let first_id = first.id;
    let recipient = first.recipient.clone();
    engine.process_job(first).await;

    assert_eq!(sink.status_of(first_id), Some(TerminalStatus::Bounced));
    assert!(engine.suppression().is_suppressed(&recipient, "acct-1"));
    // Global scope: every other account is blocked too.
    assert!(engine.suppression().is_suppressed(&recipient, "acct-2"));

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, WebhookEvent::BOUNCED);

    // A second job to the same address is rejected before the network.
    let connections_before = server.connections();
    let second = job_to("gone@example.com");
    let second_id = second.id;
    engine.process_job(second).await;

    assert_eq!(sink.status_of(second_id), Some(TerminalStatus::Suppressed));
    assert_eq!(server.connections(), connections_before);
}

#[tokio::test]
async fn complaint_fires_the_complaint_event() {
    let server = MockSmtpServer::builder()
        .with_data_end_response(550, "message refused, recipient filed an abuse report")
        .build()
        .await
        .unwrap();
    let (engine, sink) = test_engine(test_config(server.addr()));

    let job = job_to("angry@example.com");
    let recipient = job.recipient.clone();
    engine.process_job(job).await;

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, WebhookEvent::COMPLAINT);
    assert!(engine.suppression().is_suppressed(&recipient, "acct-1"));
}

#[tokio::test]
async fn soft_bounce_requeues_without_suppressing() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response(452, "4.2.2 Mailbox full")
        .build()
        .await
        .unwrap();
    let (engine, sink) = test_engine(test_config(server.addr()));

    let job = job_to("full@example.com");
    let job_id = job.id;
    let recipient = job.recipient.clone();
    engine.process_job(job).await;

    // Not terminal: the job is parked for a retry.
    assert_eq!(sink.status_of(job_id), None);
    assert_eq!(engine.queue().len(), 1);
    assert!(!engine.suppression().is_suppressed(&recipient, "acct-1"));
    assert!(sink.events().is_empty());
}

#[tokio::test]
async fn exhausted_retries_finalize_as_failed() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response(452, "4.2.2 Mailbox full")
        .build()
        .await
        .unwrap();
    let mut config = test_config(server.addr());
    config.retry.max_attempts = 1;
    let (engine, sink) = test_engine(config);

    let job = job_to("full@example.com");
    let job_id = job.id;
    engine.process_job(job).await;

    assert_eq!(sink.status_of(job_id), Some(TerminalStatus::Failed));
    assert_eq!(engine.queue().len(), 0);
    let update = sink.updates().into_iter().find(|u| u.job_id == job_id).unwrap();
    assert!(update.detail.unwrap().contains("452"));
}

#[tokio::test]
async fn sequential_deliveries_reuse_one_connection() {
    let server = MockSmtpServer::start().await.unwrap();
    let (engine, sink) = test_engine(test_config(server.addr()));

    for i in 0..3 {
        engine.process_job(job_to(&format!("user{i}@example.com"))).await;
    }

    assert_eq!(sink.updates().len(), 3);
    assert!(sink.updates().iter().all(|u| u.status == TerminalStatus::Sent));
    assert_eq!(server.connections(), 1);

    let snapshot = engine.pool().snapshot();
    assert_eq!(snapshot.created, 1);
    assert_eq!(snapshot.reused, 2);
}

#[tokio::test]
async fn saturated_domain_defers_jobs_without_losing_them() {
    let server = MockSmtpServer::start().await.unwrap();
    let mut config = test_config(server.addr());
    config.rate_limits.domain_overrides.insert(TEST_DOMAIN.to_owned(), 2);
    // Never sleep through saturation inline; requeue immediately.
    config.max_inline_wait_ms = 0;
    let (engine, sink) = test_engine(config);

    for i in 0..5 {
        engine.process_job(job_to(&format!("user{i}@example.com"))).await;
    }

    let sent = sink
        .updates()
        .iter()
        .filter(|u| u.status == TerminalStatus::Sent)
        .count();
    assert_eq!(sent, 2);
    // The three refused jobs are parked, not dropped.
    assert_eq!(engine.queue().len(), 3);
}

#[tokio::test]
async fn warmup_allowance_defers_the_overflow() {
    let server = MockSmtpServer::start().await.unwrap();
    let mut config = test_config(server.addr());
    config.warmup = WarmupSchedule::from_steps(&[WarmupStep {
        day: 1,
        limit: Some(5),
    }]);
    let (engine, sink) = test_engine(config);

    for i in 0..8 {
        engine.process_job(job_to(&format!("user{i}@example.com"))).await;
    }

    let sent = sink
        .updates()
        .iter()
        .filter(|u| u.status == TerminalStatus::Sent)
        .count();
    assert_eq!(sent, 5);
    assert_eq!(engine.queue().len(), 3);
    assert_eq!(
        engine.limiter().sent_today("sender.example", chrono::Utc::now()),
        5
    );
}

#[tokio::test]
async fn replayed_terminal_outcomes_do_not_double_count() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response(550, "5.1.1 User unknown")
        .build()
        .await
        .unwrap();
    let (engine, sink) = test_engine(test_config(server.addr()));

    let job = job_to("gone@example.com");
    let recipient = job.recipient.clone();
    let replay = job.clone();

    engine.process_job(job).await;
    engine.process_job(replay).await;

    assert_eq!(sink.updates().len(), 1);
    assert_eq!(sink.events().len(), 1);
    let record = engine
        .suppression()
        .record(&recipient, &SuppressionScope::Global)
        .unwrap();
    assert_eq!(record.bounce_count, 1);
}

#[tokio::test]
async fn mid_transaction_disconnect_is_retried() {
    // Connection dies after EHLO + MAIL, mid-envelope.
    let server = MockSmtpServer::builder()
        .with_drop_after_commands(2)
        .build()
        .await
        .unwrap();
    let (engine, sink) = test_engine(test_config(server.addr()));

    let job = job_to("user@example.com");
    let job_id = job.id;
    engine.process_job(job).await;

    assert_eq!(sink.status_of(job_id), None);
    assert_eq!(engine.queue().len(), 1);
}

#[tokio::test]
async fn worker_pool_drains_the_queue_end_to_end() {
    let server = MockSmtpServer::start().await.unwrap();
    let (engine, sink) = test_engine(test_config(server.addr()));

    for i in 0..6 {
        engine.queue().enqueue(job_to(&format!("user{i}@example.com")));
    }

    let runner = tokio::spawn(Arc::clone(&engine).run());

    // Poll until everything is finalized or we give up.
    for _ in 0..100 {
        if sink.updates().len() == 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    engine.shutdown();
    runner.await.unwrap();

    let updates = sink.updates();
    assert_eq!(updates.len(), 6);
    assert!(updates.iter().all(|u| u.status == TerminalStatus::Sent));
    assert!(engine.queue().is_empty());

    // Every delivery went through the envelope on the wire.
    let rcpts = server
        .commands()
        .await
        .into_iter()
        .filter(|c| matches!(c, ReceivedCommand::RcptTo(_)))
        .count();
    assert_eq!(rcpts, 6);
}
