//! Pairing workflow: attempt budget, expiry and stale events.

use std::time::Duration;

use convobridge::reliability::ReliabilityError;
use convobridge::tenant::TenantStore;

mod common;

use common::{FakeSession, Harness, TENANT, console_config, run_for, settle};

const CONVERSATION: u64 = 42;

async fn request(h: &Harness) -> Result<u32, ReliabilityError> {
    h.bridge
        .request_pairing(TENANT, CONVERSATION, &console_config())
        .await
        .map(|attempt| attempt.number())
}

// ============================================================================
// Attempt budget
// ============================================================================

#[tokio::test(start_paused = true)]
async fn sixth_request_is_refused_without_a_challenge() {
    let h = Harness::new();

    for expected in 1..=5 {
        assert_eq!(request(&h).await.unwrap(), expected);
    }
    let session = h.registry.session(TENANT).unwrap();
    assert_eq!(session.challenges_issued(), 5);
    assert_eq!(h.console.count_notes("CODE-"), 5);

    let err = request(&h).await.unwrap_err();
    assert!(matches!(
        err,
        ReliabilityError::RetryBudgetExhausted {
            attempts: 5,
            max_attempts: 5
        }
    ));
    assert_eq!(session.challenges_issued(), 5);
    assert_eq!(h.console.count_notes("CODE-"), 5);
    assert_eq!(h.console.count_notes("limit exceeded"), 1);
    assert_eq!(h.bridge.supervisor.status(TENANT).await.unwrap().attempts, 5);
}

#[tokio::test(start_paused = true)]
async fn last_attempt_expiry_reports_limit_exceeded() {
    let h = Harness::new();
    for _ in 0..5 {
        request(&h).await.unwrap();
    }

    run_for(Duration::from_secs(31)).await;

    let notes = h.console.notes_containing("5/5, limit exceeded");
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].conversation_id, CONVERSATION);
    // Earlier timers were superseded, not expired.
    assert_eq!(h.console.count_notes("expired (attempt"), 0);

    assert!(matches!(
        request(&h).await,
        Err(ReliabilityError::RetryBudgetExhausted { .. })
    ));
    assert_eq!(h.registry.session(TENANT).unwrap().challenges_issued(), 5);
}

#[tokio::test(start_paused = true)]
async fn refused_request_notice_is_throttled() {
    let h = Harness::new();
    for _ in 0..5 {
        request(&h).await.unwrap();
    }

    for _ in 0..3 {
        assert!(request(&h).await.is_err());
    }
    assert_eq!(h.console.count_notes("limit exceeded"), 1);
}

// ============================================================================
// Challenge forwarding and expiry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn challenge_is_forwarded_and_recorded() {
    let h = Harness::new();
    request(&h).await.unwrap();

    let notes = h.console.notes_containing("CODE-1");
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].conversation_id, CONVERSATION);
    assert!(notes[0].content.contains("1/5"));

    let tenant = h.tenants.get(TENANT).await.unwrap();
    assert_eq!(tenant.last_pairing_challenge.as_deref(), Some("CODE-1"));
    assert_eq!(h.registry.create_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn expiry_under_budget_allows_another_attempt() {
    let h = Harness::new();
    request(&h).await.unwrap();

    run_for(Duration::from_secs(29)).await;
    assert_eq!(h.console.count_notes("expired (attempt 1/5)"), 0);

    run_for(Duration::from_secs(2)).await;
    assert_eq!(h.console.count_notes("expired (attempt 1/5)"), 1);

    assert_eq!(request(&h).await.unwrap(), 2);
    assert_eq!(h.console.count_notes("CODE-2"), 1);
}

#[tokio::test(start_paused = true)]
async fn session_timeout_event_expires_attempt() {
    let h = Harness::new();
    request(&h).await.unwrap();

    h.registry.session(TENANT).unwrap().emit_timeout();
    settle().await;

    assert_eq!(h.console.count_notes("expired (attempt 1/5)"), 1);
    run_for(Duration::from_secs(60)).await;
    assert_eq!(h.console.count_notes("expired (attempt 1/5)"), 1);
}

#[tokio::test(start_paused = true)]
async fn success_cancels_expiry() {
    let h = Harness::new();
    request(&h).await.unwrap();

    h.registry.session(TENANT).unwrap().approve();
    settle().await;
    assert_eq!(h.console.count_notes("was approved"), 1);

    // The monitor poll, not the workflow, ends the episode.
    assert!(h.bridge.supervisor.is_monitoring(TENANT).await);

    run_for(Duration::from_secs(31)).await;
    assert_eq!(h.console.count_notes("expired"), 0);
    assert!(!h.bridge.supervisor.is_monitoring(TENANT).await);
}

// ============================================================================
// Stale events
// ============================================================================

#[tokio::test(start_paused = true)]
async fn superseded_attempt_does_not_double_report() {
    let h = Harness::new();
    request(&h).await.unwrap();
    request(&h).await.unwrap();

    h.registry.session(TENANT).unwrap().approve();
    settle().await;

    assert_eq!(h.console.count_notes("was approved"), 1);
}

#[tokio::test(start_paused = true)]
async fn success_after_stop_is_ignored() {
    let h = Harness::new();
    request(&h).await.unwrap();
    h.bridge.stop_monitoring(TENANT).await;

    h.registry.session(TENANT).unwrap().approve();
    run_for(Duration::from_secs(60)).await;

    assert_eq!(h.console.count_notes("was approved"), 0);
    assert_eq!(h.console.count_notes("expired"), 0);
}

// ============================================================================
// Session bootstrap
// ============================================================================

#[tokio::test(start_paused = true)]
async fn session_create_times_out() {
    let h = Harness::new();
    h.registry.set_creates_sessions(false);

    let err = request(&h).await.unwrap_err();
    assert!(matches!(err, ReliabilityError::SessionCreateTimeout(d) if d == Duration::from_secs(10)));
    assert_eq!(h.registry.create_calls(), 1);

    // The attempt was spent even though no challenge went out.
    assert_eq!(h.bridge.supervisor.status(TENANT).await.unwrap().attempts, 1);
    assert_eq!(h.console.count_notes("CODE-"), 0);
    // The caller got the error, so nothing is posted for it.
    assert_eq!(h.console.count_notes("failed at attempt"), 0);
}

#[tokio::test(start_paused = true)]
async fn unpaired_connected_session_is_restarted_for_a_fresh_code() {
    let h = Harness::new();
    assert_eq!(request(&h).await.unwrap(), 1);
    run_for(Duration::from_secs(31)).await;
    assert_eq!(h.console.count_notes("expired (attempt 1/5)"), 1);

    // Still connected and unpaired: no new code comes without a restart.
    let session = h.registry.session(TENANT).unwrap();
    assert_eq!(request(&h).await.unwrap(), 2);
    assert_eq!(session.disconnects(), 1);
    assert_eq!(session.connects(), 2);
    assert_eq!(session.challenges_issued(), 2);
    assert_eq!(h.console.count_notes("CODE-2"), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_request_still_forwards_and_expires_its_code() {
    let h = Harness::new();
    let session = FakeSession::new(TENANT);
    session.set_challenge_delay(Duration::from_secs(19));
    h.registry.insert(session);
    h.console.set_send_latency(Duration::from_secs(3));

    let dropped = tokio::time::timeout(Duration::from_secs(20), request(&h)).await;
    assert!(dropped.is_err());

    run_for(Duration::from_secs(5)).await;
    assert_eq!(h.console.count_notes("CODE-1"), 1);
    let status = h.bridge.supervisor.status(TENANT).await.unwrap();
    assert_eq!(status.attempts, 1);
    assert!(status.pairing_pending);

    run_for(Duration::from_secs(35)).await;
    assert_eq!(h.console.count_notes("expired (attempt 1/5)"), 1);
}

#[tokio::test(start_paused = true)]
async fn dropped_request_reports_bootstrap_failure() {
    let h = Harness::new();
    h.registry.set_creates_sessions(false);

    let dropped = tokio::time::timeout(Duration::from_secs(1), request(&h)).await;
    assert!(dropped.is_err());

    run_for(Duration::from_secs(15)).await;
    let notes = h.console.notes_containing("failed at attempt 1/5");
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].conversation_id, CONVERSATION);
}

#[tokio::test(start_paused = true)]
async fn rendered_challenge_is_attached() {
    let h = Harness::new();
    let session = FakeSession::new(TENANT);
    session.set_renders_qr(true);
    h.registry.insert(session);

    request(&h).await.unwrap();

    let notes = h.console.notes_containing("CODE-1");
    assert_eq!(notes.len(), 1);
    assert!(notes[0].content.contains("QR-ASCII-1"));
    assert_eq!(notes[0].attachments.len(), 1);
    assert_eq!(notes[0].attachments[0].data_url, "data:image/png;base64,QR1");
}

#[tokio::test(start_paused = true)]
async fn healthy_session_is_already_connected() {
    let h = Harness::new();
    h.registry.insert(FakeSession::healthy(TENANT));

    assert!(matches!(
        request(&h).await,
        Err(ReliabilityError::AlreadyConnected(_))
    ));
    assert!(!h.bridge.supervisor.is_monitoring(TENANT).await);
}

#[tokio::test(start_paused = true)]
async fn authenticated_but_disconnected_session_is_logged_out_first() {
    let h = Harness::new();
    let session = FakeSession::new(TENANT);
    session.set_logged_in(true);
    h.registry.insert(session.clone());

    assert_eq!(request(&h).await.unwrap(), 1);
    assert_eq!(session.logouts(), 1);
    assert_eq!(session.connects(), 1);
    assert_eq!(h.registry.create_calls(), 0);
    assert_eq!(h.console.count_notes("CODE-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_tenant_is_rejected() {
    let h = Harness::new();
    let err = h
        .bridge
        .request_pairing("nobody", CONVERSATION, &console_config())
        .await
        .unwrap_err();
    assert!(matches!(err, ReliabilityError::UnknownTenant(_)));
    assert!(!h.bridge.supervisor.is_monitoring("nobody").await);
}

#[tokio::test(start_paused = true)]
async fn invalid_console_config_is_rejected() {
    let h = Harness::new();
    let mut console = console_config();
    console.base_url.clear();

    let err = h
        .bridge
        .request_pairing(TENANT, CONVERSATION, &console)
        .await
        .unwrap_err();
    assert!(matches!(err, ReliabilityError::InvalidConfig(_)));
}
