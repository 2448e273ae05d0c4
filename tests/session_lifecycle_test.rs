use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use wa_session_keeper::bot::Bot;
use wa_session_keeper::config::{BotConfig, OnLogout};
use wa_session_keeper::session::{
    ExponentialBackoff, SessionExit, SessionState, SessionStatus,
};
use wa_session_keeper::store::{CredentialStore, CredentialsUpdate};
use wa_session_keeper::test_utils::{MockSession, MockTransportFactory, RecordingDispatcher};
use wa_session_keeper::transport::Transport;
use wa_session_keeper::types::contact::AccountIdentity;
use wa_session_keeper::types::events::{ConnectionUpdate, DisconnectReason};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    _dir: TempDir,
    bot: Bot,
    factory: Arc<MockTransportFactory>,
    sessions: mpsc::UnboundedReceiver<MockSession>,
}

async fn harness(configure: impl FnOnce(&mut BotConfig)) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = BotConfig {
        session_dir: dir.path().join("session"),
        store_file: dir.path().join("store.json"),
        pairing_delay_ms: 0,
        ..Default::default()
    };
    configure(&mut config);

    let (factory, sessions) = MockTransportFactory::new();
    let bot = Bot::builder()
        .with_config(config)
        .with_transport_factory(factory.clone())
        .with_dispatcher(Arc::new(RecordingDispatcher::new()))
        .build()
        .await
        .unwrap();
    Harness {
        _dir: dir,
        bot,
        factory,
        sessions,
    }
}

async fn next_session(sessions: &mut mpsc::UnboundedReceiver<MockSession>) -> MockSession {
    timeout(WAIT, sessions.recv())
        .await
        .expect("timed out waiting for a transport session")
        .expect("factory dropped")
}

async fn wait_status(
    status: &mut watch::Receiver<SessionStatus>,
    predicate: impl FnMut(&SessionStatus) -> bool,
) -> SessionStatus {
    *timeout(WAIT, status.wait_for(predicate))
        .await
        .expect("timed out waiting for session status")
        .expect("controller dropped")
}

async fn close(session: &MockSession, reason: DisconnectReason) {
    session
        .events
        .connection
        .send(ConnectionUpdate::closed(reason))
        .await
        .unwrap();
}

async fn open(session: &MockSession) {
    session
        .events
        .connection
        .send(ConnectionUpdate::open())
        .await
        .unwrap();
}

fn registered_update() -> CredentialsUpdate {
    CredentialsUpdate {
        registered: Some(true),
        me: Some(AccountIdentity {
            id: "15551234567:4@s.whatsapp.net".into(),
            name: Some("Keeper".into()),
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_cold_start_requests_formatted_pairing_code() {
    let mut h = harness(|c| c.phone_number = Some("+15551234567".into())).await;
    let mut pairing = h.bot.controller().pairing();
    let _run = h.bot.run().await.unwrap();

    let session = next_session(&mut h.sessions).await;
    assert!(!session.auth.credentials.registered);

    let pending = timeout(WAIT, pairing.wait_for(|p| p.is_some()))
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();
    assert_eq!(pending.phone_number, "15551234567");
    assert_eq!(pending.code.as_deref(), Some("ABCD-1234-EFGH-5678"));
    assert_eq!(
        session.transport.pairing_requests(),
        vec![("15551234567".to_string(), None)]
    );

    // Registration completes the pairing attempt.
    session.events.creds.send(registered_update()).await.unwrap();
    timeout(WAIT, pairing.wait_for(|p| p.is_none()))
        .await
        .unwrap()
        .unwrap();
    h.bot.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_registered_session_skips_pairing() {
    let mut h = harness(|c| c.phone_number = Some("15551234567".into())).await;
    h.bot
        .credentials()
        .apply_update(registered_update())
        .await
        .unwrap();
    let _run = h.bot.run().await.unwrap();

    let session = next_session(&mut h.sessions).await;
    assert!(session.auth.credentials.registered);
    sleep(Duration::from_millis(100)).await;
    assert!(session.transport.pairing_requests().is_empty());
    h.bot.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_phone_number_aborts_pairing_only() {
    let mut h = harness(|c| c.phone_number = Some("0123".into())).await;
    let mut status = h.bot.controller().status();
    let _run = h.bot.run().await.unwrap();

    let session = next_session(&mut h.sessions).await;
    sleep(Duration::from_millis(100)).await;
    assert!(session.transport.pairing_requests().is_empty());
    assert!(h.bot.controller().pairing().borrow().is_none());

    open(&session).await;
    wait_status(&mut status, |s| s.state == SessionState::Open).await;
    h.bot.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_close_restarts_exactly_once() {
    let mut h = harness(|_| {}).await;
    let mut status = h.bot.controller().status();
    let _run = h.bot.run().await.unwrap();

    let first = next_session(&mut h.sessions).await;
    open(&first).await;
    wait_status(&mut status, |s| s.state == SessionState::Open).await;

    close(&first, DisconnectReason::ConnectionClosed).await;
    let _second = next_session(&mut h.sessions).await;
    assert!(first.transport.is_disconnected());

    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.factory.create_count(), 2);
    assert!(h.sessions.try_recv().is_err());
    h.bot.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_count_grows_until_open() {
    let mut h = harness(|_| {}).await;
    let mut status = h.bot.controller().status();
    let _run = h.bot.run().await.unwrap();

    let mut session = next_session(&mut h.sessions).await;
    for expected in 1..=3u32 {
        close(&session, DisconnectReason::ConnectionLost).await;
        session = next_session(&mut h.sessions).await;
        let current = wait_status(&mut status, |s| s.retry_count == expected).await;
        assert_ne!(current.state, SessionState::Open);
    }

    open(&session).await;
    let current = wait_status(&mut status, |s| s.state == SessionState::Open).await;
    assert_eq!(current.retry_count, 0);

    close(&session, DisconnectReason::ConnectionLost).await;
    let _next = next_session(&mut h.sessions).await;
    let current = wait_status(&mut status, |s| s.state != SessionState::Open).await;
    assert_eq!(current.retry_count, 1);
    h.bot.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_logout_retries_by_default() {
    let mut h = harness(|_| {}).await;
    let _run = h.bot.run().await.unwrap();

    let first = next_session(&mut h.sessions).await;
    first.events.creds.send(registered_update()).await.unwrap();
    open(&first).await;
    close(&first, DisconnectReason::LoggedOut).await;

    let second = next_session(&mut h.sessions).await;
    assert!(second.auth.credentials.registered);
    assert_eq!(
        second.transport.user().map(|me| me.id),
        Some("15551234567:4@s.whatsapp.net".to_string())
    );
    h.bot.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_halt_on_logout_stops_and_clears_credentials() {
    let mut h = harness(|c| c.on_logout = OnLogout::Halt).await;
    let run = h.bot.run().await.unwrap();

    let first = next_session(&mut h.sessions).await;
    first.events.creds.send(registered_update()).await.unwrap();
    open(&first).await;

    // A transient close still reconnects.
    close(&first, DisconnectReason::ConnectionReplaced).await;
    let second = next_session(&mut h.sessions).await;
    assert!(second.auth.credentials.registered);

    close(&second, DisconnectReason::LoggedOut).await;
    let exit = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(exit, SessionExit::Halted(Some(DisconnectReason::LoggedOut)));
    assert_eq!(h.factory.create_count(), 2);
    assert!(!h.bot.credentials().is_registered().await);

    let reopened = CredentialStore::open(h.bot.config().session_dir.clone())
        .await
        .unwrap();
    assert!(!reopened.is_registered().await);
}

#[tokio::test]
async fn test_factory_failures_count_as_closures() {
    let dir = TempDir::new().unwrap();
    let (factory, mut sessions) = MockTransportFactory::new();
    factory.fail_creates(true);
    let bot = Bot::builder()
        .with_config(BotConfig {
            session_dir: dir.path().join("session"),
            store_file: dir.path().join("store.json"),
            ..Default::default()
        })
        .with_transport_factory(factory.clone())
        .with_reconnect_policy(Arc::new(ExponentialBackoff {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
            halt_on_logout: false,
        }))
        .build()
        .await
        .unwrap();
    let mut status = bot.controller().status();
    let _run = bot.run().await.unwrap();

    wait_status(&mut status, |s| s.retry_count >= 3).await;
    factory.fail_creates(false);

    let session = next_session(&mut sessions).await;
    open(&session).await;
    let current = wait_status(&mut status, |s| s.state == SessionState::Open).await;
    assert_eq!(current.retry_count, 0);
    assert!(factory.create_count() >= 4);
    bot.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_qr_is_published_and_cleared_on_open() {
    let mut h = harness(|_| {}).await;
    let mut qr = h.bot.controller().qr_codes();
    let _run = h.bot.run().await.unwrap();

    let session = next_session(&mut h.sessions).await;
    session
        .events
        .connection
        .send(ConnectionUpdate::qr("2@abc,def"))
        .await
        .unwrap();
    timeout(WAIT, qr.wait_for(|q| q.as_deref() == Some("2@abc,def")))
        .await
        .unwrap()
        .unwrap();

    open(&session).await;
    timeout(WAIT, qr.wait_for(|q| q.is_none()))
        .await
        .unwrap()
        .unwrap();
    h.bot.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_before_connect() {
    let h = harness(|_| {}).await;
    h.bot.controller().shutdown();
    let run = h.bot.run().await.unwrap();
    let exit = timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    assert_eq!(exit, SessionExit::Shutdown);
    assert_eq!(
        *h.bot.controller().status().borrow(),
        SessionStatus {
            state: SessionState::Idle,
            retry_count: 0
        }
    );
}
