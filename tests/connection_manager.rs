use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rstest::rstest;
use tempfile::TempDir;
use tokio::time::{Instant, timeout};

use microbot::{
    AuthToken, ConnectionConfig, ConnectionError, ConnectionManager, DeviceAddress,
    FakeBackendConfig, FakeEvent, FakeHardwareClient, FakeOperation, HandshakeError,
    HandshakeState, HardwareClient, InteractionError, LinkRegistry, NotificationPayloads,
    TokenStore,
};

const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
const ADDRESS_ACK: &str = "00000f0101aabbccddeeff000000000000000000";
const TOKEN_ACK: &str = "00001fffab12ab12ab12ab12ab12ab1200000000";
const TOKEN: &str = "ab12ab12ab12ab12ab12ab1200000000";
// Far beyond every configured timeout; reaching it means an operation hung.
const HANG_GUARD: Duration = Duration::from_secs(3600);

struct Harness {
    fake: FakeHardwareClient,
    manager: ConnectionManager,
    store: TokenStore,
    _dir: TempDir,
}

fn address() -> DeviceAddress {
    ADDRESS.parse().expect("test address should parse")
}

fn token() -> AuthToken {
    TOKEN.parse().expect("test token should parse")
}

fn notifications(raw: &str) -> NotificationPayloads {
    raw.parse().expect("notification fixture should parse")
}

async fn harness_with_registry(
    fake_config: FakeBackendConfig,
    config: ConnectionConfig,
    registry: Arc<LinkRegistry>,
) -> Harness {
    let dir = TempDir::new().expect("temporary directory should be created");
    let store = TokenStore::new(dir.path().join("tokens.conf"));
    let fake = FakeHardwareClient::new(fake_config);
    let device = fake
        .discover(&address(), Duration::from_secs(1))
        .await
        .expect("fake device should be discoverable");
    let manager = ConnectionManager::new(Arc::new(fake.clone()), device, store.clone(), config)
        .with_registry(registry);

    Harness {
        fake,
        manager,
        store,
        _dir: dir,
    }
}

async fn harness(fake_config: FakeBackendConfig, config: ConnectionConfig) -> Harness {
    harness_with_registry(fake_config, config, Arc::new(LinkRegistry::default())).await
}

#[rstest]
#[case::no_retries(0)]
#[case::three_retries(3)]
#[case::default_retries(5)]
#[tokio::test(start_paused = true)]
async fn connect_attempts_exactly_retry_count_plus_one(#[case] retry_count: usize) {
    let retry_delay = Duration::from_millis(500);
    let harness = harness(
        FakeBackendConfig::builder()
            .connect_failures(usize::MAX)
            .build(),
        ConnectionConfig::builder()
            .retry_count(retry_count)
            .retry_delay(retry_delay)
            .build(),
    )
    .await;

    let started = Instant::now();
    let result = harness.manager.connect(true).await;

    assert_matches!(
        result,
        Err(ConnectionError::RetriesExhausted { attempts, .. }) if attempts == retry_count + 1
    );
    assert_eq!(retry_count + 1, harness.fake.connect_attempts().await);
    let retries = u32::try_from(retry_count).expect("retry count should fit in u32");
    assert!(started.elapsed() >= retry_delay * retries);
}

#[tokio::test(start_paused = true)]
async fn transient_link_failures_are_retried() {
    let harness = harness(
        FakeBackendConfig::builder()
            .connect_failures(2)
            .notifications(notifications(&format!("{ADDRESS_ACK},{TOKEN_ACK}")))
            .build(),
        ConnectionConfig::default(),
    )
    .await;

    let session = harness
        .manager
        .connect(true)
        .await
        .expect("third attempt should succeed");

    assert_eq!(3, harness.fake.connect_attempts().await);
    assert_eq!(HandshakeState::Complete, session.handshake_state());
    harness.manager.disconnect(session).await;
}

#[tokio::test(start_paused = true)]
async fn link_establishment_times_out() {
    let harness = harness(
        FakeBackendConfig::builder()
            .connect_delay(Duration::from_secs(60))
            .build(),
        ConnectionConfig::builder()
            .retry_count(1)
            .connect_timeout(Duration::from_secs(1))
            .build(),
    )
    .await;
    harness
        .store
        .save(&address(), &token())
        .expect("token should be saved");

    let error = harness
        .manager
        .connect(false)
        .await
        .expect_err("a link that never comes up should fail");

    let ConnectionError::RetriesExhausted {
        attempts,
        last_error,
        ..
    } = error
    else {
        panic!("expected exhausted retries, got {error:?}");
    };
    assert_eq!(2, attempts);
    assert_matches!(
        *last_error,
        ConnectionError::Link(InteractionError::Timeout {
            operation: "connect",
            timeout_ms: 1000
        })
    );
}

#[tokio::test]
async fn missing_token_fails_without_connecting() {
    let harness = harness(FakeBackendConfig::default(), ConnectionConfig::default()).await;

    let result = harness.manager.connect(false).await;

    assert_matches!(result, Err(ConnectionError::MissingToken { address: missing }) if missing == address());
    assert_eq!(0, harness.fake.connect_attempts().await);
}

#[tokio::test]
async fn second_session_is_rejected_until_the_first_closes() {
    let harness = harness(FakeBackendConfig::default(), ConnectionConfig::default()).await;
    harness
        .store
        .save(&address(), &token())
        .expect("token should be saved");

    let first = harness
        .manager
        .connect(false)
        .await
        .expect("first session should open");
    assert_matches!(
        harness.manager.connect(false).await,
        Err(ConnectionError::SessionActive { .. })
    );

    harness.manager.disconnect(first).await;
    let reopened = harness
        .manager
        .connect(false)
        .await
        .expect("session should reopen after disconnect");
    harness.manager.disconnect(reopened).await;
}

#[tokio::test]
async fn concurrent_connects_yield_one_session() {
    let registry = Arc::new(LinkRegistry::default());
    let first = harness_with_registry(
        FakeBackendConfig::default(),
        ConnectionConfig::default(),
        Arc::clone(&registry),
    )
    .await;
    let second = harness_with_registry(
        FakeBackendConfig::default(),
        ConnectionConfig::default(),
        Arc::clone(&registry),
    )
    .await;
    for store in [&first.store, &second.store] {
        store.save(&address(), &token()).expect("token should be saved");
    }

    let (left, right) = tokio::join!(first.manager.connect(false), second.manager.connect(false));

    let opened = [left.is_ok(), right.is_ok()];
    assert_eq!(1, opened.iter().filter(|ok| **ok).count());
    assert!(registry.has_session(&address()));
    match (left, right) {
        (Ok(session), Err(error)) => {
            assert_matches!(error, ConnectionError::SessionActive { .. });
            first.manager.disconnect(session).await;
        }
        (Err(error), Ok(session)) => {
            assert_matches!(error, ConnectionError::SessionActive { .. });
            second.manager.disconnect(session).await;
        }
        other => panic!("expected exactly one session, got {other:?}"),
    }
    assert!(!registry.has_session(&address()));
}

#[tokio::test(start_paused = true)]
async fn token_before_address_ack_times_out_without_retry() {
    let harness = harness(
        FakeBackendConfig::builder()
            .notifications(notifications(&format!("{TOKEN_ACK},{ADDRESS_ACK}")))
            .build(),
        ConnectionConfig::builder()
            .handshake_timeout(Duration::from_secs(5))
            .build(),
    )
    .await;

    let result = harness.manager.connect(true).await;

    assert_matches!(
        result,
        Err(ConnectionError::Handshake(HandshakeError::Timeout {
            state: HandshakeState::AwaitingToken,
            timeout_ms: 5000
        }))
    );
    assert_eq!(1, harness.fake.connect_attempts().await);
    assert_eq!(
        None,
        harness.store.load(&address()).expect("store should be readable")
    );
    assert_eq!(Some(&FakeEvent::Close), harness.fake.events().await.last());
}

#[tokio::test]
async fn unrecognized_notifications_abort_after_limit() {
    let harness = harness(
        FakeBackendConfig::builder()
            .notifications(notifications("deadbeef,cafe,0badf00d"))
            .build(),
        ConnectionConfig::builder()
            .unrecognized_notification_limit(2)
            .build(),
    )
    .await;

    let result = harness.manager.connect(true).await;

    assert_matches!(
        result,
        Err(ConnectionError::Handshake(HandshakeError::TooManyUnrecognized { count: 2 }))
    );
    assert_eq!(1, harness.fake.connect_attempts().await);
}

#[tokio::test(start_paused = true)]
async fn handshake_write_failure_retries_the_whole_connection() {
    let harness = harness(
        FakeBackendConfig::builder()
            .failing_writes([0])
            .notifications(notifications(&format!("{ADDRESS_ACK},{TOKEN_ACK}")))
            .build(),
        ConnectionConfig::default(),
    )
    .await;

    let session = harness
        .manager
        .connect(true)
        .await
        .expect("second attempt should pair");

    assert_eq!(2, harness.fake.connect_attempts().await);
    assert_eq!(
        Some(token()),
        harness.store.load(&address()).expect("store should be readable")
    );
    harness.manager.disconnect(session).await;
}

#[tokio::test]
async fn disconnect_tolerates_a_dropped_link() {
    let harness = harness(
        FakeBackendConfig::builder()
            .drop_link_after_writes(2)
            .build(),
        ConnectionConfig::default(),
    )
    .await;
    harness
        .store
        .save(&address(), &token())
        .expect("token should be saved");

    let session = harness
        .manager
        .connect(false)
        .await
        .expect("session should open");
    assert!(!session.is_connected().await);

    harness.manager.disconnect(session).await;
    assert_eq!(Some(&FakeEvent::Close), harness.fake.events().await.last());
}

#[tokio::test(start_paused = true)]
async fn silent_subscribe_is_bounded_by_the_handshake_timeout() {
    let harness = harness(
        FakeBackendConfig::builder()
            .stalled_operations([FakeOperation::Subscribe])
            .build(),
        ConnectionConfig::builder()
            .retry_count(0)
            .handshake_timeout(Duration::from_secs(1))
            .build(),
    )
    .await;

    let result = timeout(HANG_GUARD, harness.manager.connect(true))
        .await
        .expect("connect should resolve within its own timeouts");

    assert_matches!(
        result,
        Err(ConnectionError::Handshake(HandshakeError::Timeout {
            state: HandshakeState::AwaitingAddressAck,
            timeout_ms: 1000
        }))
    );
    assert_eq!(
        vec![FakeEvent::Connect, FakeEvent::Close],
        harness.fake.events().await
    );
}

#[tokio::test(start_paused = true)]
async fn silent_pair_request_is_retried_as_a_link_timeout() {
    let harness = harness(
        FakeBackendConfig::builder()
            .stalled_operations([FakeOperation::Pair])
            .build(),
        ConnectionConfig::builder()
            .retry_count(1)
            .connect_timeout(Duration::from_secs(1))
            .build(),
    )
    .await;
    harness
        .store
        .save(&address(), &token())
        .expect("token should be saved");

    let error = timeout(HANG_GUARD, harness.manager.connect(false))
        .await
        .expect("connect should resolve within its own timeouts")
        .expect_err("a pairing request that never answers should fail");

    let ConnectionError::RetriesExhausted {
        attempts,
        last_error,
        ..
    } = error
    else {
        panic!("expected exhausted retries, got {error:?}");
    };
    assert_eq!(2, attempts);
    assert_matches!(
        *last_error,
        ConnectionError::Link(InteractionError::Timeout {
            operation: "pair",
            timeout_ms: 1000
        })
    );
    assert!(harness.fake.written_records().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn silent_unsubscribe_does_not_block_pairing_or_disconnect() {
    let harness = harness(
        FakeBackendConfig::builder()
            .stalled_operations([FakeOperation::Unsubscribe])
            .notifications(notifications(&format!("{ADDRESS_ACK},{TOKEN_ACK}")))
            .build(),
        ConnectionConfig::builder()
            .write_timeout(Duration::from_secs(1))
            .build(),
    )
    .await;

    let session = timeout(HANG_GUARD, harness.manager.connect(true))
        .await
        .expect("connect should resolve within its own timeouts")
        .expect("pairing should complete without a confirmed unsubscribe");
    assert_eq!(
        Some(token()),
        harness.store.load(&address()).expect("store should be readable")
    );

    timeout(HANG_GUARD, harness.manager.disconnect(session))
        .await
        .expect("disconnect should resolve within the write timeout");

    let events = harness.fake.events().await;
    assert!(!events.contains(&FakeEvent::Unsubscribe));
    assert_eq!(Some(&FakeEvent::Close), events.last());
}

#[tokio::test(start_paused = true)]
async fn silent_close_is_bounded_by_the_connect_timeout() {
    let connect_timeout = Duration::from_secs(2);
    let harness = harness(
        FakeBackendConfig::builder()
            .stalled_operations([FakeOperation::Close])
            .build(),
        ConnectionConfig::builder()
            .connect_timeout(connect_timeout)
            .build(),
    )
    .await;
    harness
        .store
        .save(&address(), &token())
        .expect("token should be saved");
    let session = harness
        .manager
        .connect(false)
        .await
        .expect("session should open");

    let started = Instant::now();
    timeout(HANG_GUARD, harness.manager.disconnect(session))
        .await
        .expect("disconnect should resolve within the connect timeout");

    let elapsed = started.elapsed();
    assert!(elapsed >= connect_timeout);
    assert!(elapsed < connect_timeout * 2);
    let reopened = harness
        .manager
        .connect(false)
        .await
        .expect("the session slot should be released after a stalled close");
    drop(reopened);
}

#[tokio::test(start_paused = true)]
async fn silent_link_state_query_counts_as_disconnected() {
    let harness = harness(
        FakeBackendConfig::builder()
            .stalled_operations([FakeOperation::LinkState])
            .build(),
        ConnectionConfig::builder()
            .connect_timeout(Duration::from_secs(1))
            .build(),
    )
    .await;
    harness
        .store
        .save(&address(), &token())
        .expect("token should be saved");
    let session = harness
        .manager
        .connect(false)
        .await
        .expect("session should open");

    let connected = timeout(HANG_GUARD, session.is_connected())
        .await
        .expect("link state should resolve within the connect timeout");

    assert!(!connected);
    harness.manager.disconnect(session).await;
}
