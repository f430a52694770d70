//! End-to-end session lifecycle against the scripted backend.

use assert_fs::TempDir;
use machi_wa::prelude::*;
use machi_wa::testing::ScriptedClientFactory;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    _tmp: TempDir,
    factory: ScriptedClientFactory,
    controller: Arc<SessionController>,
}

fn fixture(timeout: Duration) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let factory = ScriptedClientFactory::new();
    let controller = SessionController::new(
        Arc::new(factory.clone()),
        CredentialStore::new(tmp.path().join("sessions")),
        MediaFetcher::new(MediaConfig::default()).unwrap(),
    )
    .with_options(ControllerOptions {
        artifact_timeout: timeout,
        ..ControllerOptions::default()
    });
    Fixture {
        _tmp: tmp,
        factory,
        controller: Arc::new(controller),
    }
}

async fn wait_state(controller: &SessionController, token: &str, want: SessionState) {
    for _ in 0..400 {
        if let Ok(info) = controller.status(token).await
            && info.state == want
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{token} did not reach {want}");
}

#[tokio::test]
async fn qr_handshake_reaches_authenticated() {
    let f = fixture(Duration::from_secs(2));
    let token = "+15551234567";

    let info = f.controller.create(token, AuthMode::Qr).await.unwrap();
    assert_eq!(info.state, SessionState::Initializing);

    f.factory
        .emit(token, ClientEvent::Artifact(AuthArtifact::qr("2@scan-me")))
        .await;
    wait_state(&f.controller, token, SessionState::AwaitingCode).await;
    assert_eq!(
        f.controller.artifact(token).await.unwrap(),
        ArtifactStatus::Ready(AuthArtifact::qr("2@scan-me"))
    );

    f.factory.emit(token, ClientEvent::Authenticated).await;
    wait_state(&f.controller, token, SessionState::Authenticated).await;
    assert_eq!(
        f.controller.artifact(token).await.unwrap(),
        ArtifactStatus::Authenticated
    );
    assert!(!f.controller.status(token).await.unwrap().has_artifact);
}

#[tokio::test]
async fn duplicate_create_rejected() {
    let f = fixture(Duration::from_secs(2));
    f.controller.create("T1", AuthMode::Qr).await.unwrap();

    let err = f.controller.create("T1", AuthMode::Qr).await.unwrap_err();
    assert!(matches!(err, SessionError::AlreadyExists(_)));
    assert_eq!(err.code(), "ALREADY_EXISTS");
}

#[tokio::test]
async fn concurrent_create_has_one_winner() {
    let f = fixture(Duration::from_secs(2));
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let controller = Arc::clone(&f.controller);
        tasks.push(tokio::spawn(async move {
            controller.create("T1", AuthMode::Qr).await
        }));
    }

    let mut created = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => created += 1,
            Err(e) => assert!(matches!(e, SessionError::AlreadyExists(_))),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(f.factory.created().await.len(), 1);
}

#[tokio::test]
async fn send_normalizes_recipient() {
    let f = fixture(Duration::from_secs(2));
    f.controller.create("T2", AuthMode::Qr).await.unwrap();
    f.factory.emit("T2", ClientEvent::Authenticated).await;
    wait_state(&f.controller, "T2", SessionState::Authenticated).await;

    f.controller
        .send_text("T2", "15550001111", "hi")
        .await
        .unwrap();
    f.controller
        .send_text("T2", "15550001111@c.us", "hi")
        .await
        .unwrap();

    let sent = f.factory.sent().await;
    assert_eq!(sent.len(), 2);
    for message in sent {
        assert_eq!(message.recipient, "15550001111@c.us");
        assert_eq!(message.payload, OutboundPayload::text("hi"));
    }
}

#[tokio::test]
async fn sends_rejected_outside_authenticated() {
    let f = fixture(Duration::from_secs(2));
    f.controller.create("T1", AuthMode::Qr).await.unwrap();

    // Initializing
    assert!(matches!(
        f.controller.send_text("T1", "1555", "x").await,
        Err(SessionError::NotAuthenticated { .. })
    ));

    f.factory
        .emit("T1", ClientEvent::Artifact(AuthArtifact::qr("q")))
        .await;
    wait_state(&f.controller, "T1", SessionState::AwaitingCode).await;
    assert!(matches!(
        f.controller.send_text("T1", "1555", "x").await,
        Err(SessionError::NotAuthenticated { .. })
    ));

    f.factory.emit("T1", ClientEvent::Authenticated).await;
    f.factory
        .emit("T1", ClientEvent::Disconnected("logout".into()))
        .await;
    wait_state(&f.controller, "T1", SessionState::LoggedOut).await;
    assert!(matches!(
        f.controller.send_text("T1", "1555", "x").await,
        Err(SessionError::NotAuthenticated { .. })
    ));

    assert!(f.factory.sent().await.is_empty());
}

#[tokio::test]
async fn logged_out_session_recreated_for_artifact() {
    let f = fixture(Duration::from_secs(2));
    f.controller.create("T3", AuthMode::Qr).await.unwrap();
    f.factory.emit("T3", ClientEvent::Authenticated).await;
    f.factory
        .emit("T3", ClientEvent::Disconnected("remote logout".into()))
        .await;
    wait_state(&f.controller, "T3", SessionState::LoggedOut).await;
    let old_dir = f.controller.credentials().dir_for("T3");

    let controller = Arc::clone(&f.controller);
    let request = tokio::spawn(async move { controller.artifact("T3").await });

    // The new client comes up and issues a code after a short delay.
    for _ in 0..400 {
        if f.factory.created().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    f.factory
        .emit("T3", ClientEvent::Artifact(AuthArtifact::qr("2@fresh")))
        .await;

    assert_eq!(
        request.await.unwrap().unwrap(),
        ArtifactStatus::Ready(AuthArtifact::qr("2@fresh"))
    );
    assert_eq!(f.factory.shutdowns().await, vec!["T3"]);
    assert!(old_dir.exists(), "new client recreated its credential dir");
}

#[tokio::test]
async fn recreated_session_artifact_times_out() {
    let f = fixture(Duration::from_millis(100));
    f.controller.create("T3", AuthMode::Qr).await.unwrap();
    f.factory.emit("T3", ClientEvent::Authenticated).await;
    f.factory
        .emit("T3", ClientEvent::Disconnected("remote logout".into()))
        .await;
    wait_state(&f.controller, "T3", SessionState::LoggedOut).await;

    let err = f.controller.artifact("T3").await.unwrap_err();
    assert!(matches!(err, SessionError::ArtifactTimeout { .. }));
    assert_eq!(
        f.controller.status("T3").await.unwrap().state,
        SessionState::Initializing
    );
}

#[tokio::test]
async fn remove_unknown_token_not_found() {
    let f = fixture(Duration::from_secs(2));
    let err = f.controller.remove("unknown-token").await.unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
}

#[tokio::test]
async fn removal_is_idempotent_and_clears_credentials() {
    let f = fixture(Duration::from_secs(2));
    f.controller.create("T1", AuthMode::Qr).await.unwrap();
    let dir = f.controller.credentials().dir_for("T1");
    assert!(dir.exists());

    f.controller.logout("T1").await.unwrap();
    assert!(matches!(
        f.controller.remove("T1").await,
        Err(SessionError::NotFound(_))
    ));
    assert!(!dir.exists());

    // Token is reusable with a clean slate.
    f.controller.create("T1", AuthMode::Qr).await.unwrap();
    assert_eq!(
        f.controller.status("T1").await.unwrap().state,
        SessionState::Initializing
    );
}

#[tokio::test]
async fn one_failing_session_does_not_affect_others() {
    let f = fixture(Duration::from_secs(2));
    f.controller.create("good", AuthMode::Qr).await.unwrap();
    f.controller.create("bad", AuthMode::Qr).await.unwrap();

    f.factory.emit("good", ClientEvent::Authenticated).await;
    f.factory
        .emit("bad", ClientEvent::AuthFailed("banned".into()))
        .await;
    wait_state(&f.controller, "good", SessionState::Authenticated).await;
    wait_state(&f.controller, "bad", SessionState::AuthFailed).await;

    f.controller
        .send_text("good", "15550001111", "still here")
        .await
        .unwrap();
    assert_eq!(f.controller.list().await.len(), 2);
}

#[test]
fn normalization_is_idempotent() {
    for input in ["15550001111", "+1 (555) 000-1111", "15550001111@c.us", "1203-4567@g.us"] {
        let once = normalize_recipient(input, "c.us").unwrap();
        assert_eq!(normalize_recipient(&once, "c.us").unwrap(), once);
    }
}
