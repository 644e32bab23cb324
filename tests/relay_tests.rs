//! Tests for the SMTP relay session against a loopback server.

use integrations_smtp_campaign::mocks;
use integrations_smtp_campaign::{
    CampaignDispatcher, CampaignErrorKind, Credentials, DispatchState, ErrorCategory,
    OutboundMessage, RelayConnectionManager, RelayConfig, SmtpConnector, TlsConfig, TlsMode,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Default)]
struct RelayScript {
    reject_rcpt: Option<String>,
    fail_auth: bool,
    hang_up_on_auth: bool,
    delay_data_reply: Option<Duration>,
}

struct LoopbackRelay {
    port: u16,
    commands: Arc<Mutex<Vec<String>>>,
    data: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl LoopbackRelay {
    async fn spawn(script: RelayScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let data = Arc::new(Mutex::new(Vec::new()));

        let (c, d) = (Arc::clone(&commands), Arc::clone(&data));
        let task = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            serve(socket, script, c, d).await;
        });

        Self {
            port,
            commands,
            data,
            task,
        }
    }

    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            host: "127.0.0.1".to_string(),
            port: self.port,
            tls: TlsConfig {
                mode: TlsMode::None,
                sni_override: None,
            },
            ..RelayConfig::default()
        }
    }

    async fn finish(self) -> (Vec<String>, Vec<String>) {
        self.task.await.unwrap();
        let commands = self.commands.lock().unwrap().clone();
        let data = self.data.lock().unwrap().clone();
        (commands, data)
    }
}

async fn serve(
    socket: TcpStream,
    script: RelayScript,
    commands: Arc<Mutex<Vec<String>>>,
    data: Arc<Mutex<Vec<String>>>,
) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();
    if write.write_all(b"220 relay.test ESMTP ready\r\n").await.is_err() {
        return;
    }

    let mut in_data = false;
    while let Ok(Some(line)) = lines.next_line().await {
        if in_data {
            if line == "." {
                in_data = false;
                if let Some(delay) = script.delay_data_reply {
                    tokio::time::sleep(delay).await;
                }
                if write.write_all(b"250 2.0.0 Queued\r\n").await.is_err() {
                    break;
                }
            } else {
                data.lock().unwrap().push(line);
            }
            continue;
        }

        commands.lock().unwrap().push(line.clone());
        let verb = line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        let reply = match verb.as_str() {
            "EHLO" => "250-relay.test\r\n250-SIZE 1000000\r\n250 AUTH PLAIN\r\n",
            "AUTH" if script.hang_up_on_auth => break,
            "AUTH" if script.fail_auth => "535 5.7.8 Authentication credentials invalid\r\n",
            "AUTH" => "235 2.7.0 Authentication successful\r\n",
            "MAIL" => "250 2.1.0 OK\r\n",
            "RCPT" => match &script.reject_rcpt {
                Some(rejected) if line.contains(rejected.as_str()) => {
                    "550 5.1.1 No such user\r\n"
                }
                _ => "250 2.1.5 OK\r\n",
            },
            "DATA" => {
                in_data = true;
                "354 End data with <CR><LF>.<CR><LF>\r\n"
            }
            "RSET" => "250 2.0.0 Reset\r\n",
            "QUIT" => {
                let _ = write.write_all(b"221 2.0.0 Bye\r\n").await;
                break;
            }
            _ => "502 5.5.2 Command not recognized\r\n",
        };
        if write.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

#[tokio::test]
async fn test_session_walks_the_smtp_dialogue() {
    let relay = LoopbackRelay::spawn(RelayScript {
        reject_rcpt: Some("bad@example.org".to_string()),
        ..Default::default()
    })
    .await;
    let manager = RelayConnectionManager::new(
        SmtpConnector::new(relay.relay_config()),
        Some(Credentials::plain("sender@example.com", "secret")),
    );

    let mut handle = manager.connect().await.unwrap();
    let accepted = OutboundMessage::new("sender@example.com", "good@example.org", "Hi", "Body");
    let rejected = OutboundMessage::new("sender@example.com", "bad@example.org", "Hi", "Body");
    handle.send_one(&accepted).await.unwrap();
    let err = handle.send_one(&rejected).await.unwrap_err();
    handle.close().await.unwrap();

    assert_eq!(err.kind(), CampaignErrorKind::RecipientRejected);
    assert_eq!(err.smtp_code(), Some(550));
    assert!(!err.is_retryable());

    let (commands, _) = relay.finish().await;
    assert_eq!(commands[0], "EHLO localhost");
    assert!(commands[1].starts_with("AUTH PLAIN "));
    assert_eq!(
        &commands[2..],
        [
            "MAIL FROM:<sender@example.com>",
            "RCPT TO:<good@example.org>",
            "DATA",
            "MAIL FROM:<sender@example.com>",
            "RCPT TO:<bad@example.org>",
            "RSET",
            "QUIT",
        ]
    );
}

#[tokio::test]
async fn test_dispatcher_over_loopback_relay() {
    let relay = LoopbackRelay::spawn(RelayScript {
        reject_rcpt: Some(mocks::recipient_email(1)),
        ..Default::default()
    })
    .await;
    let mut config = mocks::test_config();
    config.relay = relay.relay_config();
    config.relay.password = mocks::test_config().relay.password;

    let mut dispatcher = CampaignDispatcher::smtp(config).unwrap();
    let report = dispatcher.run(&mocks::recipient_table(2)).await.unwrap();

    assert_eq!(report.metrics.sent, 1);
    assert_eq!(report.metrics.failed, 1);
    assert_eq!(report.failures.entries()[0].email, mocks::recipient_email(1));

    let (commands, data) = relay.finish().await;
    assert_eq!(commands.iter().filter(|c| c.as_str() == "QUIT").count(), 1);
    assert!(data.iter().any(|l| l == "Subject: Hello from Example"));
    assert!(data.iter().any(|l| l == "To: contact0@company0.test"));
    assert!(data.iter().any(|l| l.contains("Dear Person 0,")));
}

#[tokio::test]
async fn test_rejected_login_closes_session() {
    let relay = LoopbackRelay::spawn(RelayScript {
        fail_auth: true,
        ..Default::default()
    })
    .await;
    let mut config = mocks::test_config();
    config.relay = relay.relay_config();
    config.relay.password = mocks::test_config().relay.password;

    let mut dispatcher = CampaignDispatcher::smtp(config).unwrap();
    let err = dispatcher.run(&mocks::recipient_table(2)).await.unwrap_err();

    assert_eq!(err.kind(), CampaignErrorKind::CredentialsInvalid);
    assert!(dispatcher.outcomes().is_empty());

    let (commands, _) = relay.finish().await;
    assert!(!commands.iter().any(|c| c.starts_with("MAIL")));
    assert_eq!(commands.last().map(String::as_str), Some("QUIT"));
}

#[tokio::test]
async fn test_late_data_reply_aborts_without_resending() {
    let relay = LoopbackRelay::spawn(RelayScript {
        delay_data_reply: Some(Duration::from_millis(600)),
        ..Default::default()
    })
    .await;
    let mut config = mocks::test_config();
    config.relay = relay.relay_config();
    config.relay.password = mocks::test_config().relay.password;
    config.relay.command_timeout = Duration::from_millis(300);

    let mut dispatcher = CampaignDispatcher::smtp(config).unwrap();
    let err = dispatcher.run(&mocks::recipient_table(3)).await.unwrap_err();

    assert_eq!(err.kind(), CampaignErrorKind::ConnectionLost);
    assert_eq!(err.category(), ErrorCategory::Connection);
    assert_eq!(dispatcher.state(), DispatchState::Failed);
    // delivery state of the first recipient is unknown, so nothing is recorded
    assert!(dispatcher.outcomes().is_empty());
    assert!(dispatcher.failures().is_empty());

    let (commands, _) = relay.finish().await;
    assert_eq!(commands.iter().filter(|c| c.as_str() == "DATA").count(), 1);
    assert_eq!(commands.iter().filter(|c| c.starts_with("MAIL")).count(), 1);
    assert!(!commands.iter().any(|c| c == "QUIT"));
}

#[tokio::test]
async fn test_hang_up_during_login_is_connection_failure() {
    let relay = LoopbackRelay::spawn(RelayScript {
        hang_up_on_auth: true,
        ..Default::default()
    })
    .await;
    let mut config = mocks::test_config();
    config.relay = relay.relay_config();
    config.relay.password = mocks::test_config().relay.password;

    let mut dispatcher = CampaignDispatcher::smtp(config).unwrap();
    let err = dispatcher.run(&mocks::recipient_table(2)).await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Connection);
    assert!(err.is_fatal());
    assert_eq!(dispatcher.state(), DispatchState::Failed);
    assert!(dispatcher.outcomes().is_empty());

    let (commands, _) = relay.finish().await;
    assert!(commands.last().is_some_and(|c| c.starts_with("AUTH PLAIN ")));
    assert!(!commands.iter().any(|c| c.starts_with("MAIL")));
}
