//! A real SMTP client library sending through the server

use std::sync::Arc;
use std::time::Duration;

use lettre::message::{Mailbox, Message};
use lettre::{SmtpTransport, Transport};
use mailcatch::{FileMessageStore, Server, ServerConfig};

#[tokio::test]
async fn test_lettre_send() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileMessageStore::new(dir.path()).unwrap());
    let server = Server::new(ServerConfig::with_hostname("localhost"), store);
    server.bind("127.0.0.1", 0).await.unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();
    let mut events = server.subscribe();

    let message = Message::builder()
        .from("Hanako <hanako@example.com>".parse::<Mailbox>().unwrap())
        .to("Taro <taro@example.com>".parse::<Mailbox>().unwrap())
        .subject("Greetings")
        .body(".leading dot\r\nsecond line".to_string())
        .unwrap();

    let sent = tokio::task::spawn_blocking(move || {
        let mailer = SmtpTransport::builder_dangerous("127.0.0.1")
            .port(port)
            .build();
        mailer.send(&message)
    })
    .await
    .unwrap();
    assert!(sent.is_ok(), "send failed: {:?}", sent.err());

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.mail_from, "hanako@example.com");
    assert_eq!(event.recipients, vec!["taro@example.com"]);

    let content = std::fs::read_to_string(&event.message.path).unwrap();
    assert!(content.contains("Subject: Greetings"));
    assert!(content.contains("\r\n.leading dot\r\n"));
    assert!(content.contains("second line"));

    server.stop().await;
}
