//! SMTP command interpretation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::connection::LineConnection;
use crate::session::SessionState;
use crate::store::{MessageStore, ReceivedMessage};
use crate::utils::safe_log_string;

const EVENT_CAPACITY: usize = 64;

const OK: &str = "250 OK";
const BAD_SEQUENCE: &str = "503 Bad sequence of commands";
const BAD_PARAMETER: &str = "504 Command parameter not implemented";
const START_INPUT: &str = "354 Start mail input; end with <CRLF>.<CRLF>";
const LOCAL_ERROR: &str = "451 Requested action aborted: local error in processing";
const CANNOT_VERIFY: &str = "252 Cannot VRFY user, but will accept message and attempt delivery";
const NOT_IMPLEMENTED: &str = "502 Command not implemented";
const UNRECOGNIZED: &str = "500 Command not recognized";
const GOODBYE: &str = "221 Goodbye!";

/// Turns command lines into session changes and replies.
///
/// One processor is shared by every connection of a server; all per-client
/// state lives in the [`SessionState`] passed to [`CommandProcessor::process`].
pub struct CommandProcessor {
    hostname: String,
    store: Arc<dyn MessageStore>,
    events: broadcast::Sender<ReceivedMessage>,
    received: AtomicU64,
}

impl CommandProcessor {
    pub fn new(hostname: impl Into<String>, store: Arc<dyn MessageStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            hostname: hostname.into(),
            store,
            events,
            received: AtomicU64::new(0),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Receives a notification for every message persisted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.events.subscribe()
    }

    /// Messages persisted since the processor was created
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub async fn process<S>(
        &self,
        line: &str,
        session: &mut SessionState,
        conn: &mut LineConnection<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        debug!(line = %safe_log_string(line), "Received");

        let parts: Vec<&str> = line.split(' ').collect();
        let args = line.split_once(' ').map_or("", |(_, rest)| rest);

        match parts[0].to_ascii_uppercase().as_str() {
            "HELO" => {
                session.sender_host = Some(parts.get(1).unwrap_or(&"unknown").to_string());
                conn.send(&format!("250 {}", self.hostname)).await?;
            }

            "EHLO" => {
                session.sender_host = Some(parts.get(1).unwrap_or(&"unknown").to_string());
                conn.send(&format!("250-{}", self.hostname)).await?;
                conn.send("250-8BITMIME").await?;
                conn.send(OK).await?;
            }

            "MAIL" | "SEND" | "SOML" | "SAML" => self.mail(args, session, conn).await?,

            "RCPT" => self.rcpt(args, session, conn).await?,

            "DATA" => self.data(session, conn).await?,

            "RSET" => {
                session.reset();
                conn.send(OK).await?;
            }

            "NOOP" => conn.send(OK).await?,

            "VRFY" | "EXPN" => conn.send(CANNOT_VERIFY).await?,

            "HELP" | "TURN" => conn.send(NOT_IMPLEMENTED).await?,

            "QUIT" => {
                conn.send(GOODBYE).await?;
                conn.close().await;
            }

            _ => conn.send(UNRECOGNIZED).await?,
        }

        Ok(())
    }

    async fn mail<S>(
        &self,
        args: &str,
        session: &mut SessionState,
        conn: &mut LineConnection<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        if session.sender_host.is_none() {
            conn.send(BAD_SEQUENCE).await?;
            return Ok(());
        }
        let Some((address, params)) = parse_path(args, "FROM") else {
            conn.send(BAD_PARAMETER).await?;
            return Ok(());
        };

        session.reset();
        session.use_utf8 = params
            .iter()
            .any(|p| p.eq_ignore_ascii_case("BODY=8BITMIME"));
        conn.send(&format!("250 <{}> OK", address)).await?;
        session.mail_from = Some(address);
        Ok(())
    }

    async fn rcpt<S>(
        &self,
        args: &str,
        session: &mut SessionState,
        conn: &mut LineConnection<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        if session.sender_host.is_none() || session.mail_from.is_none() {
            conn.send(BAD_SEQUENCE).await?;
            return Ok(());
        }
        let address = match parse_path(args, "TO") {
            Some((address, _)) if !address.is_empty() => address,
            _ => {
                conn.send(BAD_PARAMETER).await?;
                return Ok(());
            }
        };

        session.add_recipient(&address);
        conn.send(&format!("250 <{}> OK", address)).await?;
        Ok(())
    }

    async fn data<S>(&self, session: &mut SessionState, conn: &mut LineConnection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        if session.sender_host.is_none() || !session.has_transaction() {
            conn.send(BAD_SEQUENCE).await?;
            return Ok(());
        }
        conn.send(START_INPUT).await?;

        let mut lines = Vec::new();
        loop {
            match conn.read_raw_line(session.use_utf8).await {
                Ok(Some(line)) if line == "." => break,
                Ok(Some(line)) => match line.strip_prefix('.') {
                    Some(unstuffed) => lines.push(unstuffed.to_string()),
                    None => lines.push(line),
                },
                Ok(None) => {
                    warn!("Client disconnected before the end of DATA");
                    conn.close().await;
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read message body");
                    conn.close().await;
                    return Ok(());
                }
            }
        }

        session.set_message(lines.join("\r\n").into_bytes());

        match self.store.save(&lines).await {
            Ok(stored) => {
                self.received.fetch_add(1, Ordering::Relaxed);
                info!(
                    id = %stored.id,
                    size = stored.size,
                    recipients = session.recipients.len(),
                    "Message received"
                );
                let event = ReceivedMessage {
                    message: stored,
                    connection_id: conn.id(),
                    mail_from: session.mail_from.clone().unwrap_or_default(),
                    recipients: session.recipients.clone(),
                    received_at: Local::now(),
                };
                // Nobody may be listening
                let _ = self.events.send(event);
                conn.send(OK).await?;
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Failed to store message");
                conn.send(LOCAL_ERROR).await?;
            }
        }

        session.reset();
        Ok(())
    }
}

/// Splits `FROM:<addr> PARAM...` into the bare address and its parameters.
///
/// `None` when the keyword or the colon is missing, or no address follows.
fn parse_path<'a>(args: &'a str, keyword: &str) -> Option<(String, Vec<&'a str>)> {
    let (key, rest) = args.split_once(':')?;
    if !key.trim().eq_ignore_ascii_case(keyword) {
        return None;
    }

    let mut tokens = rest.split(' ').filter(|t| !t.is_empty());
    let address = tokens
        .next()?
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string();
    Some((address, tokens.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoredMessage;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl MessageStore for MemoryStore {
        async fn save(&self, lines: &[String]) -> Result<StoredMessage> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            let mut saved = self.saved.lock().unwrap();
            saved.push(lines.to_vec());
            let id = format!("{}.eml", saved.len());
            Ok(StoredMessage {
                path: PathBuf::from(&id),
                id,
                size: lines.join("\r\n").len(),
            })
        }
    }

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Client {
        async fn line(&mut self) -> String {
            let mut line = String::new();
            tokio::time::timeout(Duration::from_secs(1), self.reader.read_line(&mut line))
                .await
                .expect("reply timed out")
                .unwrap();
            line.trim_end().to_string()
        }

        async fn write(&mut self, line: &str) {
            self.writer
                .write_all(format!("{}\r\n", line).as_bytes())
                .await
                .unwrap();
        }

        async fn command(&mut self, line: &str) -> String {
            self.write(line).await;
            self.line().await
        }

        async fn is_closed(&mut self) -> bool {
            let mut rest = String::new();
            matches!(
                tokio::time::timeout(Duration::from_secs(1), self.reader.read_line(&mut rest)).await,
                Ok(Ok(0))
            )
        }
    }

    fn start(store: Arc<MemoryStore>) -> (Client, Arc<CommandProcessor>) {
        let processor = Arc::new(CommandProcessor::new("test-host", store));
        let (client, server) = tokio::io::duplex(1024);
        let (connection, _handle) = LineConnection::new(1, server, None, true);
        tokio::spawn(connection.run(processor.clone()));

        let (reader, writer) = tokio::io::split(client);
        let client = Client {
            reader: BufReader::new(reader),
            writer,
        };
        (client, processor)
    }

    #[tokio::test]
    async fn test_full_transaction() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, processor) = start(store.clone());
        let mut events = processor.subscribe();

        assert_eq!(client.line().await, "220 test-host");

        client.write("EHLO client.example").await;
        assert_eq!(client.line().await, "250-test-host");
        assert_eq!(client.line().await, "250-8BITMIME");
        assert_eq!(client.line().await, "250 OK");

        assert_eq!(
            client.command("MAIL FROM:<a@example.com>").await,
            "250 <a@example.com> OK"
        );
        assert_eq!(
            client.command("RCPT TO:<b@example.com>").await,
            "250 <b@example.com> OK"
        );
        assert_eq!(
            client.command("DATA").await,
            "354 Start mail input; end with <CRLF>.<CRLF>"
        );

        client.write("Subject: hi").await;
        client.write("").await;
        client.write("Hello").await;
        assert_eq!(client.command(".").await, "250 OK");

        let saved = store.saved.lock().unwrap().clone();
        assert_eq!(saved, vec![vec!["Subject: hi", "", "Hello"]]);

        let event = events.recv().await.unwrap();
        assert_eq!(event.mail_from, "a@example.com");
        assert_eq!(event.recipients, vec!["b@example.com"]);
        assert_eq!(event.connection_id, 1);
        assert_eq!(event.message.id, "1.eml");
        assert_eq!(processor.received_count(), 1);

        assert_eq!(client.command("QUIT").await, "221 Goodbye!");
        assert!(client.is_closed().await);
    }

    #[tokio::test]
    async fn test_dot_unstuffing() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, _processor) = start(store.clone());
        client.line().await;

        client.command("HELO client.example").await;
        client.command("MAIL FROM:<a@example.com>").await;
        client.command("RCPT TO:<b@example.com>").await;
        client.command("DATA").await;

        client.write("..foo").await;
        client.write("...").await;
        client.write(".bar").await;
        client.write("plain.").await;
        assert_eq!(client.command(".").await, "250 OK");

        let saved = store.saved.lock().unwrap().clone();
        assert_eq!(saved, vec![vec![".foo", "..", "bar", "plain."]]);
    }

    #[tokio::test]
    async fn test_pipelined_body_is_not_dispatched() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, _processor) = start(store.clone());
        client.line().await;

        client
            .writer
            .write_all(
                b"HELO c\r\nMAIL FROM:<a@x>\r\nRCPT TO:<b@x>\r\nDATA\r\nQUIT\r\nNOOP\r\n.\r\n",
            )
            .await
            .unwrap();

        assert_eq!(client.line().await, "250 test-host");
        assert_eq!(client.line().await, "250 <a@x> OK");
        assert_eq!(client.line().await, "250 <b@x> OK");
        assert!(client.line().await.starts_with("354"));
        assert_eq!(client.line().await, "250 OK");

        let saved = store.saved.lock().unwrap().clone();
        assert_eq!(saved, vec![vec!["QUIT", "NOOP"]]);
    }

    #[tokio::test]
    async fn test_data_out_of_sequence() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, _processor) = start(store.clone());
        client.line().await;

        client.command("HELO client.example").await;
        assert!(client.command("DATA").await.starts_with("503"));

        client.command("MAIL FROM:<a@example.com>").await;
        assert!(client.command("DATA").await.starts_with("503"));

        assert!(store.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ordering_before_helo() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, _processor) = start(store);
        client.line().await;

        assert_eq!(
            client.command("MAIL FROM:<a@example.com>").await,
            BAD_SEQUENCE
        );
        assert_eq!(client.command("RCPT TO:<b@example.com>").await, BAD_SEQUENCE);

        client.command("HELO client.example").await;
        assert_eq!(client.command("RCPT TO:<b@example.com>").await, BAD_SEQUENCE);
    }

    #[tokio::test]
    async fn test_malformed_parameters() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, _processor) = start(store);
        client.line().await;
        client.command("HELO client.example").await;

        assert_eq!(client.command("MAIL").await, BAD_PARAMETER);
        assert_eq!(client.command("MAIL <a@example.com>").await, BAD_PARAMETER);
        assert_eq!(client.command("MAIL TO:<a@example.com>").await, BAD_PARAMETER);

        assert_eq!(
            client.command("mail from: <a@example.com>").await,
            "250 <a@example.com> OK"
        );
        assert_eq!(client.command("RCPT <b@example.com>").await, BAD_PARAMETER);
        assert_eq!(client.command("RCPT TO:<>").await, BAD_PARAMETER);
    }

    #[tokio::test]
    async fn test_second_mail_resets_transaction() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, processor) = start(store.clone());
        let mut events = processor.subscribe();
        client.line().await;

        client.command("EHLO client.example").await;
        client.line().await;
        client.line().await;
        client
            .command("MAIL FROM:<first@example.com> BODY=8BITMIME")
            .await;
        client.command("RCPT TO:<old@example.com>").await;

        client.command("MAIL FROM:<second@example.com>").await;
        client.command("RCPT TO:<new@example.com>").await;
        client.command("DATA").await;
        client.write("body").await;
        assert_eq!(client.command(".").await, "250 OK");

        let event = events.recv().await.unwrap();
        assert_eq!(event.mail_from, "second@example.com");
        assert_eq!(event.recipients, vec!["new@example.com"]);
    }

    #[tokio::test]
    async fn test_body_decoding_follows_8bitmime() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, _processor) = start(store.clone());
        client.line().await;

        client.command("HELO client.example").await;
        client.command("MAIL FROM:<a@x> BODY=8BITMIME").await;
        client.command("RCPT TO:<b@x>").await;
        client.command("DATA").await;
        client.write("café").await;
        assert_eq!(client.command(".").await, "250 OK");

        // A new MAIL without BODY=8BITMIME falls back to ASCII
        client.command("MAIL FROM:<a@x>").await;
        client.command("RCPT TO:<b@x>").await;
        client.command("DATA").await;
        client.write("café").await;
        assert_eq!(client.command(".").await, "250 OK");

        let saved = store.saved.lock().unwrap().clone();
        assert_eq!(saved, vec![vec!["café"], vec!["caf??"]]);
    }

    #[tokio::test]
    async fn test_rset_then_fresh_transaction() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, processor) = start(store.clone());
        let mut events = processor.subscribe();
        client.line().await;

        client.command("HELO client.example").await;
        client.command("MAIL FROM:<a@example.com>").await;
        client.command("RCPT TO:<b@example.com>").await;
        assert_eq!(client.command("RSET").await, "250 OK");
        assert!(client.command("DATA").await.starts_with("503"));

        client.command("MAIL FROM:<c@example.com>").await;
        client.command("RCPT TO:<d@example.com>").await;
        client.command("RCPT TO:<d@example.com>").await;
        client.command("DATA").await;
        client.write("after reset").await;
        assert_eq!(client.command(".").await, "250 OK");

        let event = events.recv().await.unwrap();
        assert_eq!(event.mail_from, "c@example.com");
        assert_eq!(event.recipients, vec!["d@example.com"]);
        assert_eq!(store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transaction_ends_after_data() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, _processor) = start(store.clone());
        client.line().await;

        client.command("HELO client.example").await;
        client.command("MAIL FROM:<a@example.com>").await;
        client.command("RCPT TO:<b@example.com>").await;
        client.command("DATA").await;
        assert_eq!(client.command(".").await, "250 OK");

        assert_eq!(client.command("DATA").await, BAD_SEQUENCE);
        assert_eq!(store.saved.lock().unwrap().clone(), vec![Vec::<String>::new()]);
    }

    #[tokio::test]
    async fn test_simple_replies() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, _processor) = start(store);
        client.line().await;

        assert_eq!(client.command("NOOP").await, "250 OK");
        assert!(client.command("VRFY someone").await.starts_with("252"));
        assert!(client.command("expn list").await.starts_with("252"));
        assert_eq!(client.command("HELP").await, NOT_IMPLEMENTED);
        assert_eq!(client.command("TURN").await, NOT_IMPLEMENTED);
        assert_eq!(client.command("FOO").await, UNRECOGNIZED);
        assert_eq!(client.command("").await, UNRECOGNIZED);
        assert_eq!(client.command("helo client.example").await, "250 test-host");
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_session() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, _processor) = start(store.clone());
        client.line().await;

        client.command("HELO client.example").await;
        client.command("MAIL FROM:<a@example.com>").await;
        client.command("RCPT TO:<b@example.com>").await;
        assert_eq!(client.command("FOO bar").await, UNRECOGNIZED);
        assert!(client.command("DATA").await.starts_with("354"));
        assert_eq!(client.command(".").await, "250 OK");
    }

    #[tokio::test]
    async fn test_store_failure_reports_local_error() {
        let store = Arc::new(MemoryStore {
            fail: true,
            ..MemoryStore::default()
        });
        let (mut client, _processor) = start(store);
        client.line().await;

        client.command("HELO client.example").await;
        client.command("MAIL FROM:<a@example.com>").await;
        client.command("RCPT TO:<b@example.com>").await;
        client.command("DATA").await;
        assert_eq!(client.command(".").await, LOCAL_ERROR);
        assert_eq!(client.command("NOOP").await, "250 OK");
    }

    #[tokio::test]
    async fn test_disconnect_during_data_saves_nothing() {
        let store = Arc::new(MemoryStore::default());
        let (mut client, _processor) = start(store.clone());
        client.line().await;

        client.command("HELO client.example").await;
        client.command("MAIL FROM:<a@example.com>").await;
        client.command("RCPT TO:<b@example.com>").await;
        client.command("DATA").await;
        client.write("partial").await;
        client.writer.shutdown().await.unwrap();

        assert!(client.is_closed().await);
        assert!(store.saved.lock().unwrap().is_empty());
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("FROM:<a@example.com> BODY=8BITMIME", "FROM"),
            Some(("a@example.com".to_string(), vec!["BODY=8BITMIME"]))
        );
        assert_eq!(
            parse_path("to:b@example.com", "TO"),
            Some(("b@example.com".to_string(), vec![]))
        );
        assert_eq!(parse_path("FROM:<>", "FROM"), Some((String::new(), vec![])));
        assert_eq!(parse_path("FROM:", "FROM"), None);
        assert_eq!(parse_path("FROM <a@example.com>", "FROM"), None);
        assert_eq!(parse_path("TO:<a@example.com>", "FROM"), None);
    }
}
