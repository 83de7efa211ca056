//! POP3 client session

use super::command::Pop3Command;
use super::response::{is_terminator, parse_list_line, parse_uidl_line, unstuff, Pop3Reply};
use super::stream::{tls_connector, MailStream};
use super::{Connector, MailboxConnection, MessageId, Pop3Error};
use async_trait::async_trait;
use postmaster_common::config::InboundConfig;
use postmaster_common::types::MailAccount;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// POP3 client over any async byte stream
pub struct Pop3Client<S> {
    stream: BufReader<S>,
    command_timeout: Duration,
    /// Set once the stream may hold unread reply bytes
    broken: Option<String>,
}

impl<S> Pop3Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, command_timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            command_timeout,
            broken: None,
        }
    }

    /// Read the server greeting; anything but `+OK` ends the session
    pub async fn read_greeting(&mut self) -> Result<String, Pop3Error> {
        let timeout = self.command_timeout;
        let reply = tokio::time::timeout(timeout, self.read_status())
            .await
            .map_err(|_| Pop3Error::Timeout("greeting".to_string()))??;

        let reply = reply.into_result()?;
        debug!(greeting = %reply.text, "POP3 server ready");
        Ok(reply.text)
    }

    /// Send one command and read its reply, plus the body for multi-line commands
    ///
    /// After a transport failure, a timeout or a garbled reply the session
    /// is out of sync and every later command fails with
    /// [`Pop3Error::SessionBroken`] without touching the stream.
    pub async fn execute(
        &mut self,
        command: &Pop3Command,
    ) -> Result<(Pop3Reply, Option<Vec<u8>>), Pop3Error> {
        if let Some(reason) = &self.broken {
            return Err(Pop3Error::SessionBroken(reason.clone()));
        }

        debug!(command = %command, "POP3 command");
        let timeout = self.command_timeout;

        let result = match tokio::time::timeout(timeout, self.exchange(command)).await {
            Ok(result) => result,
            Err(_) => Err(Pop3Error::Timeout(command.verb().to_string())),
        };

        if let Err(err) = &result {
            if err.breaks_session() {
                debug!(command = command.verb(), error = %err, "POP3 session out of sync");
                self.broken = Some(format!("{} failed: {}", command.verb(), err));
            }
        }
        result
    }

    async fn exchange(
        &mut self,
        command: &Pop3Command,
    ) -> Result<(Pop3Reply, Option<Vec<u8>>), Pop3Error> {
        let writer = self.stream.get_mut();
        writer.write_all(command.to_line().as_bytes()).await?;
        writer.flush().await?;

        let reply = self.read_status().await?.into_result()?;
        let body = if command.is_multiline() {
            Some(self.read_body().await?)
        } else {
            None
        };
        Ok((reply, body))
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, Pop3Error> {
        let mut line = Vec::new();
        let n = self.stream.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(Pop3Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        Ok(line)
    }

    async fn read_status(&mut self) -> Result<Pop3Reply, Pop3Error> {
        let line = self.read_line().await?;
        let reply = Pop3Reply::parse(&String::from_utf8_lossy(&line))?;
        trace!(positive = reply.positive, text = %reply.text, "POP3 reply");
        Ok(reply)
    }

    async fn read_body(&mut self) -> Result<Vec<u8>, Pop3Error> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await?;
            if is_terminator(&line) {
                return Ok(body);
            }
            body.extend_from_slice(unstuff(&line));
        }
    }

    async fn listing<F>(&mut self, command: Pop3Command, parse: F) -> Result<Vec<MessageId>, Pop3Error>
    where
        F: Fn(&str) -> Result<MessageId, Pop3Error>,
    {
        let (_, body) = self.execute(&command).await?;
        let body = body.unwrap_or_default();

        String::from_utf8_lossy(&body)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(parse)
            .collect()
    }
}

#[async_trait]
impl<S> MailboxConnection for Pop3Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn authenticate(&mut self, user: &str, password: &str) -> Result<(), Pop3Error> {
        self.execute(&Pop3Command::User {
            username: user.to_string(),
        })
        .await?;
        self.execute(&Pop3Command::Pass {
            password: password.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn list_unique(&mut self) -> Result<Vec<MessageId>, Pop3Error> {
        self.listing(Pop3Command::Uidl, parse_uidl_line).await
    }

    async fn list(&mut self) -> Result<Vec<MessageId>, Pop3Error> {
        self.listing(Pop3Command::List, parse_list_line).await
    }

    async fn retrieve(&mut self, seq: u32) -> Result<Vec<u8>, Pop3Error> {
        let (_, body) = self.execute(&Pop3Command::Retr { msg: seq }).await?;
        Ok(body.unwrap_or_default())
    }

    async fn mark_deleted(&mut self, seqs: &[u32]) -> Result<(), Pop3Error> {
        for seq in seqs {
            self.execute(&Pop3Command::Dele { msg: *seq }).await?;
        }
        Ok(())
    }

    async fn quit(&mut self) -> Result<(), Pop3Error> {
        self.execute(&Pop3Command::Quit).await?;
        // The server closes after QUIT, deletions are already committed.
        if let Err(err) = self.stream.get_mut().shutdown().await {
            trace!(error = %err, "POP3 shutdown after QUIT failed");
        }
        Ok(())
    }
}

/// Opens live POP3 sessions over TCP or implicit TLS
#[derive(Clone)]
pub struct Pop3Connector {
    dial_timeout: Duration,
    command_timeout: Duration,
    tls: TlsConnector,
}

impl Pop3Connector {
    pub fn new(dial_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            command_timeout,
            tls: tls_connector(),
        }
    }

    /// Build from the `[inbound]` configuration section
    pub fn from_config(config: &InboundConfig) -> Self {
        Self::new(
            Duration::from_secs(config.dial_timeout_secs),
            Duration::from_secs(config.command_timeout_secs),
        )
    }
}

#[async_trait]
impl Connector for Pop3Connector {
    async fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailboxConnection>, Pop3Error> {
        let protocol = account.protocol().ok_or_else(|| {
            Pop3Error::Protocol(format!("unsupported account type: {}", account.account_type))
        })?;
        let port = account.effective_port();

        debug!(
            account_id = account.id,
            host = %account.host,
            port,
            tls = protocol.uses_tls(),
            "Dialing mailbox"
        );

        let tcp = tokio::time::timeout(
            self.dial_timeout,
            TcpStream::connect((account.host.as_str(), port)),
        )
        .await
        .map_err(|_| Pop3Error::Timeout(format!("dial {}:{}", account.host, port)))??;

        let stream = if protocol.uses_tls() {
            tokio::time::timeout(
                self.dial_timeout,
                MailStream::wrap_tls(&self.tls, &account.host, tcp),
            )
            .await
            .map_err(|_| Pop3Error::Timeout(format!("tls handshake with {}", account.host)))??
        } else {
            MailStream::Plain(tcp)
        };

        let mut client = Pop3Client::new(stream, self.command_timeout);
        client.read_greeting().await?;
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    /// Scripted server: sends the greeting, then answers each expected command
    fn spawn_server(
        server: DuplexStream,
        greeting: &'static str,
        script: Vec<(&'static str, &'static str)>,
    ) -> JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            reader.get_mut().write_all(greeting.as_bytes()).await.unwrap();

            let mut seen = Vec::new();
            for (expect, reply) in script {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                assert!(line.starts_with(expect), "expected {expect}, got {line:?}");
                seen.push(line.trim_end().to_string());
                reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
            seen
        })
    }

    fn client(stream: DuplexStream) -> Pop3Client<DuplexStream> {
        Pop3Client::new(stream, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_full_session() {
        let (client_side, server_side) = duplex(4096);
        let server = spawn_server(
            server_side,
            "+OK POP3 ready\r\n",
            vec![
                ("USER agent", "+OK\r\n"),
                ("PASS secret", "+OK logged in\r\n"),
                ("UIDL", "+OK\r\n1 uid-1\r\n2 uid-2\r\n.\r\n"),
                (
                    "RETR 1",
                    "+OK 40 octets\r\nSubject: hi\r\n\r\n..dotted line\r\nbody\r\n.\r\n",
                ),
                ("DELE 1", "+OK deleted\r\n"),
                ("QUIT", "+OK bye\r\n"),
            ],
        );

        let mut pop3 = client(client_side);
        assert_eq!(pop3.read_greeting().await.unwrap(), "POP3 ready");
        pop3.authenticate("agent", "secret").await.unwrap();

        let listing = pop3.list_unique().await.unwrap();
        assert_eq!(
            listing,
            vec![
                MessageId {
                    seq: 1,
                    uid: "uid-1".to_string(),
                    size: None
                },
                MessageId {
                    seq: 2,
                    uid: "uid-2".to_string(),
                    size: None
                },
            ]
        );

        let raw = pop3.retrieve(1).await.unwrap();
        assert_eq!(
            String::from_utf8(raw).unwrap(),
            "Subject: hi\r\n\r\n.dotted line\r\nbody\r\n"
        );

        pop3.mark_deleted(&[1]).await.unwrap();
        pop3.quit().await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 6);
        assert_eq!(seen[1], "PASS secret");
    }

    #[tokio::test]
    async fn test_list_fallback_uses_sequence_as_uid() {
        let (client_side, server_side) = duplex(1024);
        let server = spawn_server(
            server_side,
            "+OK\r\n",
            vec![("LIST", "+OK 2 messages\r\n1 120\r\n2 340\r\n.\r\n")],
        );

        let mut pop3 = client(client_side);
        pop3.read_greeting().await.unwrap();
        let listing = pop3.list().await.unwrap();

        assert_eq!(listing[1].uid, "2");
        assert_eq!(listing[1].size, Some(340));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_negative_greeting() {
        let (client_side, server_side) = duplex(256);
        let _server = spawn_server(server_side, "-ERR too busy\r\n", vec![]);

        let mut pop3 = client(client_side);
        let err = pop3.read_greeting().await.unwrap_err();
        assert!(matches!(err, Pop3Error::Negative(ref text) if text == "too busy"));
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let (client_side, server_side) = duplex(256);
        let _server = spawn_server(
            server_side,
            "+OK\r\n",
            vec![("USER", "+OK\r\n"), ("PASS", "-ERR invalid credentials\r\n")],
        );

        let mut pop3 = client(client_side);
        pop3.read_greeting().await.unwrap();
        let err = pop3.authenticate("agent", "wrong").await.unwrap_err();
        assert!(matches!(err, Pop3Error::Negative(_)));
    }

    #[tokio::test]
    async fn test_retrieve_missing_message() {
        let (client_side, server_side) = duplex(256);
        let _server = spawn_server(
            server_side,
            "+OK\r\n",
            vec![("RETR 9", "-ERR No such message\r\n")],
        );

        let mut pop3 = client(client_side);
        pop3.read_greeting().await.unwrap();
        let err = pop3.retrieve(9).await.unwrap_err();
        assert!(err.is_no_such_message());
    }

    #[tokio::test]
    async fn test_connection_closed_mid_body() {
        let (client_side, server_side) = duplex(256);
        let server = tokio::spawn(async move {
            let mut reader = BufReader::new(server_side);
            reader.get_mut().write_all(b"+OK\r\n").await.unwrap();
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            reader
                .get_mut()
                .write_all(b"+OK\r\npartial line\r\n")
                .await
                .unwrap();
        });

        let mut pop3 = client(client_side);
        pop3.read_greeting().await.unwrap();

        let err = pop3.retrieve(1).await.unwrap_err();
        assert!(matches!(err, Pop3Error::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        server.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_session_refuses_further_commands() {
        let (client_side, server_side) = duplex(1024);
        let server = tokio::spawn(async move {
            let mut reader = BufReader::new(server_side);
            reader.get_mut().write_all(b"+OK\r\n").await.unwrap();
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(line.starts_with("RETR 1"));

            reader
                .get_mut()
                .write_all(b"+OK\r\nfirst line\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = reader.get_mut().write_all(b"late tail\r\n.\r\n").await;

            // whatever the client sent after RETR
            let mut next = String::new();
            reader.read_line(&mut next).await.unwrap_or(0);
            next
        });

        let mut pop3 = Pop3Client::new(client_side, Duration::from_secs(2));
        pop3.read_greeting().await.unwrap();

        let err = pop3.retrieve(1).await.unwrap_err();
        assert!(matches!(err, Pop3Error::Timeout(ref what) if what == "RETR"));

        let err = pop3.mark_deleted(&[1]).await.unwrap_err();
        assert!(matches!(err, Pop3Error::SessionBroken(ref why) if why.starts_with("RETR")));
        assert!(matches!(pop3.quit().await, Err(Pop3Error::SessionBroken(_))));

        drop(pop3);
        assert_eq!(server.await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_negative_reply_keeps_session_usable() {
        let (client_side, server_side) = duplex(256);
        let server = spawn_server(
            server_side,
            "+OK\r\n",
            vec![
                ("RETR 9", "-ERR No such message\r\n"),
                ("DELE 1", "+OK\r\n"),
            ],
        );

        let mut pop3 = client(client_side);
        pop3.read_greeting().await.unwrap();
        assert!(pop3.retrieve(9).await.unwrap_err().is_no_such_message());
        pop3.mark_deleted(&[1]).await.unwrap();
        assert_eq!(server.await.unwrap(), vec!["RETR 9", "DELE 1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout() {
        let (client_side, _server_side) = duplex(256);
        let mut pop3 = Pop3Client::new(client_side, Duration::from_secs(2));

        let err = pop3.read_greeting().await.unwrap_err();
        assert!(matches!(err, Pop3Error::Timeout(ref what) if what == "greeting"));
    }
}
