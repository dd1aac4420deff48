//! IMAP transport implementation.
//!
//! This module provides the [`MailConnector`] used in production, built on
//! `async-imap`. Each call to [`ImapConnector::connect`] opens a brand new TCP
//! connection, optionally wrapped in TLS, and logs in; the resulting
//! [`ImapSession`] is owned by exactly one connection manager.
//!
//! # Protocol Details
//!
//! - IMAP4rev1 (RFC 3501) via `async-imap`
//! - IDLE (RFC 2177) for server push, interrupted through a cancellation token
//! - `NOOP` between IDLE rounds as the keep-alive
//! - `BODY.PEEK[]` fetches so syncing never marks mail as read

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::io::{AsyncRead, AsyncWrite};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;

use super::{
    FetchedMessage, IdleEvent, MailConnector, MailSession, MailboxSnapshot, Result,
    TransportError,
};
use crate::domain::Account;

/// Upper bound on TCP connect plus TLS handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the server acknowledging IDLE or DONE.
const IDLE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Byte stream an IMAP client can run over: TLS or plain TCP.
trait ImapIo: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T> ImapIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

type ImapStream = Box<dyn ImapIo>;

/// Authenticated `async-imap` session.
type RawSession = async_imap::Session<ImapStream>;

/// Opens IMAP sessions over TLS (via `tokio-rustls`) or plain TCP.
#[derive(Clone)]
pub struct ImapConnector {
    tls: TlsConnector,
}

impl ImapConnector {
    /// Creates a connector trusting the Mozilla root certificates.
    pub fn new() -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))
            .with_no_client_auth();

        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Establishes the byte stream, wrapping it with the futures compat layer.
    async fn open_stream(&self, account: &Account) -> Result<ImapStream> {
        let tcp_stream = TcpStream::connect((account.host.as_str(), account.port))
            .await
            .map_err(|e| TransportError::Connection(format!("TCP connect failed: {}", e)))?;

        if !account.use_tls {
            return Ok(Box::new(tcp_stream.compat()));
        }

        let server_name = ServerName::try_from(account.host.clone())
            .map_err(|e| TransportError::Connection(format!("invalid server name: {}", e)))?;

        let tls_stream = self
            .tls
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| TransportError::Connection(format!("TLS handshake failed: {}", e)))?;

        Ok(Box::new(tls_stream.compat()))
    }
}

impl Default for ImapConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailConnector for ImapConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn MailSession>> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, self.open_stream(account))
            .await
            .map_err(|_| TransportError::Connection("connect timed out".to_string()))??;

        let client = async_imap::Client::new(stream);

        let session = client
            .login(&account.username, account.secret())
            .await
            .map_err(|e| TransportError::Authentication(format!("IMAP login failed: {}", e.0)))?;

        tracing::info!(
            account_id = %account.id,
            host = %account.host,
            tls = account.use_tls,
            "IMAP session authenticated"
        );

        Ok(Box::new(ImapSession {
            session: Some(session),
        }))
    }
}

/// One authenticated IMAP connection.
///
/// The inner session is moved into the IDLE handle while waiting and restored
/// afterwards; it is `None` only after a failed IDLE round or logout.
pub struct ImapSession {
    session: Option<RawSession>,
}

impl ImapSession {
    fn session(&mut self) -> Result<&mut RawSession> {
        self.session
            .as_mut()
            .ok_or_else(|| TransportError::Connection("session closed".to_string()))
    }

    /// Formats a date the way `SEARCH SINCE` expects (`01-Jan-2024`).
    fn search_date(since: DateTime<Utc>) -> String {
        since.format("%d-%b-%Y").to_string()
    }

    /// Maps a folder-level change pushed during IDLE to an [`IdleEvent`].
    fn classify(response: &Response<'_>) -> IdleEvent {
        match response {
            Response::MailboxData(MailboxDatum::Exists(_)) => IdleEvent::NewMessage,
            Response::MailboxData(MailboxDatum::Recent(_)) => IdleEvent::NewMessage,
            Response::Expunge(_) => IdleEvent::MessageRemoved,
            _ => IdleEvent::Unsolicited,
        }
    }

    async fn uid_search(&mut self, query: &str) -> Result<Vec<u32>> {
        let session = self.session()?;
        let uids = session
            .uid_search(query)
            .await
            .map_err(|e| command_error("SEARCH", e))?;

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }
}

/// Maps an `async-imap` error, keeping socket failures distinct from refusals.
fn command_error(command: &str, error: async_imap::error::Error) -> TransportError {
    match error {
        async_imap::error::Error::Io(e) => {
            TransportError::Connection(format!("{} failed: {}", command, e))
        }
        other => TransportError::Protocol(format!("{} failed: {}", command, other)),
    }
}

#[async_trait]
impl MailSession for ImapSession {
    async fn select(&mut self, folder: &str) -> Result<MailboxSnapshot> {
        let mailbox = self
            .session()?
            .select(folder)
            .await
            .map_err(|e| command_error("SELECT", e))?;

        Ok(MailboxSnapshot {
            exists: mailbox.exists,
            uid_next: mailbox.uid_next,
            uid_validity: mailbox.uid_validity,
        })
    }

    async fn search_since(&mut self, since: DateTime<Utc>) -> Result<Vec<u32>> {
        self.uid_search(&format!("SINCE {}", Self::search_date(since)))
            .await
    }

    async fn search_after(&mut self, uid: u32) -> Result<Vec<u32>> {
        // `n:*` always matches the highest UID, even when it is below n.
        let next = uid.saturating_add(1);
        let uids = self.uid_search(&format!("UID {}:*", next)).await?;
        Ok(uids.into_iter().filter(|u| *u > uid).collect())
    }

    async fn fetch(&mut self, uid: u32) -> Result<Option<FetchedMessage>> {
        let session = self.session()?;
        let mut stream = session
            .uid_fetch(uid.to_string(), "(UID INTERNALDATE BODY.PEEK[])")
            .await
            .map_err(|e| command_error("FETCH", e))?;

        let mut found = None;
        while let Some(item) = stream.next().await {
            let fetch = item.map_err(|e| command_error("FETCH", e))?;
            if fetch.uid != Some(uid) {
                continue;
            }
            if let Some(body) = fetch.body() {
                found = Some(FetchedMessage {
                    uid,
                    internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
                    raw: body.to_vec(),
                });
            }
        }

        Ok(found)
    }

    async fn idle(&mut self, timeout: Duration, cancel: &CancellationToken) -> Result<IdleEvent> {
        let session = self
            .session
            .take()
            .ok_or_else(|| TransportError::Connection("session closed".to_string()))?;

        // Any early return below drops the handle and with it the connection.
        let mut handle = session.idle();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(IdleEvent::Interrupted),
            started = tokio::time::timeout(IDLE_HANDSHAKE_TIMEOUT, handle.init()) => match started {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(command_error("IDLE", e)),
                Err(_) => {
                    return Err(TransportError::Connection(
                        "IDLE not acknowledged".to_string(),
                    ))
                }
            },
        }

        let outcome = {
            let (wait, stop) = handle.wait();
            tokio::select! {
                result = tokio::time::timeout(timeout, wait) => match result {
                    Ok(Ok(IdleResponse::NewData(data))) => Ok(Self::classify(data.parsed())),
                    Ok(Ok(IdleResponse::Timeout)) | Err(_) => Ok(IdleEvent::KeepAliveDue),
                    Ok(Ok(IdleResponse::ManualInterrupt)) => Ok(IdleEvent::Interrupted),
                    Ok(Err(e)) => Err(command_error("IDLE", e)),
                },
                _ = cancel.cancelled() => {
                    drop(stop);
                    Ok(IdleEvent::Interrupted)
                }
            }
        };

        match tokio::time::timeout(IDLE_HANDSHAKE_TIMEOUT, handle.done()).await {
            Ok(Ok(session)) => {
                self.session = Some(session);
                outcome
            }
            _ if cancel.is_cancelled() => Ok(IdleEvent::Interrupted),
            Ok(Err(e)) => Err(command_error("DONE", e)),
            Err(_) => Err(TransportError::Connection(
                "DONE not acknowledged".to_string(),
            )),
        }
    }

    async fn keep_alive(&mut self) -> Result<()> {
        self.session()?
            .noop()
            .await
            .map_err(|e| command_error("NOOP", e))
    }

    async fn logout(&mut self) -> Result<()> {
        match self.session.take() {
            Some(mut session) => session
                .logout()
                .await
                .map_err(|e| command_error("LOGOUT", e)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn search_date_format() {
        let date = Utc.with_ymd_and_hms(2024, 3, 7, 15, 30, 0).unwrap();
        assert_eq!(ImapSession::search_date(date), "07-Mar-2024");
    }

    #[test]
    fn exists_signals_new_message() {
        let response = Response::MailboxData(MailboxDatum::Exists(12));
        assert_eq!(ImapSession::classify(&response), IdleEvent::NewMessage);
    }

    #[test]
    fn expunge_signals_removal() {
        let response = Response::Expunge(3);
        assert_eq!(ImapSession::classify(&response), IdleEvent::MessageRemoved);
    }

    #[tokio::test]
    async fn closed_session_reports_connection_error() {
        let mut session = ImapSession { session: None };
        let result = session.select("INBOX").await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
        assert!(session.logout().await.is_ok());
    }

    /// Serves LOGIN and IDLE but never acknowledges DONE.
    async fn stalling_server() -> u16 {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                let mut parts = line.splitn(2, ' ');
                let tag = parts.next().unwrap_or_default();
                let command = parts.next().unwrap_or_default().to_ascii_uppercase();

                let reply = if command.starts_with("LOGIN") {
                    format!("{} OK LOGIN completed\r\n", tag)
                } else if command.starts_with("IDLE") {
                    "+ idling\r\n".to_string()
                } else {
                    continue;
                };
                if write.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        port
    }

    #[tokio::test]
    async fn cancelled_idle_returns_when_done_is_never_acknowledged() {
        let port = stalling_server().await;
        let account = Account::new("local", "127.0.0.1", port, "user", "secret", false);
        let mut session = ImapConnector::new().connect(&account).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let event = tokio::time::timeout(
            Duration::from_secs(5),
            session.idle(Duration::from_secs(60), &cancel),
        )
        .await
        .expect("idle did not return after cancellation")
        .unwrap();

        assert_eq!(event, IdleEvent::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            session.keep_alive().await,
            Err(TransportError::Connection(_))
        ));
        assert!(session.logout().await.is_ok());
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let account = Account::new("local", "127.0.0.1", 1, "user", "secret", false);
        let result = ImapConnector::new().connect(&account).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }
}
