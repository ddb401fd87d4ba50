//! Per-client session runtime. After startup a session runs two
//! cooperating tasks: the decoder reads frames and drives the protocol
//! state machine, the writer is the only task that touches the socket's
//! write half. They are joined by a bounded result channel carrying
//! `(result, sync_after)` pairs; the decoder closes it to signal the
//! writer, and the writer fires a shutdown signal to stop the decoder.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

use herald_common::config::{AuthMethod, HeraldConfig};
use herald_common::error::{DispatchError, ProtocolError, SessionError};

use crate::auth;
use crate::codec::{BackendMessage, FrontendMessage, MessageReader, MessageWriter};
use crate::dispatch::{Inbox, Notification, NotifyDispatcher, INBOX_CAPACITY};
use crate::liveness::LivenessSignal;
use crate::parser::parse_query;
use crate::query::{ParsedQuery, QueryResult};

/// Capacity of the decoder→writer result channel. A slow socket writer
/// eventually blocks the decoder from reading further request frames.
pub const RESULT_CHANNEL_CAPACITY: usize = 8;

/// A query result plus whether a `ReadyForQuery` must follow it.
#[derive(Debug)]
struct ResultSync {
    result: QueryResult,
    sync_after: bool,
}

/// First-writer-wins terminal error slot shared by decoder and writer.
#[derive(Default)]
struct TerminalError(Mutex<Option<SessionError>>);

impl TerminalError {
    fn record(&self, err: SessionError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn take(&self) -> Option<SessionError> {
        self.0.lock().take()
    }
}

pub struct FrontendSession<S> {
    remote_addr: String,
    session_id: u64,
    stream: S,
    dispatcher: Arc<NotifyDispatcher>,
    liveness: LivenessSignal,
    config: Arc<HeraldConfig>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> FrontendSession<S> {
    pub fn new(
        stream: S,
        remote_addr: String,
        session_id: u64,
        dispatcher: Arc<NotifyDispatcher>,
        liveness: LivenessSignal,
        config: Arc<HeraldConfig>,
    ) -> Self {
        Self {
            remote_addr,
            session_id,
            stream,
            dispatcher,
            liveness,
            config,
        }
    }

    /// Drive the session to completion: startup handshake, then the
    /// decoder/writer pair, then teardown.
    pub async fn run(self) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        let mut reader = MessageReader::new(read_half);
        let mut writer = MessageWriter::new(write_half);

        if !startup(&mut reader, &mut writer, &self.config, &self.remote_addr).await {
            let _ = writer.close().await;
            return;
        }

        let (inbox_tx, mut inbox_rx) = mpsc::channel::<Notification>(INBOX_CAPACITY);
        let (result_tx, mut result_rx) = mpsc::channel::<ResultSync>(RESULT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let error = Arc::new(TerminalError::default());

        let decoder = Decoder {
            reader,
            dispatcher: self.dispatcher.clone(),
            session_id: self.session_id,
            inbox: inbox_tx,
            results: result_tx,
            listen_channels: HashSet::new(),
            error: error.clone(),
            shutdown: shutdown_rx,
        };
        let decoder_task = tokio::spawn(decoder.run());

        let mut liveness = self.liveness;
        loop {
            tokio::select! {
                next = result_rx.recv() => match next {
                    // decoder finished and closed the channel
                    None => break,
                    Some(ResultSync { result, sync_after }) => {
                        if let Err(e) = result.respond(&mut writer).await {
                            error.record(ProtocolError::from(e).into());
                            break;
                        }
                        if sync_after {
                            let ready = async {
                                writer.send(&BackendMessage::ReadyForQuery).await?;
                                writer.flush().await
                            };
                            if let Err(e) = ready.await {
                                error.record(ProtocolError::from(e).into());
                                break;
                            }
                        }
                    }
                },
                notification = inbox_rx.recv() => match notification {
                    None => break,
                    Some(n) => {
                        if inbox_rx.len() >= INBOX_CAPACITY - 1 {
                            herald_observability::record_slow_client_terminated();
                            error.record(SessionError::ClientCouldNotKeepUp);
                            break;
                        }
                        let deliver = async {
                            writer.send(&BackendMessage::NotificationResponse {
                                pid: n.pid,
                                channel: n.channel,
                                payload: n.payload,
                            }).await?;
                            writer.flush().await
                        };
                        if let Err(e) = deliver.await {
                            error.record(ProtocolError::from(e).into());
                            break;
                        }
                        herald_observability::record_notification_dispatched();
                    }
                },
                _ = liveness.lost() => {
                    error.record(SessionError::LostServerConnection);
                    break;
                }
            }
        }

        // Teardown. Stop the decoder, drain the result channel so it can
        // never block on a submit, then take its channel set back.
        let _ = shutdown_tx.send(true);
        while result_rx.recv().await.is_some() {}
        let listen_channels = decoder_task.await.unwrap_or_default();

        let err = error.take().unwrap_or(SessionError::GracefulTermination);
        if err.wants_fatal_frame() {
            // The connection might be gone already; errors are irrelevant.
            let _ = writer
                .send(&BackendMessage::ErrorResponse {
                    severity: "FATAL",
                    code: err.sqlstate(),
                    message: err.to_string(),
                })
                .await;
            let _ = writer.flush().await;
        }
        let _ = writer.close().await;

        match &err {
            SessionError::GracefulTermination => {}
            // The loss itself is logged once by the upstream driver; no
            // need to recite it for every client being thrown out.
            SessionError::LostServerConnection => {}
            other => tracing::info!("client {} disconnected: {}", self.remote_addr, other),
        }

        for channel in &listen_channels {
            match self.dispatcher.unlisten(channel, self.session_id) {
                Ok(()) | Err(DispatchError::NotSubscribed) => {}
                Err(e) => tracing::warn!("could not unlisten: {}", e),
            }
        }
    }
}

/// Startup phase: handshake frames, authentication, parameter replay.
/// Returns false when the session must close; any refusal frame has
/// already been sent.
async fn startup<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    config: &HeraldConfig,
    remote_addr: &str,
) -> bool
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match run_startup(reader, writer, config).await {
        Ok(accepted) => accepted,
        Err(e) => {
            tracing::debug!("error during startup sequence with {}: {}", remote_addr, e);
            false
        }
    }
}

async fn run_startup<R, W>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    config: &HeraldConfig,
) -> Result<bool, ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let params = loop {
        match reader.next_startup().await? {
            FrontendMessage::SslRequest => {
                writer.send_ssl_reject().await?;
                writer.flush().await?;
            }
            // cancel requests arrive on their own connection and are
            // dropped without a reply
            FrontendMessage::CancelRequest => return Ok(false),
            FrontendMessage::Startup { params, .. } => break params,
            other => {
                tracing::warn!("unrecognized message {} during startup", other.name());
                return Ok(false);
            }
        }
    };

    let user = match params.get("user") {
        Some(user) => user.clone(),
        None => {
            return auth_failed(
                writer,
                "08P01",
                "required startup parameter \"user\" not present in startup packet",
            )
            .await
        }
    };
    let dbname = params
        .get("database")
        .cloned()
        .unwrap_or_else(|| user.clone());

    let db = match config.find_database(&dbname) {
        Some(db) => db,
        None => {
            return auth_failed(
                writer,
                "3D000",
                format!("database \"{}\" does not exist", dbname),
            )
            .await
        }
    };

    match db.auth.method {
        AuthMethod::Trust => {}
        AuthMethod::Md5 => {
            let salt = auth::generate_salt();
            writer
                .send(&BackendMessage::AuthenticationMd5Password { salt })
                .await?;
            writer.flush().await?;

            let password = match reader.next().await? {
                FrontendMessage::Password(body) => body,
                other => {
                    return auth_failed(
                        writer,
                        "08P01",
                        format!("unexpected response {}", other.name()),
                    )
                    .await
                }
            };
            // don't bother with responses which are clearly too big
            if password.len() > 100 || !auth::verify_md5(db, &user, salt, &password) {
                return auth_failed(
                    writer,
                    "28001",
                    format!("password authentication failed for user \"{}\"", user),
                )
                .await;
            }
        }
    }

    writer.send(&BackendMessage::AuthenticationOk).await?;
    for (name, value) in &config.startup_parameters {
        writer
            .send(&BackendMessage::ParameterStatus {
                name: name.clone(),
                value: value.clone(),
            })
            .await?;
    }
    writer.send(&BackendMessage::ReadyForQuery).await?;
    writer.flush().await?;
    Ok(true)
}

async fn auth_failed<W: AsyncWrite + Unpin>(
    writer: &mut MessageWriter<W>,
    code: &'static str,
    message: impl Into<String>,
) -> Result<bool, ProtocolError> {
    writer
        .send(&BackendMessage::ErrorResponse {
            severity: "FATAL",
            code,
            message: message.into(),
        })
        .await?;
    writer.flush().await?;
    Ok(false)
}

/// Decoder stop marker; the terminal error, if any, is already recorded.
struct Stop;

type Step = Result<(), Stop>;

/// The decoder half of a session. Owns the read half of the socket, the
/// `listen_channels` set and the unnamed-statement slot. It never writes
/// to the socket; every response goes through the result channel.
struct Decoder<R> {
    reader: MessageReader<R>,
    dispatcher: Arc<NotifyDispatcher>,
    session_id: u64,
    inbox: Inbox,
    results: mpsc::Sender<ResultSync>,
    listen_channels: HashSet<String>,
    error: Arc<TerminalError>,
    shutdown: watch::Receiver<bool>,
}

impl<R: AsyncRead + Unpin> Decoder<R> {
    /// Protocol main loop. Returns the channel set for teardown once the
    /// result channel has been closed.
    async fn run(mut self) -> HashSet<String> {
        let mut unnamed_statement: Option<ParsedQuery> = None;

        loop {
            let message = tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                message = self.reader.next() => message,
            };
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    self.error.record(e.into());
                    break;
                }
            };

            let step = match message {
                FrontendMessage::Query(raw) => {
                    self.handle_simple_query(&raw, &mut unnamed_statement).await
                }
                FrontendMessage::Parse {
                    statement,
                    query,
                    param_types,
                } => {
                    self.handle_parse(&statement, &query, &param_types, &mut unnamed_statement)
                        .await
                }
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    param_values,
                } => {
                    self.handle_bind(&portal, &statement, param_formats.len(), param_values.len())
                        .await
                }
                FrontendMessage::Describe { kind, name } => {
                    self.handle_describe(kind, &name, &unnamed_statement).await
                }
                FrontendMessage::Execute { portal, .. } => {
                    self.handle_execute(&portal, &mut unnamed_statement).await
                }
                FrontendMessage::Sync => self.submit(QueryResult::Nop, true).await,
                FrontendMessage::Terminate => {
                    self.error.record(SessionError::GracefulTermination);
                    break;
                }
                other => self.fail(SessionError::Protocol(format!(
                    "unexpected {} message during session",
                    other.name()
                ))),
            };
            if step.is_err() {
                break;
            }
        }

        self.listen_channels
    }

    async fn handle_simple_query(
        &mut self,
        raw: &[u8],
        unnamed_statement: &mut Option<ParsedQuery>,
    ) -> Step {
        // a simple query clears the unnamed statement, matching the
        // upstream server
        *unnamed_statement = None;

        match parse_query(raw) {
            Err(e) => {
                self.submit(
                    QueryResult::Error {
                        sqlstate: "42601",
                        message: e.to_string(),
                    },
                    true,
                )
                .await
            }
            Ok(query) => {
                // Only a RowDescription is sent ahead of the result in the
                // simple-query flow. Somewhat magical, but it is what the
                // upstream server does.
                if query.has_row_description() {
                    self.submit(query.describe(), false).await?;
                }
                match self.process(&query) {
                    Ok(result) => self.submit(result, true).await,
                    Err(e) => self.fail(e),
                }
            }
        }
    }

    async fn handle_parse(
        &mut self,
        statement: &str,
        raw: &[u8],
        param_types: &[i32],
        unnamed_statement: &mut Option<ParsedQuery>,
    ) -> Step {
        if !statement.is_empty() {
            return self.fail(SessionError::Protocol(format!(
                "attempted to use statement name \"{}\"; only unnamed statements are supported",
                statement
            )));
        }
        if !param_types.is_empty() {
            return self.fail(SessionError::Protocol(format!(
                "attempted to prepare a statement with {} param types",
                param_types.len()
            )));
        }

        match parse_query(raw) {
            Err(e) => {
                self.submit(
                    QueryResult::Error {
                        sqlstate: "42601",
                        message: e.to_string(),
                    },
                    false,
                )
                .await?;
                self.discard_until_sync().await?;
                self.submit(QueryResult::Nop, true).await
            }
            Ok(query) => {
                *unnamed_statement = Some(query);
                self.submit(QueryResult::ParseComplete, false).await
            }
        }
    }

    async fn handle_bind(
        &mut self,
        portal: &str,
        statement: &str,
        num_param_formats: usize,
        num_params: usize,
    ) -> Step {
        if !portal.is_empty() {
            return self.fail(SessionError::Protocol(format!(
                "attempted to bind to a named portal \"{}\"; only the unnamed portal is supported",
                portal
            )));
        }
        if !statement.is_empty() {
            return self.fail(SessionError::Protocol(format!(
                "attempted to bind statement \"{}\", even though it has not been parsed yet",
                statement
            )));
        }
        if num_param_formats != 0 {
            return self.fail(SessionError::Protocol(format!(
                "the number of parameter formats ({}) does not match the number of parameters in the query (0)",
                num_param_formats
            )));
        }
        if num_params != 0 {
            return self.fail(SessionError::Protocol(format!(
                "the number of parameters provided by the client ({}) does not match the number of parameters in the query (0)",
                num_params
            )));
        }
        self.submit(QueryResult::BindComplete, false).await
    }

    async fn handle_describe(
        &mut self,
        kind: u8,
        name: &str,
        unnamed_statement: &Option<ParsedQuery>,
    ) -> Step {
        if kind != b'S' && kind != b'P' {
            return self.fail(SessionError::Protocol(format!(
                "invalid describe type '{}'",
                kind as char
            )));
        }
        if !name.is_empty() {
            return self.fail(SessionError::Protocol(format!(
                "tried to use statement/portal name \"{}\"; only unnamed statements and portals are supported",
                name
            )));
        }
        match unnamed_statement {
            None => self.fail(SessionError::Protocol(
                "attempted to describe the unnamed prepared statement when one does not exist"
                    .to_string(),
            )),
            Some(query) => self.submit(query.describe(), false).await,
        }
    }

    async fn handle_execute(
        &mut self,
        portal: &str,
        unnamed_statement: &mut Option<ParsedQuery>,
    ) -> Step {
        if !portal.is_empty() {
            return self.fail(SessionError::Protocol(format!(
                "attempted to use statement name \"{}\"; only unnamed statements are supported",
                portal
            )));
        }
        // Taking the statement disallows reuse; not exactly following the
        // protocol to the letter, but apps reusing the unnamed statement
        // should not exist, either.
        let query = match unnamed_statement.take() {
            None => {
                return self.fail(SessionError::Protocol(
                    "attempted to execute the unnamed prepared statement when one does not exist"
                        .to_string(),
                ))
            }
            Some(query) => query,
        };
        match self.process(&query) {
            Ok(result) => self.submit(result, false).await,
            Err(e) => self.fail(e),
        }
    }

    fn process(&mut self, query: &ParsedQuery) -> Result<QueryResult, SessionError> {
        match query {
            ParsedQuery::Empty => Ok(QueryResult::EmptyQuery),
            ParsedQuery::TrivialSelect => Ok(QueryResult::TrivialSelectRows),
            ParsedQuery::NopSet => Ok(QueryResult::CommandComplete("SET")),
            ParsedQuery::Listen(channel) => {
                self.listen(channel)?;
                Ok(QueryResult::CommandComplete("LISTEN"))
            }
            ParsedQuery::Unlisten(channel) => {
                self.unlisten(channel)?;
                Ok(QueryResult::CommandComplete("UNLISTEN"))
            }
            ParsedQuery::UnlistenAll => {
                self.unlisten_all()?;
                Ok(QueryResult::CommandComplete("UNLISTEN"))
            }
        }
    }

    fn listen(&mut self, channel: &str) -> Result<(), SessionError> {
        self.listen_channels.insert(channel.to_string());
        match self
            .dispatcher
            .listen(channel, self.session_id, &self.inbox)
        {
            Ok(()) | Err(DispatchError::AlreadySubscribed) => {
                herald_observability::record_listen_executed();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn unlisten(&mut self, channel: &str) -> Result<(), SessionError> {
        self.listen_channels.remove(channel);
        match self.dispatcher.unlisten(channel, self.session_id) {
            Ok(()) | Err(DispatchError::NotSubscribed) => {
                herald_observability::record_unlisten_executed();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn unlisten_all(&mut self) -> Result<(), SessionError> {
        // best effort: remember the first error, still attempt the rest
        let mut first_error = None;
        let channels: Vec<String> = self.listen_channels.drain().collect();
        for channel in &channels {
            match self.dispatcher.unlisten(channel, self.session_id) {
                Ok(()) | Err(DispatchError::NotSubscribed) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        herald_observability::record_unlisten_executed();
        match first_error {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }

    async fn discard_until_sync(&mut self) -> Step {
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.wait_for(|stop| *stop) => return Err(Stop),
            outcome = self.reader.discard_until_sync() => outcome,
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e.into()),
        }
    }

    async fn submit(&mut self, result: QueryResult, sync_after: bool) -> Step {
        if self
            .results
            .send(ResultSync { result, sync_after })
            .await
            .is_err()
        {
            // writer is gone; teardown is already under way
            return Err(Stop);
        }
        Ok(())
    }

    fn fail(&self, err: SessionError) -> Step {
        self.error.record(err);
        Err(Stop)
    }
}
