//! Stdio transport: a child process speaking newline-delimited JSON-RPC.
//!
//! Two pumps run for the life of the transport:
//! - the output pump reads the server's stdout, frames it, and forwards every
//!   decoded unit (message or in-band error) to the inbound channel;
//! - the input pump drains the outbound channel into the server's stdin.
//!
//! Both share one cancellation scope so neither can be left blocked on I/O
//! after the other has stopped.

use crate::config::{StdioServerConfig, DEFAULT_SHUTDOWN_GRACE};
use crate::error::{McpError, McpResult, TransportError};
use crate::framing::{Frame, Framer};
use crate::protocol::JsonRpcMessage;
use crate::shutdown::{PlatformTerminator, ProcessTreeTerminator, ShutdownCoordinator, ShutdownOutcome};
use crate::transport::{channel_pair, SessionChannels, Transport};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the server's stderr goes.
#[derive(Default)]
pub enum StderrSink {
    /// Share the client's stderr.
    #[default]
    Inherit,
    /// Discard it.
    Null,
    /// Forward each line to `tracing` at info level.
    Log,
    /// Copy it verbatim into a writer.
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
}

impl std::fmt::Debug for StderrSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inherit => f.write_str("Inherit"),
            Self::Null => f.write_str("Null"),
            Self::Log => f.write_str("Log"),
            Self::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// Maps a logical command name to something the OS can execute.
pub trait ExecutableResolver: Send + Sync {
    fn resolve(&self, command: &str) -> String;
}

/// Executable lookup for the host platform.
///
/// Windows needs `PATHEXT` resolution for commands like `npx` that are really
/// `npx.cmd`; everywhere else the command is used as given.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformResolver;

impl ExecutableResolver for PlatformResolver {
    #[cfg(windows)]
    fn resolve(&self, command: &str) -> String {
        match which::which(command) {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(_) => command.to_string(),
        }
    }

    #[cfg(not(windows))]
    fn resolve(&self, command: &str) -> String {
        command.to_string()
    }
}

/// Platform collaborators and timing for a stdio transport.
#[derive(Clone)]
pub struct ProcessControl {
    pub resolver: Arc<dyn ExecutableResolver>,
    pub terminator: Arc<dyn ProcessTreeTerminator>,
    /// Grace period between closing stdin and terminating the process tree.
    pub shutdown_grace: Duration,
}

impl Default for ProcessControl {
    fn default() -> Self {
        Self {
            resolver: Arc::new(PlatformResolver),
            terminator: Arc::new(PlatformTerminator),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ProcessControl {
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn ProcessTreeTerminator>) -> Self {
        self.terminator = terminator;
        self
    }
}

/// Transport over a child process's stdin/stdout.
pub struct StdioTransport {
    child: Option<Child>,
    pid: Option<u32>,
    scope: CancellationToken,
    input_token: CancellationToken,
    input_pump: Option<JoinHandle<()>>,
    output_pump: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    control: ProcessControl,
    outcome: Option<ShutdownOutcome>,
}

impl StdioTransport {
    /// Spawn the server with default platform behaviour.
    pub async fn open(
        config: &StdioServerConfig,
        stderr: StderrSink,
    ) -> McpResult<(Self, SessionChannels)> {
        Self::open_with(config, stderr, ProcessControl::default()).await
    }

    /// Spawn the server and start both pumps.
    pub async fn open_with(
        config: &StdioServerConfig,
        stderr: StderrSink,
        control: ProcessControl,
    ) -> McpResult<(Self, SessionChannels)> {
        let program = control.resolver.resolve(&config.command);

        let mut cmd = Command::new(&program);
        cmd.args(&config.args)
            .env_clear()
            .envs(config.effective_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match stderr {
                StderrSink::Inherit => Stdio::inherit(),
                StderrSink::Null => Stdio::null(),
                StderrSink::Log | StderrSink::Writer(_) => Stdio::piped(),
            });

        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        // Own process group, so signals aimed at the client stay with the client
        // and the whole server tree can be signalled at once.
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        debug!(command = %program, args = ?config.args, "Starting stdio server");

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::spawn(format!("{}: {e}", config.command)))?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.start_kill();
                return Err(McpError::spawn("Failed to capture server stdio"));
            }
        };

        let pid = child.id();
        info!(command = %config.command, pid, "Stdio server started");

        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(forward_stderr(pipe, stderr, config.command.clone())));

        let (session, pumps) = channel_pair();
        let scope = CancellationToken::new();
        let input_token = scope.child_token();

        let output_pump = tokio::spawn(output_pump(
            stdout,
            Framer::for_server(config),
            pumps.inbound,
            scope.clone(),
        ));
        let input_pump = tokio::spawn(input_pump(
            stdin,
            Framer::for_server(config),
            pumps.outbound,
            input_token.clone(),
            scope.clone(),
        ));

        let transport = Self {
            child: Some(child),
            pid,
            scope,
            input_token,
            input_pump: Some(input_pump),
            output_pump: Some(output_pump),
            stderr_task,
            control,
            outcome: None,
        };

        Ok((transport, session))
    }

    /// OS process id of the server, while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// How the server ended, once the transport is closed.
    pub fn shutdown_outcome(&self) -> Option<ShutdownOutcome> {
        self.outcome
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn close(&mut self) -> McpResult<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let input_token = self.input_token.clone();
        let input_pump = self.input_pump.take();
        let grace = self.control.shutdown_grace;
        let close_input = async move {
            // The pump stops taking new messages, flushes what is queued, then
            // drops stdin. A server that stops reading only gets the grace period.
            input_token.cancel();
            if let Some(mut handle) = input_pump {
                match tokio::time::timeout(grace, &mut handle).await {
                    Ok(joined) => joined.map_err(std::io::Error::other)?,
                    Err(_) => {
                        warn!("Server stopped reading input, dropping queued messages");
                        handle.abort();
                        let _ = handle.await;
                    }
                }
            }
            Ok::<(), std::io::Error>(())
        };

        let outcome = ShutdownCoordinator::new(
            self.control.shutdown_grace,
            self.control.terminator.as_ref(),
        )
        .run(&mut child, close_input)
        .await;

        // Terminated: release every pump and with them the channel endpoints.
        self.scope.cancel();
        if let Some(handle) = self.output_pump.take() {
            if let Err(e) = handle.await {
                debug!(error = %e, "Output pump ended abnormally");
            }
        }

        // A surviving descendant can hold stderr open; drain what we can.
        if let Some(mut handle) = self.stderr_task.take() {
            if tokio::time::timeout(self.control.shutdown_grace, &mut handle)
                .await
                .is_err()
            {
                debug!("Server stderr still open, abandoning it");
                handle.abort();
            }
        }

        info!(pid = self.pid, outcome = ?outcome, "Closed stdio server transport");
        self.pid = None;
        self.outcome = Some(outcome);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.child.is_some()
            && !self.scope.is_cancelled()
            && self
                .output_pump
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.scope.cancel();
        if let Some(ref mut child) = self.child {
            let _ = child.start_kill();
        }
    }
}

/// Server stdout -> inbound channel.
async fn output_pump(
    stdout: ChildStdout,
    framer: Framer,
    inbound: mpsc::Sender<Frame>,
    scope: CancellationToken,
) {
    let mut frames = FramedRead::new(stdout, framer);

    loop {
        let next = tokio::select! {
            _ = scope.cancelled() => break,
            next = frames.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(error = %e, "Server output stream failed");
                tokio::select! {
                    _ = scope.cancelled() => {}
                    _ = inbound.send(Err(TransportError::Stream(e.to_string()))) => {}
                }
                scope.cancel();
                break;
            }
            None => {
                debug!("Server closed its output");
                break;
            }
        };

        if let Err(ref e) = frame {
            debug!(error = %e, "Undecodable line from server");
        }

        tokio::select! {
            _ = scope.cancelled() => break,
            sent = inbound.send(frame) => {
                if sent.is_err() {
                    debug!("Inbound channel closed");
                    break;
                }
            }
        }
    }
}

/// Outbound channel -> server stdin. Dropping the writer closes stdin.
///
/// Cancelling `input_token` closes the outbound channel to new messages but
/// still writes the ones already queued. Cancelling `scope` stops at once.
async fn input_pump(
    stdin: ChildStdin,
    framer: Framer,
    mut outbound: mpsc::Receiver<JsonRpcMessage>,
    input_token: CancellationToken,
    scope: CancellationToken,
) {
    let mut sink = FramedWrite::new(stdin, framer);

    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => message,
                None => {
                    debug!("Outbound channel closed");
                    return;
                }
            },
            _ = input_token.cancelled() => break,
        };

        if !write_input(&mut sink, message, &scope).await {
            return;
        }
    }

    if scope.is_cancelled() {
        return;
    }

    outbound.close();
    let mut flushed = 0usize;
    while let Some(message) = outbound.recv().await {
        if !write_input(&mut sink, message, &scope).await {
            return;
        }
        flushed += 1;
    }
    debug!(flushed, "Flushed queued messages before closing server input");
}

/// Write one message; false once the pump should stop.
async fn write_input(
    sink: &mut FramedWrite<ChildStdin, Framer>,
    message: JsonRpcMessage,
    scope: &CancellationToken,
) -> bool {
    let sent = tokio::select! {
        _ = scope.cancelled() => return false,
        sent = sink.send(message) => sent,
    };

    match sent {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Failed to write to server input");
            scope.cancel();
            false
        }
    }
}

async fn forward_stderr(stderr: ChildStderr, sink: StderrSink, server: String) {
    match sink {
        StderrSink::Log => {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(server = %server, "{}", line);
            }
        }
        StderrSink::Writer(mut writer) => {
            let mut stderr = stderr;
            if let Err(e) = tokio::io::copy(&mut stderr, &mut writer).await {
                debug!(error = %e, "Stopped copying server stderr");
            }
            let _ = writer.flush().await;
        }
        StderrSink::Inherit | StderrSink::Null => {}
    }
}
