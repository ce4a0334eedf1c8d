//! Controller session runtime.
//!
//! Executes [`ControlSession`] actions against real I/O: control messages
//! are decoded from the connection, PREPARE loads and prepares a script,
//! and engine events (barrier notifications, run completion) are fed back
//! into the session through an internal channel.
//!
//! Each prepared run gets a watcher task. It waits for the run to end while
//! holding the lifecycle's finished latch; a worker fault captured by the
//! lifecycle interrupts that wait once and is reported before FINISHED.

use std::{collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
};
use tracing::{debug, info, warn};
use wirescript_core::{
    ControlAction, ControlEvent, ControlSession, Lifecycle, RunHandle, RunOutcome, ScriptError,
    ScriptRun,
    control::{FaultOrigin, PROTOCOL_ERROR},
    engine::ChannelProvider,
    prepare_script,
};
use wirescript_proto::ControlMessage;

use crate::{RobotConfig, ServerError, scripts::load_script};

struct SessionRuntime<W> {
    writer: W,
    session: ControlSession,
    provider: Arc<dyn ChannelProvider>,
    config: Arc<RobotConfig>,
    events: mpsc::UnboundedSender<ControlEvent>,
    run: Option<RunHandle>,
    running: bool,
    peer_closed: bool,
}

/// Serve one controller connection until it closes and any run it
/// prepared has finished.
///
/// # Errors
///
/// `ServerError::Protocol` if the controller sends bytes that do not frame
/// as a control message, `ServerError::Transport` on I/O failure.
pub async fn drive_session<S>(
    io: S,
    provider: Arc<dyn ChannelProvider>,
    config: Arc<RobotConfig>,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut reader, writer) = tokio::io::split(io);
    let (events, mut inbox) = mpsc::unbounded_channel();
    let mut runtime = SessionRuntime {
        writer,
        session: ControlSession::new(),
        provider,
        config,
        events,
        run: None,
        running: false,
        peer_closed: false,
    };
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        loop {
            match ControlMessage::decode(&mut buf) {
                Ok(Some(message)) => {
                    runtime.dispatch(ControlEvent::MessageReceived(message)).await?;
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "undecodable control message");
                    let report = ControlMessage::error(PROTOCOL_ERROR, err.to_string());
                    runtime.send(&report).await?;
                    runtime.abort();
                    return Err(ServerError::Protocol(err));
                },
            }
        }

        if runtime.peer_closed && !runtime.running {
            debug!("control session closed");
            return Ok(());
        }

        tokio::select! {
            biased;
            Some(event) = inbox.recv() => runtime.dispatch(event).await?,
            read = reader.read_buf(&mut buf), if !runtime.peer_closed => {
                if read? == 0 {
                    debug!("controller closed the connection");
                    runtime.peer_closed = true;
                    runtime.abort();
                }
            },
        }
    }
}

impl<W> SessionRuntime<W>
where
    W: AsyncWrite + Unpin,
{
    async fn dispatch(&mut self, event: ControlEvent) -> Result<(), ServerError> {
        if matches!(event, ControlEvent::Finished(_)) {
            self.running = false;
        }
        let mut queue: VecDeque<ControlAction> = self.session.handle(event).into();

        while let Some(action) = queue.pop_front() {
            match action {
                ControlAction::Send(message) => self.send(&message).await?,
                ControlAction::Prepare { script, names } => {
                    let (event, run) = self.prepare(script, &names).await;
                    queue.extend(self.session.handle(event));
                    if let Some(run) = run {
                        self.watch(run);
                    }
                },
                ControlAction::Start => {
                    if let Some(run) = &self.run {
                        run.start();
                    }
                },
                ControlAction::Abort => self.abort(),
                ControlAction::NotifyBarrier(name) => {
                    if let Some(run) = &self.run {
                        run.notify(&name);
                    }
                },
            }
        }
        Ok(())
    }

    async fn prepare(
        &mut self,
        script: Option<Bytes>,
        names: &[String],
    ) -> (ControlEvent, Option<ScriptRun>) {
        let root = self.config.script_root.as_deref();
        let text = match load_script(root, script.as_ref(), names).await {
            Ok(text) => text,
            Err(err) => return (ControlEvent::PrepareFailed(err), None),
        };
        let run = match prepare_script(&text, Arc::clone(&self.provider)).await {
            Ok(run) => run,
            Err(err) => return (ControlEvent::PrepareFailed(err), None),
        };

        let handle = run.handle();
        let barriers = handle.user_barriers();
        for name in &barriers {
            if let Some(barrier) = handle.barrier(name) {
                let events = self.events.clone();
                let name = name.clone();
                barrier.add_listener(move |outcome| {
                    if outcome.is_ok() {
                        let _ = events.send(ControlEvent::BarrierNotified(name));
                    }
                });
            }
        }

        info!(barriers = barriers.len(), "script prepared");
        self.run = Some(handle);
        self.running = true;
        (ControlEvent::Prepared { barriers, script: Bytes::from(text) }, Some(run))
    }

    /// Spawn the watcher of a prepared run. Called once the session has
    /// taken the Prepared event, so the watcher waits on this run's latches.
    fn watch(&self, run: ScriptRun) {
        let lifecycle = self.session.lifecycle().clone();
        lifecycle.capture_worker_faults(run.handle().faults());
        tokio::spawn(watch_run(run, lifecycle, self.events.clone()));
    }

    fn abort(&self) {
        if let Some(run) = &self.run {
            run.abort();
        }
    }

    async fn send(&mut self, message: &ControlMessage) -> Result<(), ServerError> {
        if self.peer_closed {
            debug!(kind = %message.kind, "controller gone, dropping message");
            return Ok(());
        }
        let bytes = message.to_bytes()?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        debug!(kind = %message.kind, "control message sent");
        Ok(())
    }
}

async fn watch_run(
    run: ScriptRun,
    lifecycle: Lifecycle,
    events: mpsc::UnboundedSender<ControlEvent>,
) {
    // A stream fault fails the latch before the run task returns, so polling
    // the latch first never misses it.
    let mut finished = tokio::spawn(run.finished());
    let joined = tokio::select! {
        biased;
        latch = lifecycle.finished() => {
            if let Err(cause) = latch {
                warn!(%cause, "run interrupted by a worker fault");
                let _ = events.send(ControlEvent::Fault(cause));
            }
            finished.await
        },
        joined = &mut finished => joined,
    };

    let outcome = joined.unwrap_or_else(|err| {
        let cause = ScriptError::Fault(err.to_string());
        if lifecycle.capture_fault(FaultOrigin::Worker, cause.clone()) {
            let _ = events.send(ControlEvent::Fault(cause));
        }
        RunOutcome::default()
    });
    let _ = events.send(ControlEvent::Finished(outcome));
}
