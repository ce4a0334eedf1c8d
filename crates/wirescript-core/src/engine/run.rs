//! Script runs: prepare, start, abort and collect outcomes.
//!
//! Preparing a run binds one acceptor per accept location, builds the
//! barrier map and the variable table, compiles every operation into a
//! [`Handler`] and spawns one task per stream. Each handler waits on its
//! pipeline future: the run's start gate for the first handler of a stream,
//! the previous handler's future for the rest. The first failure fails that
//! handler, cancels the rest of the stream and abandons every barrier the
//! stream would still have notified. Faults (panics and internal defects)
//! additionally fail the run's fault future, once.

use std::{
    any::Any,
    collections::BTreeMap,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use bytes::Bytes;
use futures::{FutureExt, future::join_all};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::{
    barrier::{Barrier, BarrierMap},
    channel::{Acceptor, BoxedIo, Channel, ChannelProvider},
    future::CompletionFuture,
    handler::Handler,
    matcher::{Variables, render, try_match},
};
use crate::{
    ast::{
        AssociationId, Location, Operation, OperationKind, Region, Role, Script, Stream,
        StreamOption, render_bytes, render_explicit,
    },
    error::{ConnectionError, ProgressError, ScriptError},
};

type Inbound = oneshot::Receiver<Result<BoxedIo, ConnectionError>>;
type Advisory = (String, Bytes);

/// Out-of-band link between the two streams of an association.
struct AdvisoryLink {
    tx: mpsc::UnboundedSender<Advisory>,
    rx: mpsc::UnboundedReceiver<Advisory>,
}

/// Result of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Stream label (`accept tcp://... (line:col)`)
    pub label: String,
    /// Stream declaration
    pub region: Region,
    /// Handlers that succeeded before the stream ended
    pub completed: usize,
    /// Success, or the failure that ended the stream
    pub result: Result<(), ScriptError>,
    /// Completed explicit operations rendered as script text
    pub observed: String,
}

/// Result of a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Per-stream results, in document order
    pub streams: Vec<StreamOutcome>,
    /// User-visible barriers that were notified
    pub notified: Vec<String>,
    /// User-visible barriers that were never notified
    pub awaiting: Vec<String>,
}

impl RunOutcome {
    /// True if every stream succeeded.
    pub fn is_success(&self) -> bool {
        self.streams.iter().all(|s| s.result.is_ok())
    }

    /// The failure that caused the others: the first failure that is not a
    /// cancellation, abort or abandonment, else the first failure.
    pub fn root_cause(&self) -> Option<&ScriptError> {
        let failures = || self.streams.iter().filter_map(|s| s.result.as_ref().err());
        failures().find(|err| !err.is_secondary()).or_else(|| failures().next())
    }

    /// Observed script of every stream, separated by blank lines.
    pub fn observed_script(&self) -> String {
        self.streams.iter().map(|s| s.observed.as_str()).collect::<Vec<_>>().join("\n")
    }
}

/// Cloneable control surface of a prepared run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    gate: CompletionFuture,
    abort: CompletionFuture,
    barriers: Arc<BarrierMap>,
    completion: CompletionFuture,
    fault: CompletionFuture,
}

impl RunHandle {
    /// Release the start gate. Returns `false` if already started or aborted.
    pub fn start(&self) -> bool {
        let started = self.gate.succeed();
        if started {
            info!("run started");
        }
        started
    }

    /// Cancel every stream that has not finished.
    pub fn abort(&self) {
        if self.abort.succeed() {
            info!("run aborted");
            self.gate.fail(ScriptError::Aborted);
        }
    }

    /// True once [`Self::start`] released the gate.
    pub fn is_started(&self) -> bool {
        self.gate.outcome() == Some(Ok(()))
    }

    /// User-visible barrier by name.
    pub fn barrier(&self, name: &str) -> Option<Arc<Barrier>> {
        self.barriers.user_visible(name).cloned()
    }

    /// Notify a user-visible barrier. Returns `false` if no such barrier
    /// exists or it already left the pending state.
    pub fn notify(&self, name: &str) -> bool {
        self.barriers.user_visible(name).is_some_and(|barrier| barrier.notify())
    }

    /// Names of the user-visible barriers, sorted.
    pub fn user_barriers(&self) -> Vec<String> {
        self.barriers.user_barriers().map(|b| b.name().to_string()).collect()
    }

    /// Conjunction of every stream's completion.
    pub fn completion(&self) -> &CompletionFuture {
        &self.completion
    }

    /// Fails with the first fault raised by any stream. Stays pending for a
    /// run without faults.
    pub fn faults(&self) -> &CompletionFuture {
        &self.fault
    }
}

/// A prepared script and its stream tasks.
pub struct ScriptRun {
    handle: RunHandle,
    tasks: Vec<JoinHandle<StreamOutcome>>,
    labels: Vec<(String, Region)>,
    dispatchers: Vec<JoinHandle<()>>,
}

impl ScriptRun {
    /// Prepare a resolved script.
    ///
    /// Acceptors are bound before this returns, so peers may connect before
    /// the run starts. Nothing else happens until [`RunHandle::start`].
    ///
    /// # Errors
    ///
    /// `ScriptError::Connection` if an acceptor cannot be bound.
    pub async fn prepare(
        script: Script,
        provider: Arc<dyn ChannelProvider>,
    ) -> Result<Self, ScriptError> {
        let barriers = Arc::new(BarrierMap::for_script(&script));
        let vars = Variables::from_properties(&script.properties);
        let gate = CompletionFuture::new();
        let abort = CompletionFuture::new();
        let fault = CompletionFuture::new();
        let count = script.streams.len();

        let mut inbound: Vec<Option<Inbound>> = (0..count).map(|_| None).collect();
        let mut dispatchers = Vec::new();

        let mut accept_sites: BTreeMap<Location, Vec<usize>> = BTreeMap::new();
        for (idx, stream) in script.streams.iter().enumerate() {
            if stream.role == Role::Accept {
                accept_sites.entry(stream.location.effective()).or_default().push(idx);
            }
        }

        for (location, indices) in accept_sites {
            let Some(&first) = indices.first() else {
                continue;
            };
            let declared = &script.streams[first];
            let acceptor = match provider.bind(&declared.location, &declared.options).await {
                Ok(acceptor) => acceptor,
                Err(source) => {
                    warn!(%location, %source, "bind failed");
                    for dispatcher in &dispatchers {
                        JoinHandle::abort(dispatcher);
                    }
                    return Err(ScriptError::connection(declared.region, source));
                },
            };
            debug!(%location, streams = indices.len(), "acceptor bound");

            let mut targets = Vec::with_capacity(indices.len());
            for idx in indices {
                let (tx, rx) = oneshot::channel();
                targets.push(tx);
                inbound[idx] = Some(rx);
            }
            dispatchers.push(tokio::spawn(dispatch(acceptor, targets, location)));
        }

        let mut links = advisory_links(&script);

        let handlers: Vec<Vec<Handler>> =
            script.streams.iter().map(|stream| Handler::compile(stream, &gate)).collect();
        let stream_futures: Vec<CompletionFuture> = handlers
            .iter()
            .map(|hs| CompletionFuture::all(hs.iter().map(|h| &h.future)))
            .collect();
        let completion = CompletionFuture::all(&stream_futures);

        let mut tasks = Vec::with_capacity(count);
        let mut labels = Vec::with_capacity(count);
        for (idx, handlers) in handlers.into_iter().enumerate() {
            let stream = script.streams[idx].clone();
            labels.push((stream.label(), stream.region));
            let runner = StreamRunner {
                pending_options: Vec::new(),
                stream,
                handlers,
                channel: None,
                inbound: inbound[idx].take(),
                provider: Arc::clone(&provider),
                barriers: Arc::clone(&barriers),
                vars: vars.clone(),
                advisory: links[idx].take(),
                abort: abort.clone(),
                fault: fault.clone(),
            };
            tasks.push(tokio::spawn(runner.run()));
        }

        info!(streams = count, barriers = barriers.user_barriers().count(), "run prepared");

        Ok(Self {
            handle: RunHandle { gate, abort, barriers, completion, fault },
            tasks,
            labels,
            dispatchers,
        })
    }

    /// Cloneable control surface.
    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    /// See [`RunHandle::start`].
    pub fn start(&self) -> bool {
        self.handle.start()
    }

    /// See [`RunHandle::abort`].
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// See [`RunHandle::notify`].
    pub fn notify(&self, name: &str) -> bool {
        self.handle.notify(name)
    }

    /// See [`RunHandle::user_barriers`].
    pub fn user_barriers(&self) -> Vec<String> {
        self.handle.user_barriers()
    }

    /// Wait for every stream to end and collect the outcome.
    pub async fn finished(mut self) -> RunOutcome {
        let tasks = std::mem::take(&mut self.tasks);
        let labels = std::mem::take(&mut self.labels);
        let joined = join_all(tasks).await;

        let fault = &self.handle.fault;
        let streams: Vec<StreamOutcome> = joined
            .into_iter()
            .zip(labels)
            .map(|(joined, (label, region))| {
                joined.unwrap_or_else(|err| {
                    let cause = ScriptError::Fault(err.to_string());
                    fault.fail(cause.clone());
                    StreamOutcome {
                        observed: format!("# {label}: {err}\n"),
                        label,
                        region,
                        completed: 0,
                        result: Err(cause),
                    }
                })
            })
            .collect();

        let outcome = RunOutcome {
            streams,
            notified: self.handle.barriers.notified_names(),
            awaiting: self.handle.barriers.awaiting_names(),
        };
        info!(
            success = outcome.is_success(),
            notified = outcome.notified.len(),
            awaiting = outcome.awaiting.len(),
            "run finished"
        );
        outcome
    }
}

impl Drop for ScriptRun {
    fn drop(&mut self) {
        for dispatcher in &self.dispatchers {
            dispatcher.abort();
        }
        if !self.tasks.is_empty() {
            self.handle.abort();
        }
    }
}

/// Hand the `n`-th inbound channel at a location to the `n`-th accept
/// stream there.
async fn dispatch(
    mut acceptor: Box<dyn Acceptor>,
    targets: Vec<oneshot::Sender<Result<BoxedIo, ConnectionError>>>,
    location: Location,
) {
    for target in targets {
        let accepted = acceptor.accept().await;
        let failed = accepted.is_err();
        if let Err(err) = &accepted {
            warn!(%location, %err, "accept failed");
        } else {
            debug!(%location, "channel accepted");
        }
        let _ = target.send(accepted);
        if failed {
            break;
        }
    }
}

fn advisory_links(script: &Script) -> Vec<Option<AdvisoryLink>> {
    let mut members: BTreeMap<AssociationId, Vec<usize>> = BTreeMap::new();
    for (idx, stream) in script.streams.iter().enumerate() {
        if let Some(id) = stream.association {
            members.entry(id).or_default().push(idx);
        }
    }

    let mut links: Vec<Option<AdvisoryLink>> = (0..script.streams.len()).map(|_| None).collect();
    for pair in members.values() {
        let &[a, b] = pair.as_slice() else {
            continue;
        };
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        links[a] = Some(AdvisoryLink { tx: a_tx, rx: b_rx });
        links[b] = Some(AdvisoryLink { tx: b_tx, rx: a_rx });
    }
    links
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

struct StreamRunner {
    stream: Stream,
    handlers: Vec<Handler>,
    channel: Option<Channel>,
    inbound: Option<Inbound>,
    pending_options: Vec<StreamOption>,
    provider: Arc<dyn ChannelProvider>,
    barriers: Arc<BarrierMap>,
    vars: Variables,
    advisory: Option<AdvisoryLink>,
    abort: CompletionFuture,
    fault: CompletionFuture,
}

impl StreamRunner {
    async fn run(mut self) -> StreamOutcome {
        let label = self.stream.label();
        let abort = self.abort.clone();
        let mut completed = 0;
        let mut result = Ok(());

        for idx in 0..self.handlers.len() {
            let pipeline = self.handlers[idx].pipeline.clone();
            let ready = tokio::select! {
                biased;
                _ = abort.wait() => Err(ScriptError::Aborted),
                outcome = pipeline.wait() => outcome,
            };
            if let Err(cause) = ready {
                self.cancel_from(idx, &cause);
                result = Err(cause);
                break;
            }

            let op = self.handlers[idx].op.clone();
            debug!(stream = %label, handler = %self.handlers[idx].description, "handler started");

            let executed = tokio::select! {
                biased;
                _ = abort.wait() => Err(ScriptError::Aborted),
                executed = AssertUnwindSafe(self.execute(&op)).catch_unwind() => {
                    executed.unwrap_or_else(|panic| {
                        Err(ScriptError::Fault(panic_message(&*panic)))
                    })
                },
            };

            let handler = &self.handlers[idx];
            match executed {
                Ok(()) => {
                    debug!(stream = %label, handler = %handler.description, "handler succeeded");
                    handler.future.succeed();
                    completed += 1;
                },
                Err(cause) => {
                    warn!(
                        stream = %label,
                        handler = %handler.description,
                        %cause,
                        "handler failed"
                    );
                    if matches!(cause, ScriptError::Fault(_)) {
                        self.fault.fail(cause.clone());
                    }
                    handler.future.fail(cause.clone());
                    self.cancel_from(idx + 1, &cause);
                    result = Err(cause);
                    break;
                },
            }
        }

        if let (Err(_), Some(channel)) = (&result, self.channel.as_mut()) {
            if let Err(err) = channel.close().await {
                debug!(stream = %label, %err, "close after failure");
            }
        }
        if result.is_ok() {
            debug!(stream = %label, "stream complete");
        }

        let mut observed = render_explicit(&self.stream, completed);
        if let Err(cause) = &result {
            observed.push_str(&format!("# {label}: {cause}\n"));
        }

        StreamOutcome { label, region: self.stream.region, completed, result, observed }
    }

    fn cancel_from(&self, start: usize, cause: &ScriptError) {
        for handler in &self.handlers[start..] {
            handler.future.fail(ScriptError::Cancelled(handler.description.clone()));
            if let OperationKind::BarrierNotify(name) = &handler.op.kind {
                if let Some(barrier) = self.barriers.get(name) {
                    barrier.abandon(cause);
                }
            }
        }
    }

    fn channel(&mut self, region: Region) -> Result<&mut Channel, ScriptError> {
        self.channel.as_mut().ok_or_else(|| {
            ScriptError::Progress(ProgressError {
                region,
                expected: "connected channel".to_string(),
                observed: "no channel".to_string(),
            })
        })
    }

    async fn execute(&mut self, op: &Operation) -> Result<(), ScriptError> {
        let region = op.region;
        let conn = move |source: ConnectionError| ScriptError::connection(region, source);

        match &op.kind {
            OperationKind::Opened | OperationKind::Bound => Ok(()),
            OperationKind::Connected => self.connect(region).await,
            OperationKind::OptionConfig { name, value } => {
                if let Some(channel) = self.channel.as_mut() {
                    channel.set_option(name, value).map_err(conn)
                } else {
                    let option = StreamOption { name: name.clone(), value: value.clone() };
                    self.pending_options.push(option);
                    Ok(())
                }
            },
            OperationKind::BarrierAwait(name) => {
                let barrier = self
                    .barriers
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ScriptError::Fault(format!("unknown barrier `{name}`")))?;
                barrier.wait().await
            },
            OperationKind::BarrierNotify(name) => {
                if let Some(barrier) = self.barriers.get(name) {
                    barrier.notify();
                }
                Ok(())
            },
            OperationKind::ReadEvent(matchers) => {
                let vars = self.vars.clone();
                let channel = self.channel(region)?;
                loop {
                    let (inbound, eof) = (channel.inbound(), channel.is_eof());
                    if let Some(matched) = try_match(matchers, inbound, eof, &vars, region)? {
                        channel.consume(matched.consumed);
                        vars.bind_all(matched.captures);
                        return Ok(());
                    }
                    channel.fill().await.map_err(conn)?;
                }
            },
            OperationKind::WriteCommand(values) => {
                let bytes = render(values, &self.vars, region)?;
                self.channel(region)?.write(&bytes);
                Ok(())
            },
            OperationKind::Flush => self.channel(region)?.flush().await.map_err(conn),
            OperationKind::WriteClose => {
                self.channel(region)?.shutdown_output().await.map_err(conn)
            },
            OperationKind::Close => self.channel(region)?.close().await.map_err(conn),
            OperationKind::Closed | OperationKind::Disconnected => {
                let channel = self.channel(region)?;
                if channel.is_closed() {
                    return Ok(());
                }
                while !channel.is_eof() || !channel.inbound().is_empty() {
                    if !channel.inbound().is_empty() {
                        return Err(ScriptError::Progress(ProgressError {
                            region,
                            expected: "end of stream".to_string(),
                            observed: render_bytes(channel.inbound()),
                        }));
                    }
                    channel.fill().await.map_err(conn)?;
                }
                if let Err(err) = channel.close().await {
                    debug!(%err, "close after end of stream");
                }
                Ok(())
            },
            OperationKind::Advise { name, values } => {
                let payload = render(values, &self.vars, region)?;
                let link = self.advisory.as_ref().ok_or_else(|| no_peer(region, name))?;
                link.tx.send((name.clone(), payload)).map_err(|_| {
                    ScriptError::Progress(ProgressError {
                        region,
                        expected: format!("peer to receive advisory `{name}`"),
                        observed: "peer stream ended".to_string(),
                    })
                })
            },
            OperationKind::Advised { name, matchers } => {
                let link = self.advisory.as_mut().ok_or_else(|| no_peer(region, name))?;
                let Some((received, payload)) = link.rx.recv().await else {
                    return Err(ScriptError::Progress(ProgressError {
                        region,
                        expected: format!("advisory `{name}`"),
                        observed: "peer stream ended".to_string(),
                    }));
                };
                if &received != name {
                    return Err(ScriptError::Progress(ProgressError {
                        region,
                        expected: format!("advisory `{name}`"),
                        observed: format!("advisory `{received}`"),
                    }));
                }
                match try_match(matchers, &payload, true, &self.vars, region)? {
                    Some(matched) if matched.consumed == payload.len() => {
                        self.vars.bind_all(matched.captures);
                        Ok(())
                    },
                    _ => Err(ScriptError::Progress(ProgressError {
                        region,
                        expected: format!("advisory `{name}` payload"),
                        observed: render_bytes(&payload),
                    })),
                }
            },
            OperationKind::ReadConfig(_) | OperationKind::WriteConfig(_) => {
                Err(ScriptError::Fault(format!("unresolved `{}` reached the engine", op.kind)))
            },
        }
    }

    async fn connect(&mut self, region: Region) -> Result<(), ScriptError> {
        let conn = move |source: ConnectionError| ScriptError::connection(region, source);
        let pending = std::mem::take(&mut self.pending_options);

        let io = match self.stream.role {
            Role::Connect => {
                let mut options = self.stream.options.clone();
                options.extend(pending.iter().cloned());
                self.provider.connect(&self.stream.location, &options).await.map_err(conn)?
            },
            Role::Accept => {
                let location = self.stream.location.to_string();
                let closed = |location| conn(ConnectionError::AcceptorClosed(location));
                let inbound = self.inbound.take().ok_or_else(|| closed(location.clone()))?;
                inbound.await.map_err(|_| closed(location))?.map_err(conn)?
            },
        };

        let mut channel = Channel::new(io);
        if self.stream.role == Role::Accept {
            for option in &pending {
                channel.set_option(&option.name, &option.value).map_err(conn)?;
            }
        }
        debug!(stream = %self.stream.label(), "channel connected");
        self.channel = Some(channel);
        Ok(())
    }
}

fn no_peer(region: Region, name: &str) -> ScriptError {
    ScriptError::Progress(ProgressError {
        region,
        expected: format!("associated peer for advisory `{name}`"),
        observed: "unassociated stream".to_string(),
    })
}
