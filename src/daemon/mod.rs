//! Daemons: receive work over a bus, resolve its files, run a worker.
//!
//! A [`DaemonConnection`] is the sending end. It translates every file in a
//! packet into tokens and puts the serialized packet on the bus. The
//! [`Daemon`] on the other end decodes it, resolves the tokens for its own
//! filesystem, opens the request's parent log and hands everything to its
//! [`Worker`]. Whatever happens, the caller's reporter sees one outcome.

pub mod command;

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tracing::{Instrument, Span, debug, error, info, warn};

pub use command::CommandWorker;

use crate::error::{Error, Result};
use crate::files::{FileCarrier, FileTokenFactory};
use crate::log::{LoggerFactory, ParentLog};
use crate::model::Work;
use crate::progress::{ProgressGate, ProgressInfo, ProgressReporter, host_information};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

/// What a worker gets besides the work itself.
#[derive(Clone)]
pub struct WorkContext {
    pub reporter: Arc<dyn ProgressReporter>,
    pub log: Arc<dyn ParentLog>,
}

/// Does the actual work.
///
/// Implementations report exactly one terminal event through
/// `ctx.reporter`, possibly after returning.
#[async_trait]
pub trait Worker<W>: Send + Sync {
    async fn process_request(&self, work: W, ctx: WorkContext);
}

/// A serialized request on its way to a daemon.
pub struct Envelope {
    pub work_json: String,
    pub reporter: Arc<dyn ProgressReporter>,
}

/// Sending end of a daemon's bus.
pub struct DaemonConnection<W> {
    tx: mpsc::UnboundedSender<Envelope>,
    files: FileTokenFactory,
    _work: PhantomData<fn(W)>,
}

impl<W> Clone for DaemonConnection<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            files: self.files.clone(),
            _work: PhantomData,
        }
    }
}

impl<W: Work> DaemonConnection<W> {
    /// Translate, serialize and enqueue. Fails without sending anything if a
    /// file cannot be translated.
    pub fn send_work(&self, mut work: W, reporter: Arc<dyn ProgressReporter>) -> Result<()> {
        let translated = work.translate_on_sender(&self.files)?;
        metrics::files_translated().add(translated as u64, &[KeyValue::new("direction", "sender")]);
        let work_json = serde_json::to_string(&work)?;
        debug!(task_id = work.task_id(), translated, "sending work");
        self.tx
            .send(Envelope {
                work_json,
                reporter,
            })
            .map_err(|_| Error::Dispatch("daemon is no longer listening".to_string()))
    }
}

#[async_trait]
impl<W: Work> Worker<W> for DaemonConnection<W> {
    async fn process_request(&self, work: W, ctx: WorkContext) {
        if let Err(e) = self.send_work(work, Arc::clone(&ctx.reporter)) {
            ctx.reporter.report_failure(Arc::new(e));
        }
    }
}

/// Forwards to the caller and records the outcome on the request span.
struct Instrumented {
    inner: Arc<dyn ProgressReporter>,
    work_type: String,
    span: Span,
}

impl Instrumented {
    fn finish(&self, result: &'static str) {
        record_state_transition(&self.span, "running", result);
        metrics::work_finished().add(
            1,
            &[
                KeyValue::new("work_type", self.work_type.clone()),
                KeyValue::new("result", result),
            ],
        );
    }
}

impl ProgressReporter for Instrumented {
    fn report_start(&self, host: &str) {
        record_state_transition(&self.span, "received", "running");
        self.inner.report_start(host);
    }

    fn report_progress(&self, info: ProgressInfo) {
        self.inner.report_progress(info);
    }

    fn report_success(&self) {
        self.finish("success");
        self.inner.report_success();
    }

    fn report_failure(&self, error: Arc<Error>) {
        self.span.in_scope(|| warn!(%error, "request failed"));
        self.finish("failure");
        self.inner.report_failure(error);
    }
}

/// Receiving end of the bus: runs requests with bounded concurrency.
pub struct Daemon<W> {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>>,
    worker: Arc<dyn Worker<W>>,
    files: FileTokenFactory,
    loggers: LoggerFactory,
    shutdown: Arc<Notify>,
    active: Arc<AtomicUsize>,
    limit: Arc<Semaphore>,
}

impl<W> Clone for Daemon<W> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            worker: Arc::clone(&self.worker),
            files: self.files.clone(),
            loggers: self.loggers.clone(),
            shutdown: Arc::clone(&self.shutdown),
            active: Arc::clone(&self.active),
            limit: Arc::clone(&self.limit),
        }
    }
}

impl<W: Work> Daemon<W> {
    pub fn new(
        worker: Arc<dyn Worker<W>>,
        files: FileTokenFactory,
        loggers: LoggerFactory,
        max_concurrent: usize,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(Some(rx))),
            worker,
            files,
            loggers,
            shutdown: Arc::new(Notify::new()),
            active: Arc::new(AtomicUsize::new(0)),
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// A connection whose files are translated by `sender_files`, the
    /// factory of the daemon doing the sending.
    pub fn connect(&self, sender_files: FileTokenFactory) -> DaemonConnection<W> {
        DaemonConnection {
            tx: self.tx.clone(),
            files: sender_files,
            _work: PhantomData,
        }
    }

    pub fn daemon_id(&self) -> &str {
        &self.files.daemon().daemon_id
    }

    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Signal the daemon to stop taking requests. Running ones finish.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Dispatch("daemon is already running".to_string()))?;

        info!(daemon_id = self.daemon_id(), "daemon started, waiting for work");

        loop {
            let envelope = tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(daemon_id = self.daemon_id(), "daemon shutting down");
                    *self.rx.lock().await = Some(rx);
                    return Ok(());
                }
                envelope = rx.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => return Ok(()),
                },
            };

            let permit = Arc::clone(&self.limit)
                .acquire_owned()
                .await
                .map_err(|_| Error::Dispatch("daemon capacity closed".to_string()))?;
            let this = self.clone();
            tokio::spawn(async move {
                this.active.fetch_add(1, Ordering::Relaxed);
                this.handle(envelope).await;
                this.active.fetch_sub(1, Ordering::Relaxed);
                drop(permit);
            });
        }
    }

    async fn handle(&self, envelope: Envelope) {
        let mut work: W = match serde_json::from_str(&envelope.work_json) {
            Ok(work) => work,
            Err(e) => {
                error!(error = %e, "cannot decode request");
                ProgressGate::new(envelope.reporter).report_failure(Arc::new(e.into()));
                return;
            }
        };

        let span = start_work_span(work.work_type(), work.task_id());
        let reporter: Arc<dyn ProgressReporter> = Arc::new(ProgressGate::new(Instrumented {
            inner: envelope.reporter,
            work_type: work.work_type().to_string(),
            span: span.clone(),
        }));
        reporter.report_start(&host_information());

        match work.translate_on_receiver(&self.files, None) {
            Ok(resolved) => {
                metrics::files_translated()
                    .add(resolved as u64, &[KeyValue::new("direction", "receiver")]);
            }
            Err(e) => {
                reporter.report_failure(Arc::new(e));
                return;
            }
        }

        metrics::work_dispatched().add(1, &[KeyValue::new("work_type", work.work_type().to_string())]);
        let ctx = WorkContext {
            reporter: Arc::clone(&reporter),
            log: Arc::new(self.loggers.request_log(Arc::clone(&reporter))),
        };

        let worker = Arc::clone(&self.worker);
        let task = tokio::spawn(
            async move { worker.process_request(work, ctx).await }.instrument(span.clone()),
        );
        if let Err(e) = task.await {
            let message = if e.is_panic() {
                "worker panicked".to_string()
            } else {
                format!("worker was cancelled: {e}")
            };
            span.in_scope(|| error!(%message, "worker crashed"));
            reporter.report_failure(Arc::new(Error::Worker(message)));
        }
    }
}
