//! Progress reporting for running work.
//!
//! Every request gets a [`ProgressReporter`]. Workers announce that they
//! started, stream [`ProgressInfo`] while running, and finish with exactly one
//! terminal outcome. Reporting never fails from the worker's point of view.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Error;
use crate::log::LogId;

/// What a running worker can say about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressInfo {
    PercentDone {
        percent: f64,
    },
    /// A child log was created and its files can be tailed.
    NewLogFiles {
        parent_id: LogId,
        log_id: LogId,
        output_path: PathBuf,
        error_path: PathBuf,
    },
    /// The request was answered from the work cache.
    CachedResult {
        output_path: PathBuf,
    },
    Custom {
        kind: String,
        data: serde_json::Value,
    },
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Start { host: String },
    Progress(ProgressInfo),
    Success,
    Failure(Arc<Error>),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Success | ProgressEvent::Failure(_))
    }
}

pub trait ProgressReporter: Send + Sync {
    fn report_start(&self, host: &str);
    fn report_progress(&self, info: ProgressInfo);
    fn report_success(&self);
    fn report_failure(&self, error: Arc<Error>);

    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Start { host } => self.report_start(&host),
            ProgressEvent::Progress(info) => self.report_progress(info),
            ProgressEvent::Success => self.report_success(),
            ProgressEvent::Failure(error) => self.report_failure(error),
        }
    }
}

impl<R: ProgressReporter + ?Sized> ProgressReporter for Arc<R> {
    fn report_start(&self, host: &str) {
        (**self).report_start(host);
    }

    fn report_progress(&self, info: ProgressInfo) {
        (**self).report_progress(info);
    }

    fn report_success(&self) {
        (**self).report_success();
    }

    fn report_failure(&self, error: Arc<Error>) {
        (**self).report_failure(error);
    }
}

/// `user@host (pid n)`, as reported in `Start` events.
pub fn host_information() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string());
    format!("{user}@{host} (pid {})", std::process::id())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Started,
    Succeeded,
    Failed,
}

/// Enforces the reporting lifecycle on top of another reporter.
///
/// Progress before `Start` and anything after the terminal event is dropped.
/// A terminal event may arrive without a `Start`, e.g. when the request could
/// not be decoded. Dropping the gate before any terminal event reports a
/// failure, so a crashed or forgetful worker still produces an outcome.
pub struct ProgressGate<R: ProgressReporter> {
    inner: R,
    phase: Mutex<Phase>,
}

impl<R: ProgressReporter> ProgressGate<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            phase: Mutex::new(Phase::Pending),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.outcome().is_some()
    }

    /// `Some(true)` after success, `Some(false)` after failure.
    pub fn outcome(&self) -> Option<bool> {
        match self.phase() {
            Phase::Succeeded => Some(true),
            Phase::Failed => Some(false),
            Phase::Pending | Phase::Started => None,
        }
    }

    fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move to `next` if the current phase allows it.
    fn advance(&self, allowed: &[Phase], next: Phase) -> bool {
        let mut phase = self.phase.lock().unwrap_or_else(|p| p.into_inner());
        if allowed.contains(&phase) {
            *phase = next;
            true
        } else {
            false
        }
    }
}

impl<R: ProgressReporter> ProgressReporter for ProgressGate<R> {
    fn report_start(&self, host: &str) {
        if self.advance(&[Phase::Pending], Phase::Started) {
            self.inner.report_start(host);
        } else {
            debug!(host, "dropping duplicate start");
        }
    }

    fn report_progress(&self, info: ProgressInfo) {
        if self.phase() == Phase::Started {
            self.inner.report_progress(info);
        } else {
            debug!(?info, "dropping progress outside of a running request");
        }
    }

    fn report_success(&self) {
        if self.advance(&[Phase::Pending, Phase::Started], Phase::Succeeded) {
            self.inner.report_success();
        } else {
            warn!("request already finished, ignoring success");
        }
    }

    fn report_failure(&self, error: Arc<Error>) {
        if self.advance(&[Phase::Pending, Phase::Started], Phase::Failed) {
            self.inner.report_failure(error);
        } else {
            warn!(%error, "request already finished, ignoring failure");
        }
    }
}

impl<R: ProgressReporter> Drop for ProgressGate<R> {
    fn drop(&mut self) {
        if !self.is_finished() {
            self.report_failure(Arc::new(Error::Worker(
                "worker went away without reporting an outcome".to_string(),
            )));
        }
    }
}

/// Sends events down an in-process channel.
#[derive(Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressReporter for ChannelReporter {
    fn report_start(&self, host: &str) {
        let _ = self.tx.send(ProgressEvent::Start {
            host: host.to_string(),
        });
    }

    fn report_progress(&self, info: ProgressInfo) {
        let _ = self.tx.send(ProgressEvent::Progress(info));
    }

    fn report_success(&self) {
        let _ = self.tx.send(ProgressEvent::Success);
    }

    fn report_failure(&self, error: Arc<Error>) {
        let _ = self.tx.send(ProgressEvent::Failure(error));
    }
}

/// A gated reporter and the receiving end of its events.
pub fn channel() -> (Arc<ProgressGate<ChannelReporter>>, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ProgressGate::new(ChannelReporter { tx })),
        ProgressReceiver { rx, done: false },
    )
}

/// Receiving end of [`channel`].
///
/// If every reporter is dropped before a terminal event, the receiver
/// synthesizes a failure, so a caller always sees exactly one outcome.
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    done: bool,
}

impl ProgressReceiver {
    /// Next event, or `None` after the terminal event has been returned.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await.unwrap_or_else(|| {
            ProgressEvent::Failure(Arc::new(Error::Worker(
                "worker went away without reporting an outcome".to_string(),
            )))
        });
        self.done = event.is_terminal();
        Some(event)
    }

    /// Drain events until the outcome is known.
    pub async fn wait(mut self) -> std::result::Result<(), Arc<Error>> {
        while let Some(event) = self.recv().await {
            match event {
                ProgressEvent::Success => return Ok(()),
                ProgressEvent::Failure(error) => return Err(error),
                _ => {}
            }
        }
        Ok(())
    }
}

struct FanOutState {
    listeners: Vec<Arc<dyn ProgressReporter>>,
    history: Vec<ProgressEvent>,
}

/// Duplicates one stream of events to every request waiting on the same work.
///
/// Listeners that attach late get the history replayed first, terminal event
/// included. Log file announcements only go to the first listener, whose log
/// tree the child logs belong to.
pub struct FanOutReporter {
    state: Mutex<FanOutState>,
}

impl FanOutReporter {
    pub fn new(first: Arc<dyn ProgressReporter>) -> Self {
        Self {
            state: Mutex::new(FanOutState {
                listeners: vec![first],
                history: Vec::new(),
            }),
        }
    }

    pub fn attach(&self, listener: Arc<dyn ProgressReporter>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        for event in &state.history {
            if !matches!(event, ProgressEvent::Progress(ProgressInfo::NewLogFiles { .. })) {
                listener.report(event.clone());
            }
        }
        state.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .listeners
            .len()
    }

    fn broadcast(&self, event: ProgressEvent) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let ProgressEvent::Progress(ProgressInfo::NewLogFiles { .. }) = &event {
            if let Some(first) = state.listeners.first() {
                first.report(event.clone());
            }
        } else {
            for listener in &state.listeners {
                listener.report(event.clone());
            }
        }
        state.history.push(event);
    }
}

impl ProgressReporter for FanOutReporter {
    fn report_start(&self, host: &str) {
        self.broadcast(ProgressEvent::Start {
            host: host.to_string(),
        });
    }

    fn report_progress(&self, info: ProgressInfo) {
        self.broadcast(ProgressEvent::Progress(info));
    }

    fn report_success(&self) {
        self.broadcast(ProgressEvent::Success);
    }

    fn report_failure(&self, error: Arc<Error>) {
        self.broadcast(ProgressEvent::Failure(error));
    }
}
