//! Integration tests for daemons, connections and the command worker.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use labpipe::daemon::{CommandWorker, Daemon, WorkContext, Worker};
use labpipe::error::Error;
use labpipe::files::{DaemonInfo, FileTokenFactory};
use labpipe::log::{LogRouter, LoggerFactory};
use labpipe::model::WorkPacket;
use labpipe::progress::{self, ProgressEvent, ProgressInfo, ProgressReceiver, ProgressReporter};
use tempfile::TempDir;

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    Panic,
    Forget,
}

/// Remembers the packet as the worker saw it.
struct Recorder {
    behavior: Behavior,
    seen: Mutex<Option<WorkPacket>>,
}

impl Recorder {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            seen: Mutex::new(None),
        })
    }

    fn seen(&self) -> Option<WorkPacket> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Worker<WorkPacket> for Recorder {
    async fn process_request(&self, work: WorkPacket, ctx: WorkContext) {
        *self.seen.lock().unwrap() = Some(work);
        match self.behavior {
            Behavior::Succeed => {
                ctx.log.create_child_log().unwrap();
                ctx.reporter.report_success();
            }
            Behavior::Panic => panic!("tool exploded"),
            Behavior::Forget => {}
        }
    }
}

struct Site {
    shared: TempDir,
    temp: TempDir,
}

impl Site {
    fn new() -> Self {
        Self {
            shared: TempDir::new().unwrap(),
            temp: TempDir::new().unwrap(),
        }
    }

    fn files(&self, id: &str) -> FileTokenFactory {
        FileTokenFactory::new(DaemonInfo {
            daemon_id: id.to_string(),
            shared_space: Some(self.shared.path().to_path_buf()),
            temp_folder: self.temp.path().to_path_buf(),
        })
    }

    fn loggers(&self) -> LoggerFactory {
        LoggerFactory::new(self.temp.path().join("logs"), LogRouter::new())
    }
}

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"raw").unwrap();
}

async fn collect(mut events: ProgressReceiver) -> Vec<ProgressEvent> {
    let mut all = Vec::new();
    while let Some(event) = events.recv().await {
        all.push(event);
    }
    all
}

/// Sends one packet from site `a` to a daemon on site `b` running `worker`.
async fn round_trip(
    a: &Site,
    b: &Site,
    worker: Arc<Recorder>,
    packet: WorkPacket,
) -> Vec<ProgressEvent> {
    let daemon: Daemon<WorkPacket> = Daemon::new(worker, b.files("b"), b.loggers(), 2);
    let runner = tokio::spawn({
        let daemon = daemon.clone();
        async move { daemon.run().await }
    });

    let (reporter, events) = progress::channel();
    daemon
        .connect(a.files("a"))
        .send_work(packet, reporter)
        .unwrap();
    let events = collect(events).await;

    daemon.shutdown();
    runner.await.unwrap().unwrap();
    events
}

fn failure_message(events: &[ProgressEvent]) -> String {
    match events.last() {
        Some(ProgressEvent::Failure(error)) => error.to_string(),
        other => panic!("expected a failure, got {other:?}"),
    }
}

#[tokio::test]
async fn work_crosses_daemons_with_paths_rerooted() {
    let (a, b) = (Site::new(), Site::new());
    touch(&a.shared.path().join("runs/sample.raw"));
    touch(&b.shared.path().join("runs/sample.raw"));
    let packet = WorkPacket::new(
        "task-1",
        "mgf-conversion",
        a.shared.path().join("runs/sample.raw"),
        a.shared.path().join("results/sample.mgf"),
    );
    let recorder = Recorder::new(Behavior::Succeed);

    let events = round_trip(&a, &b, recorder.clone(), packet).await;

    assert!(matches!(events.first(), Some(ProgressEvent::Start { .. })), "{events:?}");
    assert!(events.iter().any(|e| matches!(
        e,
        ProgressEvent::Progress(ProgressInfo::NewLogFiles { .. })
    )));
    assert!(matches!(events.last(), Some(ProgressEvent::Success)), "{events:?}");

    let seen = recorder.seen().expect("worker ran");
    assert_eq!(seen.task_id, "task-1");
    assert_eq!(
        seen.input.path(),
        Some(b.shared.path().join("runs/sample.raw").as_path())
    );
    assert_eq!(
        seen.output.path(),
        Some(b.shared.path().join("results/sample.mgf").as_path())
    );
    assert!(seen.input.token().unwrap().exists_on_source);
    assert!(!seen.output.token().unwrap().exists_on_source);
}

#[tokio::test]
async fn untranslatable_files_fail_before_sending() {
    let (a, b) = (Site::new(), Site::new());
    let private = TempDir::new().unwrap();
    let packet = WorkPacket::new(
        "task-2",
        "mgf-conversion",
        private.path().join("sample.raw"),
        a.shared.path().join("sample.mgf"),
    );
    let daemon: Daemon<WorkPacket> =
        Daemon::new(Recorder::new(Behavior::Succeed), b.files("b"), b.loggers(), 1);

    let (reporter, _events) = progress::channel();
    let result = daemon.connect(a.files("a")).send_work(packet, reporter);

    assert!(matches!(result, Err(Error::Untranslatable { .. })), "{result:?}");
}

#[tokio::test]
async fn a_panicking_worker_is_reported_as_a_failure() {
    let (a, b) = (Site::new(), Site::new());
    let packet = WorkPacket::new(
        "task-3",
        "mgf-conversion",
        a.shared.path().join("in.raw"),
        a.shared.path().join("out.mgf"),
    );

    let events = round_trip(&a, &b, Recorder::new(Behavior::Panic), packet).await;

    assert!(failure_message(&events).contains("panicked"));
}

#[tokio::test]
async fn a_worker_that_never_reports_is_a_failure() {
    let (a, b) = (Site::new(), Site::new());
    let packet = WorkPacket::new(
        "task-4",
        "mgf-conversion",
        a.shared.path().join("in.raw"),
        a.shared.path().join("out.mgf"),
    );

    let events = round_trip(&a, &b, Recorder::new(Behavior::Forget), packet).await;

    assert!(matches!(events.first(), Some(ProgressEvent::Start { .. })));
    assert!(failure_message(&events).contains("without reporting"));
}

fn log_files(events: &[ProgressEvent]) -> Option<(PathBuf, PathBuf)> {
    events.iter().find_map(|e| match e {
        ProgressEvent::Progress(ProgressInfo::NewLogFiles {
            output_path,
            error_path,
            ..
        }) => Some((output_path.clone(), error_path.clone())),
        _ => None,
    })
}

async fn run_command(script: &str, packet: WorkPacket, site: &Site) -> Vec<ProgressEvent> {
    let worker = CommandWorker::new("/bin/sh", site.temp.path().join("scratch"))
        .with_args(["-c", script]);
    let (reporter, events) = progress::channel();
    reporter.report_start("test");
    let reporter: Arc<dyn ProgressReporter> = reporter;
    let ctx = WorkContext {
        log: Arc::new(site.loggers().request_log(Arc::clone(&reporter))),
        reporter,
    };
    worker.process_request(packet, ctx).await;
    collect(events).await
}

#[cfg(unix)]
#[tokio::test]
async fn command_worker_runs_the_program_with_the_packet_in_its_environment() {
    let site = Site::new();
    let input = site.shared.path().join("sample.raw");
    touch(&input);
    let output = site.shared.path().join("results/sample.mgf");
    let packet = WorkPacket::new("task-5", "mgf-conversion", &input, &output)
        .with_params("--centroid");

    let events = run_command(
        r#"echo "converting $LABPIPE_INPUT with $LABPIPE_PARAMS"; echo warn >&2; printf peaks > "$LABPIPE_OUTPUT""#,
        packet,
        &site,
    )
    .await;

    assert!(matches!(events.last(), Some(ProgressEvent::Success)), "{events:?}");
    assert_eq!(std::fs::read(&output).unwrap(), b"peaks");

    let (out_log, err_log) = log_files(&events).expect("child log announced");
    let out = std::fs::read_to_string(out_log).unwrap();
    assert!(out.contains(&format!("converting {} with --centroid", input.display())));
    assert_eq!(std::fs::read_to_string(err_log).unwrap(), "warn\n");

    let leftovers = std::fs::read_dir(site.temp.path().join("scratch")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn command_worker_reports_a_failing_exit_status() {
    let site = Site::new();
    let packet = WorkPacket::new(
        "task-6",
        "mgf-conversion",
        site.shared.path().join("in.raw"),
        site.shared.path().join("out.mgf"),
    );

    let events = run_command("exit 3", packet, &site).await;

    assert!(failure_message(&events).contains("status 3"));
}

#[cfg(unix)]
#[tokio::test]
async fn command_setup_failures_leave_no_scratch_folders() {
    let site = Site::new();
    let blocker = site.shared.path().join("results");
    touch(&blocker);
    let packet = WorkPacket::new(
        "task-7",
        "mgf-conversion",
        site.shared.path().join("in.raw"),
        blocker.join("out.mgf"),
    );

    let events = run_command("exit 0", packet, &site).await;

    assert!(!failure_message(&events).is_empty());
    let scratch = site.temp.path().join("scratch");
    assert!(!scratch.exists() || std::fs::read_dir(&scratch).unwrap().count() == 0);
}

#[tokio::test]
async fn a_missing_program_still_cleans_its_scratch_folder() {
    let site = Site::new();
    let scratch = site.temp.path().join("scratch");
    let worker = CommandWorker::new(site.temp.path().join("no-such-tool"), &scratch);
    let packet = WorkPacket::new(
        "task-8",
        "mgf-conversion",
        site.shared.path().join("in.raw"),
        site.shared.path().join("out.mgf"),
    );
    let (reporter, events) = progress::channel();
    reporter.report_start("test");
    let reporter: Arc<dyn ProgressReporter> = reporter;
    let ctx = WorkContext {
        log: Arc::new(site.loggers().request_log(Arc::clone(&reporter))),
        reporter,
    };

    worker.process_request(packet, ctx).await;

    assert!(!failure_message(&collect(events).await).is_empty());
    assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
}
