//! Integration tests for file tokens and file-carrier traversal.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use labpipe::error::{Error, Result};
use labpipe::files::{
    DaemonInfo, FileCarrier, FileDownloader, FileRef, FileToken, FileTokenFactory, FileWalk,
    Param, ReceiverTranslator, SenderTranslator,
};
use tempfile::TempDir;

fn daemon(id: &str, shared: Option<&Path>, temp: &Path) -> DaemonInfo {
    DaemonInfo {
        daemon_id: id.to_string(),
        shared_space: shared.map(Path::to_path_buf),
        temp_folder: temp.to_path_buf(),
    }
}

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"data").unwrap();
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[test]
fn wire_form_round_trips() {
    let token = FileToken {
        source_daemon: Some("daemon-a".to_string()),
        token_path: "shared:/runs/a.raw".to_string(),
        exists_on_source: true,
    };
    assert_eq!(token.to_wire(), "daemon-a|e|shared:/runs/a.raw");
    assert_eq!(FileToken::parse_wire(&token.to_wire()).unwrap(), token);

    let anonymous = FileToken::parse_wire("-|n|local:/tmp/out.mgf").unwrap();
    assert_eq!(anonymous.source_daemon, None);
    assert!(!anonymous.exists_on_source);
}

#[test]
fn malformed_wire_tokens_are_rejected() {
    for wire in ["", "daemon|e", "daemon|x|local:/a", "daemon|e|/no/prefix"] {
        assert!(
            matches!(FileToken::parse_wire(wire), Err(Error::InvalidToken(_))),
            "accepted {wire:?}"
        );
    }
}

#[test]
fn shared_files_are_rerooted_under_the_receivers_shared_space() {
    let a_shared = TempDir::new().unwrap();
    let b_shared = TempDir::new().unwrap();
    let temp = TempDir::new().unwrap();
    let sender = FileTokenFactory::new(daemon("a", Some(a_shared.path()), temp.path()));
    let receiver = FileTokenFactory::new(daemon("b", Some(b_shared.path()), temp.path()));

    let file = a_shared.path().join("runs/sample.raw");
    touch(&file);

    let token = sender.translate_before_transfer(&file).unwrap();
    assert_eq!(token.token_path, "shared:/runs/sample.raw");
    assert!(token.exists_on_source);
    assert_eq!(
        receiver.resolve(&token).unwrap(),
        b_shared.path().join("runs/sample.raw")
    );
}

#[test]
fn local_files_fail_loudly_when_local_transfer_is_disabled() {
    let shared = TempDir::new().unwrap();
    let elsewhere = TempDir::new().unwrap();
    let sender = FileTokenFactory::new(daemon("a", Some(shared.path()), elsewhere.path()));

    let err = sender
        .translate_before_transfer(&elsewhere.path().join("private.txt"))
        .unwrap_err();
    assert!(matches!(err, Error::Untranslatable { .. }), "got {err}");
}

#[test]
fn own_local_tokens_resolve_verbatim() {
    let temp = TempDir::new().unwrap();
    let factory = FileTokenFactory::new(daemon("a", None, temp.path()));
    let file = temp.path().join("input.txt");
    touch(&file);

    let token = factory.translate_before_transfer(&file).unwrap();
    assert!(token.token_path.starts_with("local:"));
    assert_eq!(
        factory.resolve(&token).unwrap(),
        std::fs::canonicalize(&file).unwrap()
    );
}

#[test]
fn foreign_local_tokens_need_a_downloader() {
    let source_dir = TempDir::new().unwrap();
    let receiver_temp = TempDir::new().unwrap();
    let sender = FileTokenFactory::new(daemon("a", None, source_dir.path()));
    let receiver = FileTokenFactory::new(daemon("b", None, receiver_temp.path()));

    let existing = source_dir.path().join("in.txt");
    touch(&existing);
    let token = sender.translate_before_transfer(&existing).unwrap();
    assert!(matches!(
        receiver.resolve(&token),
        Err(Error::Untranslatable { .. })
    ));

    // Not yet written on the source: nothing to fetch, the mirror path is used.
    let future = sender
        .translate_before_transfer(&source_dir.path().join("out.txt"))
        .unwrap();
    let mirrored = receiver.resolve(&future).unwrap();
    assert!(mirrored.starts_with(receiver_temp.path()));
    assert!(mirrored.ends_with("out.txt"));
}

struct CopyDownloader;

impl FileDownloader for CopyDownloader {
    fn download(&self, token: &FileToken, target: &Path) -> Result<PathBuf> {
        let source = token.token_path.trim_start_matches("local:");
        std::fs::create_dir_all(target.parent().unwrap())?;
        std::fs::copy(source, target)?;
        Ok(target.to_path_buf())
    }
}

#[test]
fn foreign_local_tokens_are_mirrored_through_the_downloader() {
    let source_dir = TempDir::new().unwrap();
    let receiver_temp = TempDir::new().unwrap();
    let sender = FileTokenFactory::new(daemon("a", None, source_dir.path()));
    let receiver = FileTokenFactory::new(daemon("b", None, receiver_temp.path()))
        .with_downloader(Arc::new(CopyDownloader));

    let existing = source_dir.path().join("in.txt");
    touch(&existing);
    let token = sender.translate_before_transfer(&existing).unwrap();

    let local = receiver.resolve(&token).unwrap();
    assert!(local.starts_with(receiver_temp.path()));
    assert_eq!(std::fs::read(&local).unwrap(), b"data");
}

#[test]
fn anonymous_tokens_are_reissued_and_signed_tokens_pass_through() {
    let temp = TempDir::new().unwrap();
    let factory = FileTokenFactory::new(daemon("a", None, temp.path()));

    let anonymous = FileToken::anonymous(&temp.path().join("x.txt"));
    let reissued = factory.translate_token(&anonymous).unwrap();
    assert_eq!(reissued.source_daemon.as_deref(), Some("a"));

    let foreign = FileToken {
        source_daemon: Some("z".to_string()),
        token_path: "local:/elsewhere/y.txt".to_string(),
        exists_on_source: true,
    };
    assert_eq!(factory.translate_token(&foreign).unwrap(), foreign);
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counting {
    sent: Mutex<Vec<PathBuf>>,
    resolved: Mutex<Vec<String>>,
}

impl SenderTranslator for Counting {
    fn translate_before_transfer(&self, path: &Path) -> Result<FileToken> {
        self.sent.lock().unwrap().push(path.to_path_buf());
        Ok(FileToken {
            source_daemon: Some("counting".to_string()),
            token_path: format!("local:{}", path.display()),
            exists_on_source: path.exists(),
        })
    }
}

impl ReceiverTranslator for Counting {
    fn resolve(&self, token: &FileToken) -> Result<PathBuf> {
        self.resolved.lock().unwrap().push(token.token_path.clone());
        Ok(PathBuf::from(token.token_path.trim_start_matches("local:")))
    }
}

struct Node {
    file: FileRef,
    next: Option<Arc<Mutex<Node>>>,
}

impl FileCarrier for Node {
    fn visit_files(&mut self, walk: &mut FileWalk<'_>) -> Result<()> {
        walk.file(&mut self.file)?;
        if let Some(next) = &self.next {
            walk.shared(next)?;
        }
        Ok(())
    }
}

struct Item {
    file: FileRef,
}

impl FileCarrier for Item {
    fn visit_files(&mut self, walk: &mut FileWalk<'_>) -> Result<()> {
        walk.file(&mut self.file)
    }
}

struct Graph {
    head: Arc<Mutex<Node>>,
    also: Arc<Mutex<Node>>,
    batch: Vec<Item>,
    maybe: Option<FileRef>,
    params: BTreeMap<String, Param>,
    /// Process-local, never sent.
    scratch: FileRef,
}

impl FileCarrier for Graph {
    fn visit_files(&mut self, walk: &mut FileWalk<'_>) -> Result<()> {
        walk.shared(&self.head)?;
        walk.shared(&self.also)?;
        walk.carriers(self.batch.iter_mut())?;
        walk.opt_file(&mut self.maybe)?;
        walk.params(self.params.values_mut())
    }
}

/// Two nodes pointing at each other, reachable twice from the root.
fn cyclic_graph() -> Graph {
    let a = Arc::new(Mutex::new(Node {
        file: FileRef::new("/data/a.raw"),
        next: None,
    }));
    let b = Arc::new(Mutex::new(Node {
        file: FileRef::new("/data/b.raw"),
        next: Some(Arc::clone(&a)),
    }));
    a.lock().unwrap().next = Some(Arc::clone(&b));

    let mut params = BTreeMap::new();
    params.insert("fasta".to_string(), Param::File(FileRef::new("/db/human.fasta")));
    params.insert("tolerance".to_string(), Param::Json(serde_json::json!(10.5)));

    Graph {
        head: a,
        also: b,
        batch: vec![
            Item {
                file: FileRef::new("/data/c.mgf"),
            },
            Item {
                file: FileRef::new("/data/d.mgf"),
            },
        ],
        maybe: Some(FileRef::new("/data/e.txt")),
        params,
        scratch: FileRef::new("/tmp/scratch.bin"),
    }
}

#[test]
fn every_reachable_file_is_visited_exactly_once_even_across_cycles() {
    let mut graph = cyclic_graph();
    let translator = Counting::default();

    assert_eq!(graph.translate_on_sender(&translator).unwrap(), 6);
    let sent: HashSet<PathBuf> = translator.sent.lock().unwrap().iter().cloned().collect();
    assert_eq!(sent.len(), 6);
    assert!(sent.contains(Path::new("/db/human.fasta")));
    assert!(!sent.contains(Path::new("/tmp/scratch.bin")));
    assert!(graph.scratch.token().is_none());

    assert_eq!(graph.translate_on_receiver(&translator, None).unwrap(), 6);
    assert_eq!(translator.resolved.lock().unwrap().len(), 6);
}

#[test]
fn repeated_translation_is_a_no_op() {
    let mut graph = cyclic_graph();
    let translator = Counting::default();

    graph.translate_on_sender(&translator).unwrap();
    graph.translate_on_receiver(&translator, None).unwrap();
    assert_eq!(graph.translate_on_sender(&translator).unwrap(), 0);
    assert_eq!(graph.translate_on_receiver(&translator, None).unwrap(), 0);
    assert_eq!(translator.sent.lock().unwrap().len(), 6);
    assert_eq!(translator.resolved.lock().unwrap().len(), 6);
}

#[test]
fn expected_files_must_exist_after_resolving() {
    let temp = TempDir::new().unwrap();
    let present = temp.path().join("present.txt");
    touch(&present);
    let missing = temp.path().join("missing.txt");

    let mut files = vec![FileRef::new(&present), FileRef::new(&missing)];
    let translator = Counting::default();
    files.translate_on_sender(&translator).unwrap();

    let expected: HashSet<PathBuf> = [missing.clone()].into_iter().collect();
    let err = files
        .translate_on_receiver(&translator, Some(&expected))
        .unwrap_err();
    assert!(matches!(err, Error::MissingFile(ref p) if p == &missing), "got {err}");
}

#[test]
fn only_tokens_cross_the_wire() {
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("in.raw");
    touch(&input);

    let mut files = vec![FileRef::new(&input)];
    let sender = FileTokenFactory::new(daemon("a", None, temp.path()));
    files.translate_on_sender(&sender).unwrap();

    let json = serde_json::to_string(&files).unwrap();
    let mut received: Vec<FileRef> = serde_json::from_str(&json).unwrap();
    assert!(received[0].path().is_none());
    assert!(received[0].require_path().is_err());

    received.translate_on_receiver(&sender, None).unwrap();
    assert_eq!(
        received[0].path().unwrap(),
        std::fs::canonicalize(&input).unwrap()
    );
}

#[test]
fn simulated_transfer_keeps_paths_usable() {
    let temp = TempDir::new().unwrap();
    let input = temp.path().join("in.raw");
    touch(&input);

    let mut file = FileRef::new(&input);
    assert_eq!(file.simulate_transfer().unwrap(), 2);
    assert!(file.is_resolved());
    assert_eq!(file.path().unwrap(), std::fs::canonicalize(&input).unwrap());
    assert_eq!(file.simulate_transfer().unwrap(), 0);
}
