use anyhow::{anyhow, Result};
use ocr_batch::config::Config;
use ocr_batch::engine::{ConvertIn, DocDiag, Engine};
use ocr_batch::report::{index_path, TaskReport};
use ocr_batch::weigh::PageCounter;
use ocr_batch::{
    ArtifactRef, BatchOrchestrator, ConversionError, InputDoc, MemoryProgressStore, ProgressStore,
    SubmitError, TaskError, TaskId, TaskState,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Documents are `"<pages>|<body>"`; anything else fails to weigh.
struct PrefixCounter;

impl PageCounter for PrefixCounter {
    fn count_pages(&self, bytes: &[u8]) -> Result<u64> {
        let text = std::str::from_utf8(bytes)?;
        let (pages, _) = text.split_once('|').ok_or_else(|| anyhow!("no page prefix"))?;
        Ok(pages.parse()?)
    }
}

struct FakeEngine {
    shared_dir: PathBuf,
    failing: HashSet<String>,
    unavailable: bool,
}

impl FakeEngine {
    fn new(shared_dir: &Path) -> Self {
        Self {
            shared_dir: shared_dir.to_path_buf(),
            failing: HashSet::new(),
            unavailable: false,
        }
    }

    fn failing(mut self, names: &[&str]) -> Self {
        self.failing = names.iter().map(|n| n.to_string()).collect();
        self
    }
}

impl Engine for FakeEngine {
    fn doctor(&self) -> Result<DocDiag> {
        Ok(DocDiag {
            program: "fake".into(),
            program_version: None,
            image: "fake".into(),
            image_present: true,
            ok: true,
            error: None,
        })
    }

    fn convert(&self, req: &ConvertIn) -> Result<ArtifactRef, ConversionError> {
        if self.unavailable {
            return Err(ConversionError::EngineUnavailable {
                reason: "no such program".into(),
            });
        }
        let name = req
            .input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.failing.contains(&name) {
            return Err(ConversionError::ToolFailed {
                code: Some(2),
                stderr: "bad input".into(),
            });
        }
        let body = std::fs::read(&req.input_path)?;
        let mut out = format!("ocr[{}]:", req.languages).into_bytes();
        out.extend(body);
        std::fs::write(&req.output_path, out)?;

        let rel = req.output_path.strip_prefix(&self.shared_dir).unwrap();
        Ok(ArtifactRef {
            name: rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/"),
            path: req.output_path.clone(),
        })
    }
}

/// Memory store that also keeps every write.
#[derive(Default)]
struct RecordingStore {
    inner: MemoryProgressStore,
    history: Mutex<Vec<(TaskId, u8)>>,
}

impl RecordingStore {
    fn history(&self, id: &TaskId) -> Vec<u8> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == id)
            .map(|(_, p)| *p)
            .collect()
    }
}

impl ProgressStore for RecordingStore {
    fn update(&self, task_id: &TaskId, percent: u8) -> Result<()> {
        self.history.lock().unwrap().push((*task_id, percent));
        self.inner.update(task_id, percent)
    }

    fn get(&self, task_id: &TaskId) -> u8 {
        self.inner.get(task_id)
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    cfg: Config,
    store: Arc<RecordingStore>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.paths.shared_dir = dir.path().join("shared").display().to_string();
        cfg.paths.progress_dir = dir.path().join("progress").display().to_string();
        std::fs::create_dir_all(&cfg.paths.shared_dir).unwrap();
        Self {
            _dir: dir,
            cfg,
            store: Arc::new(RecordingStore::default()),
        }
    }

    fn shared_dir(&self) -> PathBuf {
        PathBuf::from(&self.cfg.paths.shared_dir)
    }

    fn orchestrator(&self, engine: FakeEngine) -> BatchOrchestrator {
        BatchOrchestrator::new(
            &self.cfg,
            Arc::new(engine),
            Arc::new(PrefixCounter),
            self.store.clone(),
        )
    }
}

fn doc(name: &str, pages: u64) -> InputDoc {
    InputDoc::new(name, format!("{pages}|{name}"))
}

fn zip_entries(path: &Path) -> Vec<String> {
    let mut zip = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    (0..zip.len())
        .map(|i| zip.by_index(i).unwrap().name().to_string())
        .collect()
}

#[test]
fn two_successes_are_archived_with_weighted_progress() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    let handle = orch
        .submit(vec![doc("A.pdf", 2), doc("B.pdf", 3)], &[])
        .unwrap();
    let id = handle.id();
    let report = handle.wait().unwrap();

    assert_eq!(h.store.history(&id), vec![0, 40, 100]);
    assert_eq!(orch.progress(&id), 100);
    assert_eq!(orch.state(&id), Some(TaskState::Done));
    assert_eq!(report.total_weight, 5);
    assert!(!report.is_partial_failure());

    let artifact = orch.result(&id).unwrap();
    assert_eq!(artifact.name, format!("{id}/ocr_results_{id}.zip"));
    assert_eq!(zip_entries(&artifact.path), vec!["A-ocr.pdf", "B-ocr.pdf"]);
    assert_eq!(orch.resolve_artifact(&artifact.name), Some(artifact.path.clone()));
}

#[test]
fn single_success_is_the_artifact_itself() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    let handle = orch.submit(vec![doc("A.pdf", 5)], &["hin".to_string()]).unwrap();
    let id = handle.id();
    handle.wait().unwrap();

    let artifact = orch.result(&id).unwrap();
    assert_eq!(artifact.name, format!("{id}/A-ocr.pdf"));
    let body = std::fs::read_to_string(&artifact.path).unwrap();
    assert_eq!(body, "ocr[hin]:5|A.pdf");
    assert!(!h.shared_dir().join(id.to_string()).join(format!("ocr_results_{id}.zip")).exists());
    assert_eq!(h.store.history(&id), vec![0, 100]);
}

#[test]
fn failed_unit_is_isolated_and_reported() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()).failing(&["A.pdf"]));

    let handle = orch
        .submit(vec![doc("A.pdf", 4), doc("B.pdf", 6)], &[])
        .unwrap();
    let id = handle.id();
    let report = handle.wait().unwrap();

    assert_eq!(h.store.history(&id), vec![0, 40, 100]);
    assert_eq!(orch.progress(&id), 100);
    assert!(report.is_partial_failure());
    assert_eq!(report.failed_inputs(), vec!["A.pdf"]);
    assert_eq!(orch.result(&id).unwrap().name, format!("{id}/B-ocr.pdf"));
}

#[test]
fn all_failures_end_in_no_valid_input_below_100() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()).failing(&["A.pdf", "B.pdf"]));

    let handle = orch
        .submit(vec![doc("A.pdf", 4), doc("B.pdf", 6)], &[])
        .unwrap();
    let id = handle.id();
    let err = handle.wait().unwrap_err();

    assert_eq!(err, TaskError::NoValidInput { attempted: 2 });
    assert!(!h.store.history(&id).contains(&100));
    assert_eq!(orch.progress(&id), 40);
    assert!(orch.result(&id).is_none());
    assert!(matches!(orch.state(&id), Some(TaskState::Failed { .. })));
}

#[test]
fn unavailable_engine_aborts_the_task() {
    let h = Harness::new();
    let mut engine = FakeEngine::new(&h.shared_dir());
    engine.unavailable = true;
    let orch = h.orchestrator(engine);

    let handle = orch
        .submit(vec![doc("A.pdf", 1), doc("B.pdf", 1), doc("C.pdf", 1)], &[])
        .unwrap();
    let id = handle.id();
    let err = handle.wait().unwrap_err();

    assert!(matches!(err, TaskError::EngineUnavailable { .. }));
    assert_eq!(h.store.history(&id), vec![0]);
    assert_eq!(
        orch.state(&id),
        Some(TaskState::Failed { error: err.clone() })
    );
    assert!(orch.result(&id).is_none());

    let index = TaskReport::load(&index_path(&h.cfg, &id)).unwrap();
    assert_eq!(index.state, TaskState::Failed { error: err });
    assert!(index.units.iter().all(|u| !u.attempted));
    assert!(index.result_file.is_none());
}

#[test]
fn zero_weight_batch_still_completes() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    let inputs = vec![
        InputDoc::new("a.pdf", "unweighable"),
        InputDoc::new("b.pdf", "unweighable"),
        InputDoc::new("c.pdf", "unweighable"),
    ];
    let handle = orch.submit(inputs, &[]).unwrap();
    let id = handle.id();
    let report = handle.wait().unwrap();

    assert_eq!(report.total_weight, 0);
    assert_eq!(h.store.history(&id), vec![0, 33, 66, 100]);
}

#[test]
fn weightless_tail_still_reports_progress_before_packaging() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    let inputs = vec![
        doc("A.pdf", 5),
        InputDoc::new("b.pdf", "unweighable"),
        InputDoc::new("c.pdf", "unweighable"),
    ];
    let handle = orch.submit(inputs, &[]).unwrap();
    let id = handle.id();
    let report = handle.wait().unwrap();

    assert_eq!(report.total_weight, 5);
    assert_eq!(h.store.history(&id), vec![0, 99, 100]);
}

#[test]
fn finished_tasks_can_be_forgotten() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    assert!(!orch.forget(&TaskId::generate()));

    let handle = orch.submit(vec![doc("A.pdf", 1)], &[]).unwrap();
    let id = handle.id();
    handle.wait().unwrap();

    assert!(orch.forget(&id));
    assert!(orch.state(&id).is_none());
    assert!(orch.result(&id).is_none());
    assert_eq!(orch.progress(&id), 100);
    assert!(!orch.forget(&id));
}

#[test]
fn unknown_task_reads_as_not_started() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));
    let id = TaskId::generate();

    assert_eq!(orch.progress(&id), 0);
    assert!(orch.state(&id).is_none());
    assert!(orch.result(&id).is_none());
}

#[test]
fn worker_pool_keeps_submission_order_and_monotonic_progress() {
    let mut h = Harness::new();
    h.cfg.global.max_parallel_jobs = 3;
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    let inputs: Vec<InputDoc> = (1..=6).map(|i| doc(&format!("doc{i}.pdf"), i)).collect();
    let handle = orch.submit(inputs, &[]).unwrap();
    let id = handle.id();
    handle.wait().unwrap();

    let history = h.store.history(&id);
    assert_eq!(history.first(), Some(&0));
    assert_eq!(history.last(), Some(&100));
    assert!(history.windows(2).all(|w| w[0] < w[1]));

    let artifact = orch.result(&id).unwrap();
    let expected: Vec<String> = (1..=6).map(|i| format!("doc{i}-ocr.pdf")).collect();
    assert_eq!(zip_entries(&artifact.path), expected);
}

#[test]
fn submission_rejects_empty_and_unsupported_batches() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    assert!(matches!(orch.submit(vec![], &[]), Err(SubmitError::Empty)));
    assert!(matches!(
        orch.submit(vec![InputDoc::new("notes.txt", "1|x")], &[]),
        Err(SubmitError::NoAcceptedInput { submitted: 1 })
    ));
}

#[test]
fn submission_enforces_limits() {
    let mut h = Harness::new();
    h.cfg.inputs.max_inputs = 1;
    h.cfg.inputs.max_input_bytes = 8;
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    assert!(matches!(
        orch.submit(vec![doc("a.pdf", 1), doc("b.pdf", 1)], &[]),
        Err(SubmitError::TooManyInputs { count: 2, max: 1 })
    ));
    assert!(matches!(
        orch.submit(vec![InputDoc::new("big.pdf", "1|0123456789")], &[]),
        Err(SubmitError::InputTooLarge { .. })
    ));
}

#[test]
fn unsupported_files_are_skipped_and_duplicate_names_kept_apart() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    let inputs = vec![
        doc("scan.pdf", 1),
        InputDoc::new("readme.txt", "1|skip me"),
        doc("../scan.pdf", 1),
    ];
    let handle = orch.submit(inputs, &[]).unwrap();
    let id = handle.id();
    let report = handle.wait().unwrap();

    let names: Vec<&str> = report.units.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["scan.pdf", "scan_2.pdf"]);
    let artifact = orch.result(&id).unwrap();
    assert_eq!(zip_entries(&artifact.path), vec!["scan-ocr.pdf", "scan_2-ocr.pdf"]);
}

#[test]
fn index_is_written_for_finished_tasks() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    let handle = orch.submit(vec![doc("A.pdf", 2)], &[]).unwrap();
    let id = handle.id();
    handle.wait().unwrap();

    let index = TaskReport::load(&index_path(&h.cfg, &id)).unwrap();
    assert_eq!(index.task_id, id);
    assert_eq!(index.state, TaskState::Done);
    assert_eq!(index.progress, 100);
    assert_eq!(index.languages, "eng");
    assert_eq!(index.result_file, Some(format!("{id}/A-ocr.pdf")));
    assert_eq!(index.artifact_sha256.as_deref().map(str::len), Some(64));
}

#[test]
fn inputs_are_removed_when_not_retained() {
    let mut h = Harness::new();
    h.cfg.global.keep_inputs = false;
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    let handle = orch.submit(vec![doc("A.pdf", 1)], &[]).unwrap();
    let id = handle.id();
    handle.wait().unwrap();

    let task_dir = h.shared_dir().join(id.to_string());
    assert!(!task_dir.join("A.pdf").exists());
    assert!(task_dir.join("A-ocr.pdf").exists());
}

#[test]
fn artifact_names_cannot_escape_the_shared_dir() {
    let h = Harness::new();
    let orch = h.orchestrator(FakeEngine::new(&h.shared_dir()));

    assert!(orch.resolve_artifact("../secret.pdf").is_none());
    assert!(orch.resolve_artifact("/etc/passwd").is_none());
    assert!(orch.resolve_artifact("").is_none());
    assert!(orch.resolve_artifact("missing/file.pdf").is_none());
}
