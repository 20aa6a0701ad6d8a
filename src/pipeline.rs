use crate::{
    config::Config,
    engine::{language_flag, ConvertIn, Engine},
    error::{SubmitError, TaskError},
    package::{archive_file_name, package},
    progress::{ProgressStore, ProgressTracker},
    report::{index_path, TaskReport, UnitReport},
    task::{
        ArtifactRef, ConversionResult, InputDoc, InputUnit, TaskId, TaskState, Tombstone,
        UnitOutcome,
    },
    util::{extension_lowercase, now_rfc3339, output_names, sha256_file, unique_names},
    weigh::{weigh_file, PageCounter},
};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Owns the lifecycle of every submitted task: weighing, conversion,
/// progress publication and packaging. Cheap to clone.
#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: Config,
    engine: Arc<dyn Engine>,
    counter: Arc<dyn PageCounter>,
    store: Arc<dyn ProgressStore>,
    /// Entries stay until [`BatchOrchestrator::forget`] drops them.
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
}

struct TaskEntry {
    state: TaskState,
    artifact: Option<ArtifactRef>,
}

/// Returned by [`BatchOrchestrator::submit`] as soon as the task is queued.
pub struct TaskHandle {
    id: TaskId,
    join: JoinHandle<Result<TaskReport, TaskError>>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Block until the task reaches a terminal state.
    pub fn wait(self) -> Result<TaskReport, TaskError> {
        match self.join.join() {
            Ok(res) => res,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

struct Prepared {
    id: TaskId,
    units: Vec<InputUnit>,
    outputs: Vec<String>,
    languages: String,
    started: String,
}

impl BatchOrchestrator {
    pub fn new(
        cfg: &Config,
        engine: Arc<dyn Engine>,
        counter: Arc<dyn PageCounter>,
        store: Arc<dyn ProgressStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg: cfg.clone(),
                engine,
                counter,
                store,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Store the inputs under a fresh task and start processing them in the
    /// background. Returns without waiting for any conversion.
    pub fn submit(
        &self,
        inputs: Vec<InputDoc>,
        languages: &[String],
    ) -> Result<TaskHandle, SubmitError> {
        let prepared = self.inner.prepare(inputs, languages)?;
        let id = prepared.id;

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("task-{id}"))
            .spawn(move || inner.execute(prepared));

        match spawned {
            Ok(join) => Ok(TaskHandle { id, join }),
            Err(e) => {
                lock(&self.inner.tasks).remove(&id);
                Err(SubmitError::Spawn(e))
            }
        }
    }

    /// Last published percentage. Never blocks on a running conversion;
    /// unknown tasks read as 0.
    pub fn progress(&self, task_id: &TaskId) -> u8 {
        self.inner.store.get(task_id)
    }

    pub fn state(&self, task_id: &TaskId) -> Option<TaskState> {
        lock(&self.inner.tasks).get(task_id).map(|e| e.state.clone())
    }

    /// The artifact of a finished task. `None` unless the task is `Done`.
    pub fn result(&self, task_id: &TaskId) -> Option<ArtifactRef> {
        let tasks = lock(&self.inner.tasks);
        let entry = tasks.get(task_id)?;
        match entry.state {
            TaskState::Done => entry.artifact.clone(),
            _ => None,
        }
    }

    /// Drop a terminal task from the registry once its result has been
    /// collected. Running and unknown tasks are left alone and give `false`.
    /// Files on disk and the published progress are not touched.
    pub fn forget(&self, task_id: &TaskId) -> bool {
        let mut tasks = lock(&self.inner.tasks);
        match tasks.get(task_id) {
            Some(entry) if entry.state.is_terminal() => {
                tasks.remove(task_id);
                debug!("task_id={task_id} forgotten");
                true
            }
            _ => false,
        }
    }

    /// Map an artifact name to an existing file inside the shared directory.
    pub fn resolve_artifact(&self, name: &str) -> Option<PathBuf> {
        let rel = Path::new(name);
        if name.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        let path = PathBuf::from(&self.inner.cfg.paths.shared_dir).join(rel);
        path.is_file().then_some(path)
    }
}

impl Inner {
    fn prepare(&self, inputs: Vec<InputDoc>, languages: &[String]) -> Result<Prepared, SubmitError> {
        if inputs.is_empty() {
            return Err(SubmitError::Empty);
        }
        let limits = &self.cfg.inputs;
        if limits.max_inputs > 0 && inputs.len() > limits.max_inputs {
            return Err(SubmitError::TooManyInputs {
                count: inputs.len(),
                max: limits.max_inputs,
            });
        }

        let submitted = inputs.len();
        let mut accepted = Vec::with_capacity(submitted);
        for doc in inputs {
            let allowed = limits.allowed_extensions.is_empty()
                || extension_lowercase(&doc.name).is_some_and(|ext| {
                    limits
                        .allowed_extensions
                        .iter()
                        .any(|a| a.eq_ignore_ascii_case(&ext))
                });
            if !allowed {
                warn!("skipping input with disallowed extension: {:?}", doc.name);
                continue;
            }
            let bytes = doc.bytes.len() as u64;
            if limits.max_input_bytes > 0 && bytes > limits.max_input_bytes {
                return Err(SubmitError::InputTooLarge {
                    name: doc.name,
                    bytes,
                    max: limits.max_input_bytes,
                });
            }
            accepted.push(doc);
        }
        if accepted.is_empty() {
            return Err(SubmitError::NoAcceptedInput { submitted });
        }

        let id = TaskId::generate();
        let task_dir = self.cfg.task_dir(&id.to_string());
        std::fs::create_dir_all(&task_dir)?;

        let names = unique_names(accepted.iter().map(|d| d.name.as_str()));
        let outputs = output_names(&names, &self.cfg.output.suffix, &self.cfg.output.extension);

        let mut units = Vec::with_capacity(accepted.len());
        for (index, (doc, name)) in accepted.into_iter().zip(names).enumerate() {
            let path = task_dir.join(&name);
            if let Err(e) = std::fs::write(&path, &doc.bytes) {
                let _ = std::fs::remove_dir_all(&task_dir);
                return Err(SubmitError::Io(e));
            }
            units.push(InputUnit {
                index,
                original_name: doc.name,
                name,
                path,
                weight: 0,
            });
        }

        let languages = language_flag(&self.cfg.engine, languages);

        lock(&self.tasks).insert(
            id,
            TaskEntry {
                state: TaskState::Created,
                artifact: None,
            },
        );
        self.publish(&id, 0);
        info!(
            "task_id={id} created inputs={} languages={languages} dir={}",
            units.len(),
            task_dir.display()
        );

        Ok(Prepared {
            id,
            units,
            outputs,
            languages,
            started: now_rfc3339(),
        })
    }

    fn execute(&self, task: Prepared) -> Result<TaskReport, TaskError> {
        let Prepared {
            id,
            mut units,
            outputs,
            languages,
            started,
        } = task;

        self.set_state(&id, TaskState::Weighing);
        for unit in &mut units {
            unit.weight = weigh_file(self.counter.as_ref(), &unit.path);
        }
        let total_weight: u64 = units.iter().map(|u| u.weight).sum();
        info!("task_id={id} weighed units={} total_weight={total_weight}", units.len());

        self.set_state(&id, TaskState::Converting);
        let (outcomes, fatal) = self.convert_all(&id, &units, &outputs, &languages, total_weight);

        let mut report = TaskReport {
            task_id: id,
            state: TaskState::Converting,
            started,
            finished: String::new(),
            languages,
            total_weight,
            progress: 0,
            units: unit_reports(&units, &outcomes),
            result_file: None,
            artifact_sha256: None,
        };

        if let Some(reason) = fatal {
            return Err(self.fail(&units, report, TaskError::EngineUnavailable { reason }));
        }

        let mut results: Vec<ConversionResult> = Vec::new();
        for outcome in outcomes.into_iter().flatten() {
            if let UnitOutcome::Converted(r) = outcome {
                results.push(r);
            }
        }

        if results.is_empty() {
            let err = TaskError::NoValidInput {
                attempted: units.len(),
            };
            return Err(self.fail(&units, report, err));
        }

        let failed = report.failed_inputs();
        if !failed.is_empty() {
            warn!(
                "task_id={id} partial failure: {}/{} inputs failed: {}",
                failed.len(),
                units.len(),
                failed.join(", ")
            );
        }

        self.set_state(&id, TaskState::Packaging);
        let archive_name = archive_file_name(&self.cfg.output.archive_prefix, &id.to_string());
        let archive = ArtifactRef {
            name: format!("{id}/{archive_name}"),
            path: self.cfg.task_dir(&id.to_string()).join(&archive_name),
        };
        let artifact = match package(&results, &archive) {
            Ok(a) => a,
            Err(e) => {
                let err = TaskError::PackagingFailure {
                    reason: e.to_string(),
                };
                return Err(self.fail(&units, report, err));
            }
        };

        report.state = TaskState::Done;
        report.progress = 100;
        report.finished = now_rfc3339();
        report.result_file = Some(artifact.name.clone());
        report.artifact_sha256 = match sha256_file(&artifact.path) {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("task_id={id} cannot hash artifact: {e:#}");
                None
            }
        };
        self.write_index(&report);

        {
            let mut tasks = lock(&self.tasks);
            if let Some(entry) = tasks.get_mut(&id) {
                entry.artifact = Some(artifact.clone());
                entry.state = TaskState::Done;
            }
        }
        self.publish(&id, 100);
        info!("task_id={id} done result_file={}", artifact.name);

        self.apply_retention(&units);
        Ok(report)
    }

    /// Convert every unit with at most `max_parallel_jobs` workers. Returns
    /// per-unit outcomes in submission order (`None` = never attempted) and
    /// the reason for a fatal abort, if any.
    fn convert_all(
        &self,
        id: &TaskId,
        units: &[InputUnit],
        outputs: &[String],
        languages: &str,
        total_weight: u64,
    ) -> (Vec<Option<UnitOutcome>>, Option<String>) {
        let workers = self.cfg.global.max_parallel_jobs.clamp(1, units.len().max(1));
        let next = AtomicUsize::new(0);
        let abort: Mutex<Option<String>> = Mutex::new(None);
        let tracker = Mutex::new(ProgressTracker::new(total_weight, units.len()));
        let slots: Vec<Mutex<Option<UnitOutcome>>> = units.iter().map(|_| Mutex::new(None)).collect();

        debug!("task_id={id} converting with {workers} worker(s)");
        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| {
                    loop {
                        if lock(&abort).is_some() {
                            break;
                        }
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(unit) = units.get(i) else {
                            break;
                        };
                        match self.convert_unit(id, unit, units.len(), &outputs[i], languages) {
                            Ok(outcome) => {
                                *lock(&slots[i]) = Some(outcome);
                                let mut t = lock(&tracker);
                                if let Some(pct) = t.record(unit.weight) {
                                    self.publish(id, pct);
                                }
                            }
                            Err(reason) => {
                                lock(&abort).get_or_insert(reason);
                                break;
                            }
                        }
                    }
                });
            }
        });

        let outcomes = slots
            .into_iter()
            .map(|m| m.into_inner().unwrap_or_else(|e| e.into_inner()))
            .collect();
        let fatal = abort.into_inner().unwrap_or_else(|e| e.into_inner());
        (outcomes, fatal)
    }

    /// `Err` carries the reason of a fatal engine failure.
    fn convert_unit(
        &self,
        id: &TaskId,
        unit: &InputUnit,
        total_units: usize,
        output_name: &str,
        languages: &str,
    ) -> Result<UnitOutcome, String> {
        let req = ConvertIn {
            input_path: unit.path.clone(),
            output_path: unit.path.with_file_name(output_name),
            languages: languages.to_string(),
        };
        info!(
            "task_id={id} convert {}/{} {} -> {} weight={}",
            unit.index + 1,
            total_units,
            unit.name,
            output_name,
            unit.weight
        );

        match self.engine.convert(&req) {
            Ok(output) => Ok(UnitOutcome::Converted(ConversionResult {
                input: unit.name.clone(),
                output,
            })),
            Err(e) if e.is_fatal() => {
                error!("task_id={id} input={} fatal engine error: {e}", unit.name);
                Err(e.to_string())
            }
            Err(e) => {
                warn!("task_id={id} input={} conversion failed: {e}", unit.name);
                Ok(UnitOutcome::Failed(Tombstone {
                    input: unit.name.clone(),
                    reason: e.to_string(),
                }))
            }
        }
    }

    fn fail(&self, units: &[InputUnit], mut report: TaskReport, err: TaskError) -> TaskError {
        let id = report.task_id;
        error!("task_id={id} failed: {err}");
        report.state = TaskState::Failed { error: err.clone() };
        report.progress = self.store.get(&id);
        report.finished = now_rfc3339();
        self.write_index(&report);
        self.set_state(&id, report.state.clone());
        self.apply_retention(units);
        err
    }

    fn set_state(&self, id: &TaskId, state: TaskState) {
        let mut tasks = lock(&self.tasks);
        if let Some(entry) = tasks.get_mut(id) {
            if entry.state.is_terminal() {
                return;
            }
            debug!("task_id={id} state {} -> {}", entry.state.label(), state.label());
            entry.state = state;
        }
    }

    fn publish(&self, id: &TaskId, pct: u8) {
        if let Err(e) = self.store.update(id, pct) {
            warn!("task_id={id} cannot publish progress {pct}: {e:#}");
        } else {
            debug!("task_id={id} progress={pct}");
        }
    }

    fn write_index(&self, report: &TaskReport) {
        if !self.cfg.output.write_index_json {
            return;
        }
        if let Err(e) = report.write(&index_path(&self.cfg, &report.task_id)) {
            warn!("task_id={} {e:#}", report.task_id);
        }
    }

    fn apply_retention(&self, units: &[InputUnit]) {
        if self.cfg.global.keep_inputs {
            return;
        }
        for unit in units {
            if let Err(e) = std::fs::remove_file(&unit.path) {
                debug!("cannot remove input {}: {e}", unit.path.display());
            }
        }
    }
}

fn unit_reports(units: &[InputUnit], outcomes: &[Option<UnitOutcome>]) -> Vec<UnitReport> {
    units
        .iter()
        .zip(outcomes)
        .map(|(unit, outcome)| {
            let (attempted, ok, output, error) = match outcome {
                Some(UnitOutcome::Converted(r)) => (true, true, Some(r.output.name.clone()), None),
                Some(UnitOutcome::Failed(t)) => (true, false, None, Some(t.reason.clone())),
                None => (false, false, None, None),
            };
            UnitReport {
                name: unit.name.clone(),
                original_name: unit.original_name.clone(),
                weight: unit.weight,
                attempted,
                ok,
                output,
                error,
            }
        })
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
