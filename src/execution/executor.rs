//! Executor Interface
//!
//! An [`Executor`] runs one process per `execute` call:
//!
//! 1. Stage inputs into a fresh staging directory
//! 2. Render the script and write it into the directory
//! 3. Run it on the backend and wait for completion
//! 4. Resolve the declared outputs
//!
//! Each stage's failure short-circuits the rest. Nothing is retried; the
//! staging directory of a failed execution is kept for inspection.
//!
//! Backends only implement [`Executor::run`]; the sequence itself is the
//! provided [`Executor::execute`].

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use log::{debug, error, info};

use super::cluster::ClusterRunner;
use super::local::LocalRunner;
use super::render::{render, RenderedScript};
use super::slurm::SlurmScheduler;
use crate::error::{ConfigError, ExecutionError, StagingError, UndeclaredOutput};
use crate::monitoring::{ExecutionLog, LogEvent, ResourceUsage};
use crate::process::ProcessSpec;
use crate::staging::{StagingDirectory, StagingManager, StagingMode};

/// Bytes of each captured stream attached to a [`RunError`](crate::error::RunError).
pub const DIAGNOSTIC_TAIL_BYTES: u64 = 4096;

/// Outcome of a successful execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    process: String,
    outputs: IndexMap<String, PathBuf>,
    staging_dir: PathBuf,
    elapsed: Duration,
    usage: Option<ResourceUsage>,
}

impl ExecutionResult {
    /// Resolved output paths, in declaration order.
    pub fn outputs(&self) -> impl ExactSizeIterator<Item = &Path> {
        self.outputs.values().map(PathBuf::as_path)
    }

    /// Resolved path of the output declared under `key`.
    pub fn output(&self, key: &str) -> Result<&Path, UndeclaredOutput> {
        self.outputs
            .get(key)
            .map(PathBuf::as_path)
            .ok_or_else(|| UndeclaredOutput {
                process: self.process.clone(),
                key: key.to_string(),
            })
    }

    /// Staging directory the process ran in.
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Wall time from staging to output resolution.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Resource usage, when the backend measures it.
    pub fn usage(&self) -> Option<ResourceUsage> {
        self.usage
    }

    /// Splits into `(ordered outputs, staging directory)`.
    pub fn into_parts(self) -> (Vec<PathBuf>, PathBuf) {
        (self.outputs.into_values().collect(), self.staging_dir)
    }
}

/// Runs processes against a backend.
pub trait Executor {
    /// Mode used for the next staging.
    fn staging_mode(&self) -> StagingMode;

    /// Changes the mode for subsequent executions.
    fn set_staging_mode(&mut self, mode: StagingMode);

    /// Builder form of [`set_staging_mode`](Self::set_staging_mode).
    fn with_staging_mode(mut self, mode: StagingMode) -> Self
    where
        Self: Sized,
    {
        self.set_staging_mode(mode);
        self
    }

    fn staging_manager(&self) -> &StagingManager;

    /// Stages the inputs of `process` under this executor's mode.
    fn stage(&self, process: &ProcessSpec) -> Result<StagingDirectory, StagingError> {
        let mode = effective_staging_mode(process, self.staging_mode());
        self.staging_manager().stage(process, mode)
    }

    /// Runs the written script to completion on the backend.
    ///
    /// Returns measured resource usage when the backend has any.
    fn run(
        &self,
        process: &ProcessSpec,
        staging: &StagingDirectory,
        script: &RenderedScript,
        log: &mut ExecutionLog,
    ) -> Result<Option<ResourceUsage>, ExecutionError>;

    /// Resolves the declared outputs inside `staging`.
    fn resolve_outputs(
        &self,
        process: &ProcessSpec,
        staging: &StagingDirectory,
    ) -> Result<Vec<PathBuf>, ExecutionError> {
        resolve_outputs(process, staging)
    }

    /// Stages, renders, runs and resolves `process`.
    fn execute(&self, process: &ProcessSpec) -> Result<ExecutionResult, ExecutionError> {
        let started = Instant::now();
        info!("Executing process '{}'", process.name());

        let staging = self.stage(process)?;
        let mut log = ExecutionLog::open(staging.path());
        log.record(
            LogEvent::Staged,
            format!("{} inputs ({})", staging.entries().len(), staging.mode()),
        );

        match run_staged(self, process, &staging, &mut log) {
            Ok((outputs, usage)) => {
                log.record(LogEvent::Completed, format!("{} outputs", outputs.len()));
                info!(
                    "Process '{}' completed in {:.2}s",
                    process.name(),
                    started.elapsed().as_secs_f64()
                );

                Ok(ExecutionResult {
                    process: process.name().to_string(),
                    outputs: process.outputs().keys().cloned().zip(outputs).collect(),
                    staging_dir: staging.path().to_path_buf(),
                    elapsed: started.elapsed(),
                    usage,
                })
            }
            Err(e) => {
                let event = match e {
                    ExecutionError::Cancelled { .. } => LogEvent::Cancelled,
                    _ => LogEvent::Failed,
                };
                log.record(event, e.to_string());
                error!("Process '{}' failed: {}", process.name(), e);
                Err(e)
            }
        }
    }
}

/// Everything after staging.
fn run_staged<E: Executor + ?Sized>(
    executor: &E,
    process: &ProcessSpec,
    staging: &StagingDirectory,
    log: &mut ExecutionLog,
) -> Result<(Vec<PathBuf>, Option<ResourceUsage>), ExecutionError> {
    let script = render(process, staging)?;
    prepare_output_directories(process, staging)?;
    let path = script
        .write_to(staging.path())
        .map_err(|e| ExecutionError::io("failed to write script", e))?;
    log.record(LogEvent::Rendered, path.display().to_string());

    let usage = executor.run(process, staging, &script, log)?;
    let outputs = executor.resolve_outputs(process, staging)?;
    Ok((outputs, usage))
}

/// Mode actually used for `process`.
///
/// Containers that only see the bind-mounted staging directory cannot
/// follow links to the originals, so they always get copies.
pub fn effective_staging_mode(process: &ProcessSpec, mode: StagingMode) -> StagingMode {
    match process.container() {
        Some(container) if container.is_isolated_filesystem() && mode != StagingMode::Copy => {
            debug!(
                "Process '{}' runs in {}, staging with copies",
                process.name(),
                container
            );
            StagingMode::Copy
        }
        _ => mode,
    }
}

/// Creates parent directories of nested outputs so scripts can write them.
fn prepare_output_directories(
    process: &ProcessSpec,
    staging: &StagingDirectory,
) -> Result<(), ExecutionError> {
    for relative in process.outputs().values() {
        if let Some(parent) = staging.path().join(relative).parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ExecutionError::io(
                    format!("failed to create output directory {}", parent.display()),
                    e,
                )
            })?;
        }
    }
    Ok(())
}

/// Resolves every declared output of `process` inside `staging`.
///
/// Fails on the first output, in declaration order, that is missing or
/// unreadable; never returns a partial list.
pub fn resolve_outputs(
    process: &ProcessSpec,
    staging: &StagingDirectory,
) -> Result<Vec<PathBuf>, ExecutionError> {
    let mut resolved = Vec::with_capacity(process.outputs().len());

    for (key, relative) in process.outputs() {
        let path = staging.path().join(relative);

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ExecutionError::OutputMissing {
                    key: key.clone(),
                    path,
                })
            }
            Err(e) => {
                return Err(ExecutionError::io(
                    format!("output '{}' at {} is not accessible", key, path.display()),
                    e,
                ))
            }
        };

        let readable = if metadata.is_dir() {
            fs::read_dir(&path).map(|_| ())
        } else {
            File::open(&path).map(|_| ())
        };
        readable.map_err(|e| {
            ExecutionError::io(
                format!("output '{}' at {} is not readable", key, path.display()),
                e,
            )
        })?;

        debug!("Resolved output '{}': {}", key, path.display());
        resolved.push(path);
    }

    Ok(resolved)
}

/// Reads the last few KiB of a captured stream. Missing files read as empty.
pub(crate) fn read_tail(path: &Path) -> String {
    let mut tail = Vec::new();
    let read = File::open(path).and_then(|mut file| {
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(DIAGNOSTIC_TAIL_BYTES)))?;
        file.read_to_end(&mut tail)
    });

    match read {
        Ok(_) => String::from_utf8_lossy(&tail).into_owned(),
        Err(_) => String::new(),
    }
}

/// An executor whose backend is chosen at construction time.
pub enum GenericExecutor {
    Local(LocalRunner),
    Cluster(Box<ClusterRunner<SlurmScheduler>>),
}

impl GenericExecutor {
    /// Backend name, as accepted by [`executor`].
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Cluster(_) => "slurm",
        }
    }
}

impl Executor for GenericExecutor {
    fn staging_mode(&self) -> StagingMode {
        match self {
            Self::Local(runner) => runner.staging_mode(),
            Self::Cluster(runner) => runner.staging_mode(),
        }
    }

    fn set_staging_mode(&mut self, mode: StagingMode) {
        match self {
            Self::Local(runner) => runner.set_staging_mode(mode),
            Self::Cluster(runner) => runner.set_staging_mode(mode),
        }
    }

    fn staging_manager(&self) -> &StagingManager {
        match self {
            Self::Local(runner) => runner.staging_manager(),
            Self::Cluster(runner) => runner.staging_manager(),
        }
    }

    fn run(
        &self,
        process: &ProcessSpec,
        staging: &StagingDirectory,
        script: &RenderedScript,
        log: &mut ExecutionLog,
    ) -> Result<Option<ResourceUsage>, ExecutionError> {
        match self {
            Self::Local(runner) => runner.run(process, staging, script, log),
            Self::Cluster(runner) => runner.run(process, staging, script, log),
        }
    }
}

impl From<LocalRunner> for GenericExecutor {
    fn from(runner: LocalRunner) -> Self {
        Self::Local(runner)
    }
}

impl From<ClusterRunner<SlurmScheduler>> for GenericExecutor {
    fn from(runner: ClusterRunner<SlurmScheduler>) -> Self {
        Self::Cluster(Box::new(runner))
    }
}

/// Constructs a fresh executor by name.
///
/// | Name                 | Executor                            |
/// |----------------------|-------------------------------------|
/// | `default`, `local`   | [`LocalRunner`], in-place staging   |
/// | `cluster`, `slurm`   | [`ClusterRunner`] on Slurm          |
///
/// Every call returns an independent instance.
pub fn executor(name: &str) -> Result<GenericExecutor, ConfigError> {
    match name.trim().to_ascii_lowercase().as_str() {
        "default" | "local" => Ok(LocalRunner::new()
            .with_staging_mode(StagingMode::InPlace)
            .into()),
        "cluster" | "slurm" => Ok(ClusterRunner::new(SlurmScheduler::new())
            .with_staging_mode(StagingMode::InPlace)
            .into()),
        _ => Err(ConfigError::UnknownExecutor(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Container;
    use crate::staging::{LOG_FILE, SCRIPT_FILE};
    use std::collections::HashSet;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    fn local(work: &TempDir, mode: StagingMode) -> LocalRunner {
        LocalRunner::new()
            .with_staging_manager(StagingManager::new(work.path()))
            .with_staging_mode(mode)
    }

    fn copy_process(data: &TempDir) -> ProcessSpec {
        let input = data.path().join("a.txt");
        fs::write(&input, "X").unwrap();

        ProcessSpec::builder("copy")
            .input("a", &input)
            .output("b", "b.txt")
            .script("cp $a $b")
            .build()
            .unwrap()
    }

    #[test]
    fn test_copy_scenario() {
        let data = tempdir().unwrap();
        let work = tempdir().unwrap();
        let result = local(&work, StagingMode::Copy)
            .execute(&copy_process(&data))
            .unwrap();

        let outputs: Vec<&Path> = result.outputs().collect();
        assert_eq!(outputs.len(), 1);
        assert_eq!(fs::read_to_string(outputs[0]).unwrap(), "X");
        assert!(outputs[0].starts_with(result.staging_dir()));
    }

    #[test]
    fn test_exit_code_scenario() {
        let work = tempdir().unwrap();
        let process = ProcessSpec::builder("fail").script("exit 3").build().unwrap();

        let error = local(&work, StagingMode::Copy).execute(&process).unwrap_err();
        assert!(matches!(error, ExecutionError::Run(_)));
        assert_eq!(error.exit_code(), Some(3));
    }

    #[test]
    fn test_missing_output_names_key() {
        let work = tempdir().unwrap();
        let process = ProcessSpec::builder("lazy")
            .output("first", "first.txt")
            .output("report", "report.txt")
            .script("touch first.txt")
            .build()
            .unwrap();

        let error = local(&work, StagingMode::Copy).execute(&process).unwrap_err();
        match error {
            ExecutionError::OutputMissing { key, path } => {
                assert_eq!(key, "report");
                assert!(path.ends_with("report.txt"));
            }
            other => panic!("expected missing output, got {other:?}"),
        }
    }

    #[test]
    fn test_outputs_follow_declaration_order() {
        let work = tempdir().unwrap();
        let process = ProcessSpec::builder("many")
            .output("z", "z.txt")
            .output("a", "nested/a.txt")
            .output("m", "m.txt")
            .script("echo 1 > $z; echo 2 > $a; echo 3 > $m")
            .build()
            .unwrap();

        let result = local(&work, StagingMode::Copy).execute(&process).unwrap();
        let names: Vec<String> = result
            .outputs()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["z.txt", "a.txt", "m.txt"]);

        let (outputs, staging_dir) = result.into_parts();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[1], staging_dir.join("nested/a.txt"));
    }

    #[test]
    fn test_undeclared_output_is_caller_error() {
        let data = tempdir().unwrap();
        let work = tempdir().unwrap();
        let result = local(&work, StagingMode::Copy)
            .execute(&copy_process(&data))
            .unwrap();

        assert!(result.output("b").is_ok());
        let error = result.output("c").unwrap_err();
        assert_eq!(error.key, "c");
        assert_eq!(error.process, "copy");
    }

    #[test]
    fn test_concurrent_executions_are_isolated() {
        let data = tempdir().unwrap();
        let work = tempdir().unwrap();
        let runner = local(&work, StagingMode::InPlace);
        let process = copy_process(&data);

        let dirs: Vec<PathBuf> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| runner.execute(&process).unwrap()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap().staging_dir().to_path_buf())
                .collect()
        });

        let unique: HashSet<&PathBuf> = dirs.iter().collect();
        assert_eq!(unique.len(), 8);
        for dir in &dirs {
            let entries = fs::read_dir(dir.join("inputs")).unwrap().count();
            assert_eq!(entries, 1);
            assert_eq!(fs::read_to_string(dir.join("b.txt")).unwrap(), "X");
        }
    }

    #[test]
    fn test_staging_mode_applies_to_later_calls() {
        let data = tempdir().unwrap();
        let work = tempdir().unwrap();
        let mut runner = local(&work, StagingMode::Copy);
        let process = copy_process(&data);

        let first = runner.stage(&process).unwrap();
        runner.set_staging_mode(StagingMode::InPlace);
        let second = runner.stage(&process).unwrap();

        assert_eq!(first.mode(), StagingMode::Copy);
        assert_eq!(second.mode(), StagingMode::InPlace);
    }

    #[test]
    fn test_isolated_container_forces_copy() {
        let process = ProcessSpec::builder("boxed")
            .script("true")
            .container(Container::Docker("ubuntu:22.04".to_string()))
            .build()
            .unwrap();
        assert_eq!(
            effective_staging_mode(&process, StagingMode::InPlace),
            StagingMode::Copy
        );

        let conda = ProcessSpec::builder("env")
            .script("true")
            .container(Container::Conda("samtools".to_string()))
            .build()
            .unwrap();
        assert_eq!(
            effective_staging_mode(&conda, StagingMode::InPlace),
            StagingMode::InPlace
        );
    }

    #[test]
    fn test_staging_directory_is_retained() {
        let data = tempdir().unwrap();
        let work = tempdir().unwrap();
        let result = local(&work, StagingMode::Copy)
            .execute(&copy_process(&data))
            .unwrap();

        let dir = result.staging_dir();
        assert!(dir.join(SCRIPT_FILE).is_file());
        let log = fs::read_to_string(dir.join(LOG_FILE)).unwrap();
        assert!(log.contains("[STAGED]"));
        assert!(log.contains("[COMPLETED]"));
    }

    #[test]
    fn test_render_error_short_circuits() {
        let work = tempdir().unwrap();
        let process = ProcessSpec::builder("empty").script("   ").build().unwrap();

        let error = local(&work, StagingMode::Copy).execute(&process).unwrap_err();
        assert!(matches!(error, ExecutionError::Render(_)));
    }

    #[test]
    fn test_staging_error_surfaces() {
        let work = tempdir().unwrap();
        let process = ProcessSpec::builder("missing")
            .input("a", "/nonexistent/input.txt")
            .script("true")
            .build()
            .unwrap();

        let error = local(&work, StagingMode::Copy).execute(&process).unwrap_err();
        assert!(matches!(error, ExecutionError::Staging(StagingError::MissingInput { .. })));
    }

    #[test]
    fn test_resolve_outputs_directly() {
        let work = tempdir().unwrap();
        let process = ProcessSpec::builder("r")
            .output("dir", "results")
            .script("true")
            .build()
            .unwrap();
        let staging = StagingManager::new(work.path())
            .stage(&process, StagingMode::Copy)
            .unwrap();

        assert!(matches!(
            resolve_outputs(&process, &staging),
            Err(ExecutionError::OutputMissing { .. })
        ));
        fs::create_dir(staging.path().join("results")).unwrap();
        assert_eq!(
            resolve_outputs(&process, &staging).unwrap(),
            vec![staging.path().join("results")]
        );
    }

    #[test]
    fn test_read_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.log");
        let mut content = "a".repeat(10_000);
        content.push_str("END");
        fs::write(&path, &content).unwrap();

        let tail = read_tail(&path);
        assert_eq!(tail.len() as u64, DIAGNOSTIC_TAIL_BYTES);
        assert!(tail.ends_with("END"));
        assert_eq!(read_tail(&dir.path().join("missing")), "");
    }

    #[test]
    fn test_executor_factory() {
        let default = executor("default").unwrap();
        assert_eq!(default.backend(), "local");
        assert_eq!(default.staging_mode(), StagingMode::InPlace);

        assert_eq!(executor("local").unwrap().backend(), "local");
        assert_eq!(executor("slurm").unwrap().backend(), "slurm");
        assert_eq!(executor("Cluster").unwrap().backend(), "slurm");
        assert_eq!(
            executor("kubernetes").err(),
            Some(ConfigError::UnknownExecutor("kubernetes".to_string()))
        );
    }

    #[test]
    fn test_factory_returns_independent_instances() {
        let mut first = executor("default").unwrap();
        let second = executor("default").unwrap();

        first.set_staging_mode(StagingMode::Copy);
        assert_eq!(first.staging_mode(), StagingMode::Copy);
        assert_eq!(second.staging_mode(), StagingMode::InPlace);
    }
}
