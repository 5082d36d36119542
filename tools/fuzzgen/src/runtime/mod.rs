use crate::errors::FuzzError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, FuzzError>;
    fn wait(&self, handle: u64) -> Result<ProcessOutput, FuzzError>;
    fn kill(&self, handle: u64) -> Result<(), FuzzError>;

    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, FuzzError> {
        let handle = self.spawn(request)?;
        self.wait(handle)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, FuzzError>;
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, FuzzError>;
    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FuzzError>;
    fn create_dir_all(&self, path: &Path) -> Result<(), FuzzError>;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), FuzzError>;
}

fn guard<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, FuzzError> {
        std::fs::read_to_string(path).map_err(|e| FuzzError::file_access(path, e))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, FuzzError> {
        std::fs::read(path).map_err(|e| FuzzError::file_access(path, e))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FuzzError> {
        std::fs::write(path, contents).map_err(|e| FuzzError::file_access(path, e))
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FuzzError> {
        std::fs::create_dir_all(path).map_err(|e| FuzzError::file_access(path, e))
    }
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, std::process::Child>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, FuzzError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        cmd.envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| FuzzError::Process(format!("{}: {e}", request.program)))?;
        let mut state = guard(&self.state);
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(handle, child);
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, FuzzError> {
        let child = guard(&self.state).children.remove(&handle);
        let child = child.ok_or_else(|| FuzzError::Process(format!("unknown handle {handle}")))?;
        let output = child
            .wait_with_output()
            .map_err(|e| FuzzError::Process(e.to_string()))?;
        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn kill(&self, handle: u64) -> Result<(), FuzzError> {
        let mut child = guard(&self.state)
            .children
            .remove(&handle)
            .ok_or_else(|| FuzzError::Process(format!("unknown handle {handle}")))?;
        child.kill().map_err(|e| FuzzError::Process(e.to_string()))
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), FuzzError> {
        use std::io::Write;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{line}").map_err(|e| FuzzError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<FuzzError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        let fs = Self::default();
        fs.insert(path, contents);
        fs
    }

    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        guard(&self.files).insert(path.into(), contents.into());
    }

    pub fn set_fail_next(&self, error: FuzzError) {
        *guard(&self.fail_next) = Some(error);
    }

    pub fn created_dirs(&self) -> Vec<PathBuf> {
        guard(&self.dirs).clone()
    }

    fn maybe_fail(&self) -> Result<(), FuzzError> {
        match guard(&self.fail_next).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, FuzzError> {
        let bytes = self.read_bytes(path)?;
        String::from_utf8(bytes).map_err(|e| FuzzError::file_access(path, e))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, FuzzError> {
        self.maybe_fail()?;
        guard(&self.files)
            .get(path)
            .cloned()
            .ok_or_else(|| FuzzError::file_access(path, "missing file"))
    }

    fn write_string(&self, path: &Path, contents: &str) -> Result<(), FuzzError> {
        self.maybe_fail()?;
        guard(&self.files).insert(path.to_path_buf(), contents.as_bytes().to_vec());
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<(), FuzzError> {
        self.maybe_fail()?;
        guard(&self.dirs).push(path.to_path_buf());
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        guard(&self.writes).clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), FuzzError> {
        guard(&self.writes).push(line.to_string());
        Ok(())
    }
}

/// Scripted process runner; each `wait` pops the next queued output.
#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    responses: Arc<Mutex<Vec<Result<ProcessOutput, FuzzError>>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    kills: Arc<Mutex<Vec<u64>>>,
    next_handle: Arc<Mutex<u64>>,
}

impl FakeProcessRunner {
    pub fn push_response(&self, output: Result<ProcessOutput, FuzzError>) {
        guard(&self.responses).push(output);
    }

    pub fn push_exit(&self, exit_code: i32) {
        self.push_response(Ok(ProcessOutput {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
        }));
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        guard(&self.spawned).clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        guard(&self.kills).clone()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, FuzzError> {
        guard(&self.spawned).push(request);
        let mut next = guard(&self.next_handle);
        let handle = *next;
        *next += 1;
        Ok(handle)
    }

    fn wait(&self, _handle: u64) -> Result<ProcessOutput, FuzzError> {
        let mut responses = guard(&self.responses);
        if responses.is_empty() {
            return Err(FuzzError::Process("no fake response queued".to_string()));
        }
        responses.remove(0)
    }

    fn kill(&self, handle: u64) -> Result<(), FuzzError> {
        guard(&self.kills).push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FakeFileSystem, FakeProcessRunner, FileSystem, ProcessRequest, ProcessRunner};
    use crate::errors::FuzzError;
    use std::path::Path;

    #[test]
    fn fake_file_system_round_trips_and_fails_once() {
        let fs = FakeFileSystem::with_file("/a.log", vec![1u8, 2, 3]);
        assert_eq!(fs.read_bytes(Path::new("/a.log")).expect("bytes"), vec![1, 2, 3]);
        fs.set_fail_next(FuzzError::Io("boom".to_string()));
        assert!(fs.read_bytes(Path::new("/a.log")).is_err());
        assert!(fs.read_bytes(Path::new("/a.log")).is_ok());
        assert!(fs.read_to_string(Path::new("/missing")).is_err());
    }

    #[test]
    fn fake_runner_replays_queued_exits_in_order() {
        let runner = FakeProcessRunner::default();
        runner.push_exit(0);
        runner.push_exit(3);
        let request = ProcessRequest {
            program: "harness".to_string(),
            args: Vec::new(),
            env: vec![("FUZZGEN_SESSION".to_string(), "s1".to_string())],
            cwd: None,
        };
        assert_eq!(runner.run(request.clone()).expect("first").exit_code, 0);
        assert_eq!(runner.run(request).expect("second").exit_code, 3);
        assert_eq!(runner.spawned().len(), 2);
        assert!(runner.wait(9).is_err());
    }
}
