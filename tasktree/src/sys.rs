// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Collaborator seams for everything the engine does against the
//! outside world, so scheduling and freshness logic is testable
//! without touching a real filesystem or spawning real processes.

use std::{
    io,
    io::Read,
    path::{Path, PathBuf},
    process, thread,
};

use chrono::{DateTime, Utc};
use fs_err as fs;

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    fn now_unix(&self) -> i64 {
        self.now().timestamp()
    }
}

pub trait Environment {
    fn get(&self, name: &str) -> Option<String>;

    /// Snapshot of the whole process environment, used as the base of
    /// every spawned command's environment
    fn vars(&self) -> Vec<(String, String)>;
}

pub trait FileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    fn write(&self, path: &Path, contents: &str) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn mtime_ns(&self, path: &Path) -> io::Result<u64>;
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError>;
    fn make_executable(&self, path: &Path) -> io::Result<()>;
    fn temp_dir(&self) -> PathBuf;
}

/// What to do with one stdio stream of a spawned command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioPolicy {
    /// Pass through to our own stream
    Stream,
    /// Collect into the spawn output
    Capture,
    /// Silence entirely
    Discard,
}

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    /// Full environment of the child; the parent environment is not
    /// implicitly inherited
    pub env: Vec<(String, String)>,
    pub stdout: StdioPolicy,
    pub stderr: StdioPolicy,
}

impl SpawnRequest {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            current_dir: None,
            env: vec![],
            stdout: StdioPolicy::Stream,
            stderr: StdioPolicy::Stream,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOutput {
    /// Exit code, `None` when the child was stopped by a signal
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl SpawnOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub trait ProcessSpawner {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnOutput>;
}

/// The collaborator bundle handed through the pipeline
#[derive(Clone, Copy)]
pub struct Sys<'a> {
    pub clock: &'a dyn Clock,
    pub env: &'a dyn Environment,
    pub fs: &'a dyn FileSystem,
    pub spawner: &'a dyn ProcessSpawner,
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct OsEnvironment;

impl Environment for OsEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn vars(&self) -> Vec<(String, String)> {
        std::env::vars().collect()
    }
}

pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        fs::write(path, contents)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn mtime_ns(&self, path: &Path) -> io::Result<u64> {
        let modified = fs::metadata(path)?.modified()?;
        let since_epoch = modified
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(since_epoch.as_nanos() as u64)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
        Ok(glob::glob(pattern)?.flatten().collect())
    }

    fn make_executable(&self, path: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        }
        #[cfg(not(unix))]
        {
            let _ = path;
        }
        Ok(())
    }

    fn temp_dir(&self) -> PathBuf {
        std::env::temp_dir()
    }
}

pub struct OsSpawner;

impl ProcessSpawner for OsSpawner {
    fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnOutput> {
        let stdio = |policy: StdioPolicy| match policy {
            StdioPolicy::Stream => process::Stdio::inherit(),
            StdioPolicy::Capture => process::Stdio::piped(),
            StdioPolicy::Discard => process::Stdio::null(),
        };

        let mut command = process::Command::new(&request.program);
        command
            .args(&request.args)
            .env_clear()
            .envs(request.env.iter().cloned())
            .stdin(process::Stdio::inherit())
            .stdout(stdio(request.stdout))
            .stderr(stdio(request.stderr));

        if let Some(dir) = &request.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;

        // Drain captured pipes off-thread so neither can fill up and
        // deadlock the child
        let stdout_pipe = child.stdout.take().map(collect);
        let stderr_pipe = child.stderr.take().map(collect);

        let status = child.wait()?;

        let stdout = stdout_pipe.map(join_collected).transpose()?.unwrap_or_default();
        let stderr = stderr_pipe.map(join_collected).transpose()?.unwrap_or_default();

        Ok(SpawnOutput {
            code: status.code(),
            stdout,
            stderr,
        })
    }
}

fn collect<R>(mut pipe: R) -> thread::JoinHandle<io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buffer = vec![];
        pipe.read_to_end(&mut buffer)?;
        Ok(buffer)
    })
}

fn join_collected(handle: thread::JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "output reader panicked"))?
}

#[cfg(test)]
pub mod testing {
    use std::{
        cell::{Cell, RefCell},
        collections::BTreeMap,
    };

    use super::*;

    pub struct FakeClock {
        now_unix: Cell<i64>,
    }

    impl FakeClock {
        pub fn at(now_unix: i64) -> Self {
            Self {
                now_unix: Cell::new(now_unix),
            }
        }

        pub fn advance(&self, seconds: i64) {
            self.now_unix.set(self.now_unix.get() + seconds);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            DateTime::from_timestamp(self.now_unix.get(), 0).expect("valid fake timestamp")
        }
    }

    #[derive(Default)]
    pub struct FakeEnvironment {
        vars: RefCell<BTreeMap<String, String>>,
    }

    impl FakeEnvironment {
        pub fn with(vars: impl IntoIterator<Item = (&'static str, &'static str)>) -> Self {
            Self {
                vars: RefCell::new(
                    vars.into_iter()
                        .map(|(k, v)| (k.to_owned(), v.to_owned()))
                        .collect(),
                ),
            }
        }

        pub fn set(&self, name: &str, value: &str) {
            self.vars.borrow_mut().insert(name.to_owned(), value.to_owned());
        }
    }

    impl Environment for FakeEnvironment {
        fn get(&self, name: &str) -> Option<String> {
            self.vars.borrow().get(name).cloned()
        }

        fn vars(&self) -> Vec<(String, String)> {
            self.vars.borrow().clone().into_iter().collect()
        }
    }

    #[derive(Debug, Clone)]
    struct FakeFile {
        contents: String,
        mtime_ns: u64,
    }

    #[derive(Default)]
    pub struct FakeFileSystem {
        files: RefCell<BTreeMap<PathBuf, FakeFile>>,
    }

    impl FakeFileSystem {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add(&self, path: impl Into<PathBuf>, contents: &str, mtime_ns: u64) {
            self.files.borrow_mut().insert(
                path.into(),
                FakeFile {
                    contents: contents.to_owned(),
                    mtime_ns,
                },
            );
        }

        pub fn touch(&self, path: impl Into<PathBuf>, mtime_ns: u64) {
            let path = path.into();
            let mut files = self.files.borrow_mut();
            let file = files.entry(path).or_insert(FakeFile {
                contents: String::new(),
                mtime_ns,
            });
            file.mtime_ns = mtime_ns;
        }

        pub fn contents(&self, path: impl Into<PathBuf>) -> Option<String> {
            self.files.borrow().get(&path.into()).map(|f| f.contents.clone())
        }
    }

    impl FileSystem for FakeFileSystem {
        fn read_to_string(&self, path: &Path) -> io::Result<String> {
            self.files
                .borrow()
                .get(path)
                .map(|f| f.contents.clone())
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{path:?} not found")))
        }

        fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
            self.files.borrow_mut().insert(
                path.to_path_buf(),
                FakeFile {
                    contents: contents.to_owned(),
                    mtime_ns: 0,
                },
            );
            Ok(())
        }

        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            let file = self
                .files
                .borrow_mut()
                .remove(from)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{from:?} not found")))?;
            self.files.borrow_mut().insert(to.to_path_buf(), file);
            Ok(())
        }

        fn remove_file(&self, path: &Path) -> io::Result<()> {
            self.files
                .borrow_mut()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{path:?} not found")))
        }

        fn exists(&self, path: &Path) -> bool {
            self.files.borrow().contains_key(path)
        }

        fn mtime_ns(&self, path: &Path) -> io::Result<u64> {
            self.files
                .borrow()
                .get(path)
                .map(|f| f.mtime_ns)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{path:?} not found")))
        }

        fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
            let pattern = glob::Pattern::new(pattern)?;

            Ok(self
                .files
                .borrow()
                .keys()
                .filter(|path| pattern.matches_path(path))
                .cloned()
                .collect())
        }

        fn make_executable(&self, _path: &Path) -> io::Result<()> {
            Ok(())
        }

        fn temp_dir(&self) -> PathBuf {
            PathBuf::from("/tmp")
        }
    }

    type SpawnHandler = Box<dyn Fn(&SpawnRequest) -> io::Result<SpawnOutput>>;

    /// Records every spawn request and answers each with a scripted
    /// handler
    pub struct FakeSpawner {
        pub requests: RefCell<Vec<SpawnRequest>>,
        handler: SpawnHandler,
    }

    impl FakeSpawner {
        pub fn ok() -> Self {
            Self::with(|_| Ok(SpawnOutput {
                code: Some(0),
                ..Default::default()
            }))
        }

        pub fn with(handler: impl Fn(&SpawnRequest) -> io::Result<SpawnOutput> + 'static) -> Self {
            Self {
                requests: RefCell::new(vec![]),
                handler: Box::new(handler),
            }
        }
    }

    impl ProcessSpawner for FakeSpawner {
        fn spawn(&self, request: &SpawnRequest) -> io::Result<SpawnOutput> {
            self.requests.borrow_mut().push(request.clone());
            (self.handler)(request)
        }
    }
}
