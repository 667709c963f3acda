/// `scripting/source.rs` — where extension scripts come from
///
/// The host never touches the filesystem directly; it asks a `ScriptSource`
/// to map an extension name to a path, to check that path, and to read it.
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf, MAIN_SEPARATOR},
};

/// Marks the start of debug information appended to compiled graph names.
pub const DEBUG_INFO_MARK: char = '\u{1}';

pub trait ScriptSource: Send {
    /// Deterministic path of the script implementing `name`.
    fn locate(&self, name: &str) -> PathBuf;

    fn exists(&self, path: &Path) -> bool;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Suffix appended to extension and graph names.
    fn suffix(&self) -> &str;
}

// ── DirectorySource ───────────────────────────────────────────────────────────

/// Scripts live in one directory as `<name><suffix>`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    suffix: String,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
        }
    }
}

impl ScriptSource for DirectorySource {
    fn locate(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{}", self.suffix))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn suffix(&self) -> &str {
        &self.suffix
    }
}

// ── MemorySource ──────────────────────────────────────────────────────────────

/// In-memory scripts keyed by path, laid out like a `DirectorySource`.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    dir: PathBuf,
    suffix: String,
    files: HashMap<PathBuf, Vec<u8>>,
}

impl MemorySource {
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
            files: HashMap::new(),
        }
    }

    /// Add the script for extension `name`.
    pub fn with_extension(mut self, name: &str, source: &str) -> Self {
        let path = self.locate(name);
        self.files.insert(path, source.as_bytes().to_vec());
        self
    }

    /// Add a script at an explicit path.
    pub fn with_file(mut self, path: impl Into<PathBuf>, source: &str) -> Self {
        self.files.insert(path.into(), source.as_bytes().to_vec());
        self
    }
}

impl ScriptSource for MemorySource {
    fn locate(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}{}", self.suffix))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn suffix(&self) -> &str {
        &self.suffix
    }
}

// ── Main extension path ───────────────────────────────────────────────────────

/// Path of the script attached to the main graph of a compiled graph file.
///
/// `<dir of graph_file>/<main graph name><suffix>`, where the graph name loses
/// any debug-info suffix and `:` separators become path separators.
pub fn main_extension_path(graph_file: &Path, main_graph: &str, suffix: &str) -> PathBuf {
    let name = match main_graph.find(DEBUG_INFO_MARK) {
        Some(cut) => &main_graph[..cut],
        None => main_graph,
    };
    let relative = name.replace(':', &MAIN_SEPARATOR.to_string());
    let dir = graph_file.parent().unwrap_or_else(|| Path::new(""));
    dir.join(format!("{relative}{suffix}"))
}
