use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_domain::{Edge, EnvironmentName, Node};
use tokio::fs;
use tracing::debug;

use crate::error::StateError;
use crate::graph::DependencyGraph;

type StateResult<T> = std::result::Result<T, StateError>;

pub const STATE_FORMAT_VERSION: u32 = 1;

/// Persisted form of a graph for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    /// Incremented on every save.
    pub serial: u64,
    pub environment: EnvironmentName,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl Snapshot {
    #[must_use]
    pub fn from_graph(environment: EnvironmentName, serial: u64, graph: &DependencyGraph) -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            serial,
            environment,
            nodes: graph.nodes().cloned().collect(),
            edges: graph.edges().cloned().collect(),
        }
    }

    /// # Errors
    ///
    /// Returns an error when the persisted nodes and edges do not form a valid graph.
    pub fn to_graph(&self) -> StateResult<DependencyGraph> {
        Ok(DependencyGraph::from_parts(
            self.nodes.clone(),
            self.edges.clone(),
        )?)
    }

    /// The snapshot that follows `previous` holding `graph`.
    #[must_use]
    pub fn next(
        previous: Option<&Self>,
        environment: EnvironmentName,
        graph: &DependencyGraph,
    ) -> Self {
        let serial = previous.map_or(1, |snapshot| snapshot.serial + 1);
        Self::from_graph(environment, serial, graph)
    }
}

/// Where graph snapshots live between runs.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// `Ok(None)` when the environment has never been applied.
    ///
    /// # Errors
    ///
    /// Returns an error when a stored snapshot cannot be read or decoded.
    async fn load(&self, environment: &EnvironmentName) -> StateResult<Option<Snapshot>>;

    /// # Errors
    ///
    /// Returns an error when the snapshot cannot be written.
    async fn save(&self, snapshot: &Snapshot) -> StateResult<()>;
}

/// One JSON file per environment under a state directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn state_path(&self, environment: &EnvironmentName) -> PathBuf {
        self.dir.join(format!("{environment}.json"))
    }

    #[must_use]
    pub fn backup_path(&self, environment: &EnvironmentName) -> PathBuf {
        self.dir.join(format!("{environment}.json.backup"))
    }

    fn temp_path(&self, environment: &EnvironmentName) -> PathBuf {
        self.dir.join(format!(".{environment}.json.tmp"))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, environment: &EnvironmentName) -> StateResult<Option<Snapshot>> {
        let path = self.state_path(environment);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(source) if source.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state snapshot, starting empty");
                return Ok(None);
            }
            Err(source) => return Err(StateError::Read { path, source }),
        };
        let snapshot: Snapshot = serde_json::from_slice(&content).map_err(|source| {
            StateError::Decode {
                path: path.clone(),
                source,
            }
        })?;
        if snapshot.version > STATE_FORMAT_VERSION {
            return Err(StateError::UnsupportedVersion {
                path,
                version: snapshot.version,
            });
        }
        debug!(
            path = %path.display(),
            serial = snapshot.serial,
            nodes = snapshot.nodes.len(),
            "loaded state snapshot"
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &Snapshot) -> StateResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StateError::Write {
                path: self.dir.clone(),
                source,
            })?;

        let environment = &snapshot.environment;
        let path = self.state_path(environment);
        let temp = self.temp_path(environment);
        let content =
            serde_json::to_vec_pretty(snapshot).map_err(|source| StateError::Encode { source })?;
        fs::write(&temp, content)
            .await
            .map_err(|source| StateError::Write {
                path: temp.clone(),
                source,
            })?;

        match fs::copy(&path, self.backup_path(environment)).await {
            Ok(_) => debug!(path = %path.display(), "kept previous state as backup"),
            Err(source) if source.kind() == ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StateError::Write {
                    path: self.backup_path(environment),
                    source,
                });
            }
        }

        fs::rename(&temp, &path)
            .await
            .map_err(|source| StateError::Write {
                path: path.clone(),
                source,
            })?;
        debug!(
            path = %path.display(),
            serial = snapshot.serial,
            nodes = snapshot.nodes.len(),
            "saved state snapshot"
        );
        Ok(())
    }
}

/// Snapshots kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshots: Mutex<BTreeMap<EnvironmentName, Snapshot>>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_snapshots<T>(&self, f: impl FnOnce(&mut BTreeMap<EnvironmentName, Snapshot>) -> T) -> T {
        let mut guard = match self.snapshots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, environment: &EnvironmentName) -> StateResult<Option<Snapshot>> {
        Ok(self.with_snapshots(|snapshots| snapshots.get(environment).cloned()))
    }

    async fn save(&self, snapshot: &Snapshot) -> StateResult<()> {
        self.with_snapshots(|snapshots| {
            snapshots.insert(snapshot.environment.clone(), snapshot.clone());
        });
        Ok(())
    }
}
