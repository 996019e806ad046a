//! Local replication documents
//!
//! The replica set configuration, the last vote and the node identity are
//! stored as opaque JSON documents. The file store writes each one atomically.

use crate::error::ReplResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Last vote cast by this node in an election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastVote {
    pub term: i64,
    pub candidate_index: i32,
}

/// Key-document storage for replication metadata
pub trait LocalDocumentStore: Send + Sync {
    fn load_config(&self) -> ReplResult<Option<Value>>;
    fn store_config(&self, config: &Value) -> ReplResult<()>;
    fn load_last_vote(&self) -> ReplResult<Option<LastVote>>;
    fn store_last_vote(&self, vote: &LastVote) -> ReplResult<()>;
    fn load_node_id(&self) -> ReplResult<Option<String>>;
    fn store_node_id(&self, node_id: &str) -> ReplResult<()>;
}

const CONFIG_FILE: &str = "replset.config.json";
const LAST_VOTE_FILE: &str = "replset.election.json";
const NODE_ID_FILE: &str = "node.id.json";

/// One JSON file per document under a directory
pub struct JsonFileDocumentStore {
    dir: PathBuf,
}

impl JsonFileDocumentStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> ReplResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(JsonFileDocumentStore { dir })
    }

    fn read<T: for<'de> Deserialize<'de>>(&self, name: &str) -> ReplResult<Option<T>> {
        let path = self.dir.join(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write to a temp file, sync it, then rename over the target
    fn write<T: Serialize>(&self, name: &str, value: &T) -> ReplResult<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{}.tmp", name));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(value)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!("Stored {:?}", path);
        Ok(())
    }
}

impl LocalDocumentStore for JsonFileDocumentStore {
    fn load_config(&self) -> ReplResult<Option<Value>> {
        self.read(CONFIG_FILE)
    }

    fn store_config(&self, config: &Value) -> ReplResult<()> {
        self.write(CONFIG_FILE, config)
    }

    fn load_last_vote(&self) -> ReplResult<Option<LastVote>> {
        self.read(LAST_VOTE_FILE)
    }

    fn store_last_vote(&self, vote: &LastVote) -> ReplResult<()> {
        self.write(LAST_VOTE_FILE, vote)
    }

    fn load_node_id(&self) -> ReplResult<Option<String>> {
        self.read(NODE_ID_FILE)
    }

    fn store_node_id(&self, node_id: &str) -> ReplResult<()> {
        self.write(NODE_ID_FILE, &node_id)
    }
}
