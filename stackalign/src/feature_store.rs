use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

use crate::interest_point::InterestPoint;

/// File name of the persisted point array inside a key's directory.
const DETECTIONS_FILE: &str = "dog-detections.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("serializing points: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persists per-channel interest point clouds under a root directory so
/// later runs can reuse them instead of re-extracting.
///
/// Each key (conventionally `<stack id>/<channel>`) maps to one JSON file.
/// Saving overwrites any prior data entirely (delete then create, no
/// incremental append), and an empty point set is never persisted, so
/// "no stored data" and "stored empty set" are indistinguishable by design.
/// Loading a missing or unreadable key reports "absent" and the caller
/// falls back to recomputation. The store is written once by a single
/// writer at the end of aggregation; concurrent readers are fine.
#[derive(Debug, Clone)]
pub struct FeatureStore {
    root: PathBuf,
}

impl FeatureStore {
    pub fn new(root: impl Into<PathBuf>) -> FeatureStore {
        FeatureStore { root: root.into() }
    }

    fn detections_path(&self, key: &str) -> PathBuf {
        self.root.join(key).join(DETECTIONS_FILE)
    }

    /// Saves a point cloud under `key`, replacing any previous data. An
    /// empty cloud removes the stored data instead of writing an empty
    /// array.
    pub fn save(&self, key: &str, points: &[InterestPoint]) -> Result<(), StoreError> {
        let path = self.detections_path(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        if points.is_empty() {
            info!("not persisting empty point set for '{key}'");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_vec(points)?)?;
        info!("saved {} points for '{key}'", points.len());
        Ok(())
    }

    /// Loads the point cloud stored under `key`, or `None` if nothing
    /// usable is stored. Corrupt data is reported as a warning and treated
    /// as absent.
    pub fn load(&self, key: &str) -> Option<Vec<InterestPoint>> {
        let path = self.detections_path(key);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(points) => Some(points),
            Err(e) => {
                warn!("stored points for '{key}' are unreadable, recomputing: {e}");
                None
            }
        }
    }

    /// Whether a point cloud is stored under `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.detections_path(key).exists()
    }

    /// Removes the data stored under `key`, if any.
    pub fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.detections_path(key);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(n: usize) -> Vec<InterestPoint> {
        (0..n)
            .map(|i| InterestPoint::with_intensity(i, [i as f64, 2.0 * i as f64, 0.5], 0.1))
            .collect()
    }

    #[test]
    fn save_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path());
        let p = points(5);
        store.save("Pos001/ChA", &p).unwrap();
        assert!(store.exists("Pos001/ChA"));
        assert_eq!(store.load("Pos001/ChA").unwrap(), p);
    }

    #[test]
    fn save_overwrites_prior_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path());
        store.save("k", &points(5)).unwrap();
        store.save("k", &points(2)).unwrap();
        assert_eq!(store.load("k").unwrap().len(), 2);
    }

    #[test]
    fn empty_set_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path());
        store.save("k", &[]).unwrap();
        assert!(!store.exists("k"));
        assert!(store.load("k").is_none());

        // saving empty over existing data removes it
        store.save("k", &points(3)).unwrap();
        store.save("k", &[]).unwrap();
        assert!(!store.exists("k"));
    }

    #[test]
    fn corrupt_data_loads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path());
        store.save("k", &points(3)).unwrap();
        fs::write(store.detections_path("k"), b"not json").unwrap();
        assert!(store.load("k").is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::new(dir.path());
        store.save("k", &points(1)).unwrap();
        store.remove("k").unwrap();
        assert!(!store.exists("k"));
        store.remove("k").unwrap();
    }
}
