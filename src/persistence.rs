//! On-disk layout of the learned state.
//!
//! Every file is JSON. Writes go to a `.tmp` sibling first and are renamed
//! into place, so an interrupted flush never leaves a truncated file behind.
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
};

use log::debug;
use serde::{de::DeserializeOwned, Serialize};

use crate::deep::mlp::{shape_key, WeightsSnapshot};
use crate::error::{BrainError, Result};
use crate::rl::value_store::StoreSnapshot;

/// State -> action-value estimates.
pub const VALUES_FILE: &str = "rewards.json";
/// State -> normalized training targets.
pub const TARGETS_FILE: &str = "targets.json";
/// Ordered training universe.
pub const UNIVERSE_FILE: &str = "states.json";

/// File holding weights for one exact topology, e.g. `weights_101x25_26x5.json`.
#[must_use]
pub fn weights_file_name(shapes: &[(usize, usize)]) -> String {
    format!("weights_{}.json", shape_key(shapes))
}

/// Write the value tables and universe into `dir`, creating it if needed.
///
/// # Errors
///
/// Returns an error if the directory or any file cannot be written.
pub fn save_store(dir: &Path, snapshot: &StoreSnapshot) -> Result<()> {
    ensure_dir(dir)?;
    write_json(&dir.join(VALUES_FILE), &snapshot.values)?;
    write_json(&dir.join(TARGETS_FILE), &snapshot.targets)?;
    write_json(&dir.join(UNIVERSE_FILE), &snapshot.universe)?;
    Ok(())
}

/// Read the value tables and universe from `dir`.
///
/// Returns `Ok(None)` if nothing has been saved there yet.
///
/// # Errors
///
/// Returns an error if some file exists but cannot be read or parsed.
pub fn load_store(dir: &Path) -> Result<Option<StoreSnapshot>> {
    let values_path = dir.join(VALUES_FILE);
    if !values_path.exists() {
        return Ok(None);
    }
    Ok(Some(StoreSnapshot {
        values: read_json(&values_path)?,
        targets: read_json(&dir.join(TARGETS_FILE))?,
        universe: read_json(&dir.join(UNIVERSE_FILE))?,
    }))
}

/// Write weights under the key derived from their shapes.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be written.
pub fn save_weights(dir: &Path, snapshot: &WeightsSnapshot) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let path = dir.join(weights_file_name(&snapshot.shapes()));
    write_json(&path, snapshot)?;
    Ok(path)
}

/// Read weights saved for exactly `shapes`.
///
/// Returns `Ok(None)` if no weights exist for that topology.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_weights(dir: &Path, shapes: &[(usize, usize)]) -> Result<Option<WeightsSnapshot>> {
    let path = dir.join(weights_file_name(shapes));
    match File::open(&path) {
        Ok(file) => Ok(Some(serde_json::from_reader(BufReader::new(file))?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BrainError::io(format!("open {}", path.display()), e)),
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| BrainError::io(format!("create {}", dir.display()), e))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    let tmp_file =
        File::create(&tmp_path).map_err(|e| BrainError::io(format!("create {}", tmp_path.display()), e))?;
    let mut writer = BufWriter::new(tmp_file);
    serde_json::to_writer(&mut writer, value)?;
    writer
        .flush()
        .map_err(|e| BrainError::io(format!("flush {}", tmp_path.display()), e))?;
    drop(writer);
    fs::rename(&tmp_path, path).map_err(|e| BrainError::io(format!("replace {}", path.display()), e))?;
    debug!("Wrote {path:?}");
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| BrainError::io(format!("open {}", path.display()), e))?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use crate::rl::state::State;

    use super::*;

    #[test]
    fn test_store_round_trip() {
        let dir = tempdir().unwrap();
        let s = State::from_bits(vec![1, 0, 1]).unwrap();
        let snapshot = StoreSnapshot {
            values: HashMap::from([(s.clone(), [0.1, 0.2, 0.3, 0.4, 0.5])]),
            targets: HashMap::from([(s.clone(), [0.0, 0.25, 0.5, 0.75, 1.0])]),
            universe: vec![s],
        };
        save_store(dir.path(), &snapshot).unwrap();
        assert_eq!(load_store(dir.path()).unwrap(), Some(snapshot));
    }

    #[test]
    fn test_missing_store_is_none_and_corrupt_store_is_error() {
        let dir = tempdir().unwrap();
        assert_eq!(load_store(dir.path()).unwrap(), None);

        fs::write(dir.path().join(VALUES_FILE), "{not json").unwrap();
        assert!(load_store(dir.path()).is_err());
    }

    #[test]
    fn test_weights_are_keyed_by_shape() {
        let dir = tempdir().unwrap();
        let snapshot = WeightsSnapshot {
            beta: 0.01,
            layers: vec![vec![vec![0.5, -0.5]; 3], vec![vec![0.25]; 3]],
        };
        let path = save_weights(dir.path(), &snapshot).unwrap();
        assert!(path.ends_with("weights_3x2_3x1.json"));
        assert!(!dir.path().join("weights_3x2_3x1.tmp").exists());

        assert_eq!(load_weights(dir.path(), &[(3, 2), (3, 1)]).unwrap(), Some(snapshot));
        assert_eq!(load_weights(dir.path(), &[(4, 2), (3, 1)]).unwrap(), None);
    }
}
