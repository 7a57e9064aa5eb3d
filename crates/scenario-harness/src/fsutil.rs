use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

/// `.<name>.<pid>.<micros>.partial` next to `path`, so the rename below stays
/// on one filesystem.
fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    path.with_file_name(format!(
        ".{}.{}.{}.partial",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}

/// Route file, trial log and manifest writes go through here: readers (the
/// simulator included) see either the old contents or the new, never a prefix.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent)?,
        _ => {}
    }
    let partial = partial_path(path);
    let written = fs::File::create(&partial).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written.and_then(|()| fs::rename(&partial, path)) {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "scenario_harness_{}_{}_{}",
        label,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    ensure_dir(&dir).expect("scratch dir");
    dir
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn atomic_write_replaces_contents_and_leaves_no_temp_files() {
        let root = scratch_dir("atomic");
        let path = root.join("nested").join("out.json");
        atomic_write_json_pretty(&path, &json!({"a": 1})).expect("first write");
        atomic_write_json_pretty(&path, &json!({"a": 2})).expect("second write");

        let value: Value = serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(value["a"], 2);
        let leftovers: Vec<_> = fs::read_dir(root.join("nested"))
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn failed_write_cleans_up_its_partial_file() {
        let root = scratch_dir("atomic_fail");
        let target = root.join("occupied");
        fs::create_dir_all(target.join("child")).expect("dir in the way");
        assert!(atomic_write_bytes(&target, b"x").is_err());
        let partials = fs::read_dir(&root)
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(partials, 0);
        let _ = fs::remove_dir_all(root);
    }
}
