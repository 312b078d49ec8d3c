use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

fn load_table<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(parsed)
}

fn save_table<T>(path: &Path, table: &T) -> Result<()>
where
    T: Serialize,
{
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let data = serde_json::to_string_pretty(table)?;
    // Write-then-rename so a crash mid-save never leaves a torn table on
    // disk. The rename is atomic on the same filesystem.
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    use std::io::Write;
    tmp.write_all(format!("{data}\n").as_bytes())?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Run `mutate` against the table at `path` under an exclusive advisory lock.
///
/// The lock file sits beside the table (`<name>.lock`) and is held for the
/// whole load-mutate-save cycle, so two processes can never interleave a
/// read-modify-write. If `mutate` returns an error the table is left as it
/// was loaded.
pub fn with_exclusive_table<T, R>(
    path: &Path,
    mutate: impl FnOnce(&mut T) -> Result<R>,
) -> Result<R>
where
    T: Serialize + DeserializeOwned + Default,
{
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let lock_path = path.with_extension("lock");
    let lock_file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("failed to open {}", lock_path.display()))?;
    lock_file
        .lock_exclusive()
        .with_context(|| format!("failed to lock {}", lock_path.display()))?;

    let result = (|| {
        let mut table: T = load_table(path)?;
        let out = mutate(&mut table)?;
        save_table(path, &table)?;
        Ok(out)
    })();

    let _ = fs2::FileExt::unlock(&lock_file);
    result
}

/// Read-only snapshot of the table at `path`, without taking the lock.
/// Saves are atomic renames, so a concurrent writer can never expose a
/// half-written table to this read.
pub fn read_table<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    load_table(path)
}

#[cfg(test)]
mod tests {
    use super::{read_table, with_exclusive_table};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    type Counters = BTreeMap<String, u64>;

    #[test]
    fn mutations_round_trip_through_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("counters.json");

        let out = with_exclusive_table::<Counters, u64>(&path, |table| {
            *table.entry("runs".to_string()).or_insert(0) += 1;
            Ok(table["runs"])
        })
        .expect("first mutation");
        assert_eq!(out, 1);

        let out = with_exclusive_table::<Counters, u64>(&path, |table| {
            *table.entry("runs".to_string()).or_insert(0) += 1;
            Ok(table["runs"])
        })
        .expect("second mutation");
        assert_eq!(out, 2);

        let snapshot: Counters = read_table(&path).expect("read table");
        assert_eq!(snapshot.get("runs"), Some(&2));
    }

    #[test]
    fn failed_mutation_leaves_table_untouched() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("counters.json");

        with_exclusive_table::<Counters, ()>(&path, |table| {
            table.insert("runs".to_string(), 7);
            Ok(())
        })
        .expect("seed table");

        let err = with_exclusive_table::<Counters, ()>(&path, |table| {
            table.insert("runs".to_string(), 99);
            anyhow::bail!("simulated failure")
        });
        assert!(err.is_err());

        let snapshot: Counters = read_table(&path).expect("read table");
        assert_eq!(snapshot.get("runs"), Some(&7));
    }

    #[test]
    fn missing_table_reads_as_default() {
        let dir = tempdir().expect("tempdir");
        let snapshot: Counters = read_table(&dir.path().join("absent.json")).expect("read table");
        assert!(snapshot.is_empty());
    }
}
