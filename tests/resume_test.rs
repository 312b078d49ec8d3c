use predicates::str::contains;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn write_export(path: &Path, count: usize) {
    let lines: Vec<String> = (0..count)
        .map(|i| {
            format!(
                r#"{{"id":"m{i:04}","thread_id":"t1","timestamp":{},"author":"alice","text":"hello number {i}"}}"#,
                1_700_000_000 + i as i64 * 60
            )
        })
        .collect();
    fs::write(path, lines.join("\n") + "\n").expect("write export");
}

fn gazette(tmp: &Path, home: &Path, export: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("gazette");
    cmd.current_dir(tmp)
        .env("GAZETTE_HOME", home)
        .env("GAZETTE_STEP_SIZE", "10")
        .env("GAZETTE_OVERLAP_RATIO", "0")
        .env("GAZETTE_TASK_WORKERS", "1")
        .arg("run")
        .arg(export);
    cmd
}

#[test]
fn crash_after_generation_resumes_without_duplicates() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path().join("gazette");
    let export = tmp.path().join("export.jsonl");
    write_export(&export, 30);

    // Simulated crash after w0001's digest is generated but before anything
    // is persisted for it.
    gazette(tmp.path(), &home, &export)
        .env("GAZETTE_CRASH_AFTER", "generated:w0001")
        .assert()
        .code(21);

    assert!(home.join("artifacts/w0000.md").exists());
    assert!(!home.join("artifacts/w0001.md").exists());
    let before = fs::read_to_string(home.join("artifacts/w0000.md")).expect("read w0000");

    // The crashed process left w0001 in progress; its pid is dead, so the
    // next run reclaims it.
    gazette(tmp.path(), &home, &export)
        .assert()
        .success()
        .stdout(contains("committed=2"))
        .stdout(contains("skipped=1"));

    assert!(home.join("artifacts/w0001.md").exists());
    assert!(home.join("artifacts/w0002.md").exists());
    let after = fs::read_to_string(home.join("artifacts/w0000.md")).expect("read w0000");
    assert_eq!(before, after, "resume rewrote an already committed artifact");
}

#[test]
fn crash_after_persist_recommits_the_same_artifact() {
    let tmp = tempdir().expect("tempdir");
    let home = tmp.path().join("gazette");
    let export = tmp.path().join("export.jsonl");
    write_export(&export, 30);

    // Crash in the gap between writing the artifact and committing the
    // checkpoint: the artifact exists but the window is not done yet.
    gazette(tmp.path(), &home, &export)
        .env("GAZETTE_CRASH_AFTER", "persisted:w0001")
        .assert()
        .code(21);

    let artifact = home.join("artifacts/w0001.md");
    assert!(artifact.exists());
    let orphaned = fs::read_to_string(&artifact).expect("read orphaned artifact");

    gazette(tmp.path(), &home, &export)
        .assert()
        .success()
        .stdout(contains("committed=2"))
        .stdout(contains("skipped=1"));

    let recommitted = fs::read_to_string(&artifact).expect("read recommitted artifact");
    assert_eq!(
        orphaned, recommitted,
        "recommit of an identical window must be byte-stable"
    );
    assert!(home.join("artifacts/w0002.md").exists());
}
