//! Integration tests for the genpool CLI.
//!
//! These run the real binary, so workers are real child processes.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::{TempDir, tempdir};

/// Get a command for the genpool binary with an isolated data directory.
fn genpool(data_dir: &Path) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("genpool").unwrap();
    cmd.env("GENPOOL_DATA_DIR", data_dir)
        .env_remove("GENPOOL_WORKERS")
        .env_remove("GENPOOL_WORKER_CONCURRENCY")
        .env_remove("GENPOOL_FAIL_ON_PAGE_ERROR")
        .env_remove("RUST_LOG")
        .env_remove("GENPOOL_LOG");
    cmd
}

/// Scratch dir with an items file holding `items`, one per line.
fn items_file(items: &[&str]) -> (TempDir, String) {
    let dir = tempdir().unwrap();
    let path = dir.path().join("routes.txt");
    std::fs::write(&path, items.join("\n")).unwrap();
    let path = path.to_str().unwrap().to_string();
    (dir, path)
}

fn read_timers(data_dir: &Path) -> Value {
    let raw = std::fs::read_to_string(data_dir.join("timers.json")).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn test_help_displays() {
    let data = tempdir().unwrap();
    genpool(data.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("internal-worker").not());
}

#[test]
fn test_run_requires_exec() {
    let data = tempdir().unwrap();
    genpool(data.path())
        .env_remove("GENPOOL_EXEC")
        .args(["run", "routes.txt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--exec"));
}

#[test]
fn test_run_renders_every_item() {
    let data = tempdir().unwrap();
    let (dir, items) = items_file(&["/", "/about", "/blog", "/contact", "/about"]);
    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let exec = format!("touch {}/\"$(basename {{}})\".html", out.display());

    genpool(data.path())
        .args(["--no-color", "run", &items, "--exec", &exec, "-w", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Files generated in"))
        .stderr(predicate::str::contains("4 routes will be generated"))
        .stderr(predicate::str::contains("Error report").not());

    for name in ["/.html", "about.html", "blog.html", "contact.html"] {
        assert!(out.join(name.trim_start_matches('/')).exists(), "missing {}", name);
    }

    let timers = read_timers(data.path());
    assert!(timers["lastStarted"].as_i64().unwrap() > 0);
    assert!(timers["lastFinished"].as_i64().unwrap() >= timers["lastStarted"].as_i64().unwrap());
    assert_eq!(timers["lastBuilt"], 0);
}

#[test]
fn test_items_from_stdin() {
    let data = tempdir().unwrap();
    let out = tempdir().unwrap();
    let exec = format!("echo {{}} >> {}/$(basename {{}})", out.path().display());

    genpool(data.path())
        .args(["run", "-", "--exec", &exec, "-w", "1"])
        .write_stdin("/x\n/y\n")
        .assert()
        .success();

    assert!(out.path().join("x").exists());
    assert!(out.path().join("y").exists());
}

#[test]
fn test_failed_items_are_reported() {
    let data = tempdir().unwrap();
    let (_dir, items) = items_file(&["/ok", "/bad-1", "/fine", "/bad-2"]);
    let exec = r#"case {} in /bad*) echo "page broke" >&2; exit 3;; esac"#;

    genpool(data.path())
        .args(["--no-color", "run", &items, "--exec", exec, "-w", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Files generated in"))
        .stderr(predicate::str::contains("==== Error report ===="))
        .stderr(predicate::str::contains("Route: '/bad-1' (worker"))
        .stderr(predicate::str::contains("Route: '/bad-2' (worker"))
        .stderr(predicate::str::contains("thrown an error:\nexit status 3: page broke"))
        .stderr(predicate::str::contains("Route: '/ok'").not());
}

#[test]
fn test_json_report() {
    let data = tempdir().unwrap();
    let (_dir, items) = items_file(&["/a", "/b", "/c", "/bad"]);
    let exec = "case {} in /bad) exit 1;; esac";

    let output = genpool(data.path())
        .args(["run", &items, "--exec", exec, "-w", "3", "--report", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(summary["duration"].is_number());
    let workers = summary["workerInfo"].as_array().unwrap();
    assert_eq!(workers.len(), 3);
    for worker in workers {
        assert_eq!(worker["exitCode"], 0);
        assert!(worker["duration"].is_number());
    }
    let routes: u64 = workers.iter().map(|w| w["routesProcessed"].as_u64().unwrap()).sum();
    assert_eq!(routes, 4);
    let error_count: u64 = workers.iter().map(|w| w["errorCount"].as_u64().unwrap()).sum();
    assert_eq!(error_count, 1);

    let errors = summary["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["item"], "/bad");
    assert_eq!(errors[0]["kind"], "handled");
}

#[test]
fn test_empty_items_starts_no_workers() {
    let data = tempdir().unwrap();
    let (_dir, items) = items_file(&["# nothing yet", ""]);

    genpool(data.path())
        .args(["--no-color", "run", &items, "--exec", "true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Files generated").not())
        .stderr(predicate::str::contains("No routes so not starting workers"))
        .stderr(predicate::str::contains("started with pid").not());
}

#[test]
fn test_missing_items_file_is_an_empty_run() {
    let data = tempdir().unwrap();
    genpool(data.path())
        .args(["--no-color", "run", "/nonexistent/routes.txt", "--exec", "true"])
        .assert()
        .success()
        .stderr(predicate::str::contains("No routes collected"))
        .stderr(predicate::str::contains("No routes so not starting workers"));
}

#[test]
fn test_build_step() {
    let data = tempdir().unwrap();
    let (dir, items) = items_file(&["/a"]);
    let marker = dir.path().join("built");
    let build_cmd = format!("touch {}", marker.display());

    genpool(data.path())
        .args(["run", &items, "--exec", "true", "--build", "--build-cmd", &build_cmd])
        .assert()
        .success();

    assert!(marker.exists());
    assert!(read_timers(data.path())["lastBuilt"].as_i64().unwrap() > 0);
}

#[test]
fn test_build_failure_aborts_run() {
    let data = tempdir().unwrap();
    let (dir, items) = items_file(&["/a"]);
    let exec = format!("touch {}/rendered", dir.path().display());

    genpool(data.path())
        .args(["--no-color", "run", &items, "--exec", &exec, "-b", "--build-cmd", "exit 7"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Build command 'exit 7' failed"));

    assert!(!dir.path().join("rendered").exists());
}

#[test]
fn test_killed_worker_fails_the_run() {
    let data = tempdir().unwrap();
    let (_dir, items) = items_file(&["/a"]);

    // The shell's parent is the worker process.
    genpool(data.path())
        .args(["--no-color", "run", &items, "--exec", "kill -9 $PPID", "-w", "1"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Files generated in"))
        .stderr(predicate::str::contains("SIGKILL"))
        .stderr(predicate::str::contains("1 worker(s) exited abnormally"));
}

#[test]
fn test_quiet_hides_progress() {
    let data = tempdir().unwrap();
    let (_dir, items) = items_file(&["/a", "/b"]);

    genpool(data.path())
        .args(["-qq", "run", &items, "--exec", "true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Files generated in"))
        .stderr(predicate::str::contains("retrieving routes").not());
}

#[test]
fn test_workers_from_env() {
    let data = tempdir().unwrap();
    let (_dir, items) = items_file(&["/a", "/b", "/c", "/d"]);

    let output = genpool(data.path())
        .env("GENPOOL_WORKERS", "2")
        .args(["run", &items, "--exec", "true", "--report", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["workerInfo"].as_array().unwrap().len(), 2);
}

#[test]
fn test_invalid_workers_env_is_an_error() {
    let data = tempdir().unwrap();
    let (_dir, items) = items_file(&["/a"]);

    genpool(data.path())
        .env("GENPOOL_WORKERS", "many")
        .args(["--no-color", "run", &items, "--exec", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("GENPOOL_WORKERS must be a number"));
}

#[test]
fn test_completions_bash() {
    let data = tempdir().unwrap();
    genpool(data.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("_genpool()"));
}

#[test]
fn test_completions_zsh() {
    let data = tempdir().unwrap();
    genpool(data.path())
        .args(["completions", "zsh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#compdef genpool"));
}
