//! Cross-process guarantees of the append log.
//!
//! Child processes are this test binary re-executed with only
//! `child_writer` selected and the target path passed through the
//! environment.

use metrics_ingest::append_log::AppendLog;
use std::collections::HashMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

const CHILD_PATH_ENV: &str = "METRICS_INGEST_CHILD_LOG";
const CHILD_ID_ENV: &str = "METRICS_INGEST_CHILD_ID";
const CHILD_WRITES: usize = 40;
const PADDING: usize = 512;

fn line(writer: &str, seq: usize) -> String {
    format!("{writer} {seq:04} {}", "p".repeat(PADDING))
}

/// Entry point for child processes; does nothing in a normal test run.
#[test]
fn child_writer() {
    let (Ok(path), Ok(id)) = (std::env::var(CHILD_PATH_ENV), std::env::var(CHILD_ID_ENV)) else {
        return;
    };

    let log = AppendLog::new(path).unwrap();
    for seq in 0..CHILD_WRITES {
        log.write_line(line(&format!("process-{id}"), seq)).unwrap();
    }
}

fn spawn_child(path: &Path, id: usize) -> Child {
    Command::new(std::env::current_exe().unwrap())
        .args(["child_writer", "--exact", "--test-threads=1", "--quiet"])
        .env(CHILD_PATH_ENV, path)
        .env(CHILD_ID_ENV, id.to_string())
        .stdout(Stdio::null())
        .spawn()
        .unwrap()
}

/// Every line is intact and each writer's lines appear in order.
fn check_lines(path: &Path) -> HashMap<String, usize> {
    let content = std::fs::read_to_string(path).unwrap();
    assert!(content.ends_with('\n'));

    let mut counts: HashMap<String, usize> = HashMap::new();
    for l in content.lines() {
        let mut parts = l.split(' ');
        let writer = parts.next().unwrap().to_string();
        let seq: usize = parts.next().unwrap().parse().unwrap();
        assert_eq!(parts.next(), Some("p".repeat(PADDING).as_str()), "corrupt line: {l}");
        assert_eq!(parts.next(), None, "corrupt line: {l}");

        let count = counts.entry(writer).or_insert(0);
        assert_eq!(seq, *count, "out of order: {l}");
        *count += 1;
    }
    counts
}

#[test]
fn test_concurrent_processes_no_lost_or_interleaved_lines() {
    const PROCESSES: usize = 5;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared").join("metrics.log");
    AppendLog::new(&path).unwrap();

    let children: Vec<Child> = (0..PROCESSES).map(|id| spawn_child(&path, id)).collect();
    for mut child in children {
        assert!(child.wait().unwrap().success());
    }

    let counts = check_lines(&path);
    assert_eq!(counts.len(), PROCESSES);
    assert!(counts.values().all(|&n| n == CHILD_WRITES));
}

#[test]
fn test_mixed_threads_and_processes() {
    const PROCESSES: usize = 3;
    const THREADS: usize = 4;
    const THREAD_WRITES: usize = 30;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.log");
    let log = Arc::new(AppendLog::new(&path).unwrap());

    let children: Vec<Child> = (0..PROCESSES).map(|id| spawn_child(&path, id)).collect();

    let threads: Vec<_> = (0..THREADS)
        .map(|t| {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for seq in 0..THREAD_WRITES {
                    log.write_line(line(&format!("thread-{t}"), seq)).unwrap();
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }
    for mut child in children {
        assert!(child.wait().unwrap().success());
    }

    let counts = check_lines(&path);
    assert_eq!(counts.len(), PROCESSES + THREADS);
    assert_eq!(
        counts.values().sum::<usize>(),
        PROCESSES * CHILD_WRITES + THREADS * THREAD_WRITES
    );
}
