//! Concurrent acquisition: exactly one of several simultaneous callers wins,
//! whether the race is within this process (registry contention) or against
//! a foreign holder that only touches the filesystem directly.

use sentrylock::{lock, test_support, FsAdapter, LockError, LockOptions, TokioFsAdapter};

fn opts() -> LockOptions {
    LockOptions::default()
}

#[tokio::test]
async fn two_simultaneous_in_process_lock_calls_leave_exactly_one_winner() {
    test_support::unlock_all_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("shared-resource");
    std::fs::create_dir(&target).unwrap();

    let (a, b) = tokio::join!(lock(&target, &opts()), lock(&target, &opts()));
    let results = [a, b];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let collisions = results
        .iter()
        .filter(|r| matches!(r, Err(LockError::Collision { .. })))
        .count();
    assert_eq!(winners, 1, "exactly one of two racing lock() calls must win");
    assert_eq!(collisions, 1);

    for result in results {
        if let Ok(handle) = result {
            handle.release().await.unwrap();
        }
    }
    test_support::unlock_all_for_tests();
}

#[tokio::test]
async fn a_sentinel_planted_by_a_foreign_holder_blocks_this_process() {
    test_support::unlock_all_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("shared-resource");
    std::fs::create_dir(&target).unwrap();

    // Simulate a holder on another machine sharing this filesystem: it
    // never goes through our registry, only through the raw adapter.
    let canonical = target.canonicalize().unwrap();
    let sentinel = std::path::PathBuf::from(format!("{}.lock", canonical.to_string_lossy()));
    let foreign_fs = TokioFsAdapter;
    foreign_fs.mkdir(&sentinel).await.unwrap();

    let err = lock(&target, &opts()).await.unwrap_err();
    assert!(matches!(err, LockError::Collision { .. }));

    foreign_fs.rmdir(&sentinel).await.unwrap();
    let handle = lock(&target, &opts()).await.unwrap();
    handle.release().await.unwrap();
    test_support::unlock_all_for_tests();
}

#[tokio::test]
async fn many_concurrent_callers_still_yield_a_single_winner() {
    test_support::unlock_all_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("shared-resource");
    std::fs::create_dir(&target).unwrap();

    let attempts = futures_join_all(&target).await;
    let winners = attempts.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for result in attempts {
        if let Ok(handle) = result {
            handle.release().await.unwrap();
        }
    }
    test_support::unlock_all_for_tests();
}

async fn futures_join_all(
    target: &std::path::Path,
) -> Vec<Result<sentrylock::ReleaseHandle, LockError>> {
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let target = target.to_path_buf();
        tasks.push(tokio::spawn(
            async move { lock(&target, &LockOptions::default()).await },
        ));
    }
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }
    results
}
