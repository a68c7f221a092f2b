//! E6: a worker that never exits must not hang the runner forever. Exercises
//! `JoinPatience` directly, since `JobRunner` has no hook to inject a
//! misbehaving worker into its own fixed worker pool.

use std::time::{Duration, Instant};

use dcnum::error::DcnumError;
use dcnum::logic::job_runner::JoinPatience;

#[test]
fn gives_up_after_r_times_t_instead_of_blocking_forever() {
    let handle = std::thread::spawn(|| -> dcnum::error::Result<()> {
        std::thread::sleep(Duration::from_secs(30));
        Ok(())
    });

    let patience = JoinPatience {
        retries: 3,
        timeout: Duration::from_millis(20),
    };

    let start = Instant::now();
    let result = patience.join("stuck-worker", handle);
    let elapsed = start.elapsed();

    assert!(elapsed < Duration::from_secs(1), "join should give up quickly, took {elapsed:?}");
    match result {
        Err(DcnumError::Join(msg)) => assert!(msg.contains("stuck-worker")),
        other => panic!("expected a Join error, got {other:?}"),
    }
}

#[test]
fn succeeds_once_the_worker_actually_finishes() {
    let handle = std::thread::spawn(|| -> dcnum::error::Result<()> { Ok(()) });
    let patience = JoinPatience {
        retries: 20,
        timeout: Duration::from_millis(10),
    };
    patience.join("fast-worker", handle).unwrap();
}
