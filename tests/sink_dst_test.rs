//! Sink DST Tests
//!
//! Deterministic simulation tests (seed-based) for the record sink. Each run
//! drives one partition through writes, commits and crash/restarts against a
//! fault-injecting store, then checks resume offsets and stored contents
//! against the shadow source log.
//!
//! ## Test Categories
//!
//! - **Calm tests**: No faults, verify basic correctness
//! - **Moderate tests**: Some faults, verify resilience
//! - **Chaos tests**: Many faults, stress test
//!
//! Store faults never justify a violation: a failed commit must rewind,
//! so every category is expected to pass all seeds.

use stream_sink::streaming::{
    run_dst_batch, summarize_batch, SinkDSTConfig, SinkDSTHarness, SinkDSTResult,
};

fn failed_seeds(results: &[SinkDSTResult]) -> Vec<u64> {
    results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect()
}

// =============================================================================
// Single Seed Tests
// =============================================================================

#[tokio::test]
async fn test_sink_dst_single_calm() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = SinkDSTHarness::new(SinkDSTConfig::calm(12345), dir.path().to_path_buf());

    harness.run(500).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());

    assert!(
        result.is_success(),
        "Calm mode should not violate invariants: {:?}",
        result.invariant_violations
    );
    assert_eq!(result.total_operations, 500);
    assert_eq!(result.committed_offset, result.records_produced);
}

#[tokio::test]
async fn test_sink_dst_single_chaos() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = SinkDSTHarness::new(SinkDSTConfig::chaos(99999), dir.path().to_path_buf());

    harness.run(300).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());
    println!("Store stats: {:?}", result.store_stats);

    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert!(result.crashes > 0);
}

// =============================================================================
// Multi-Seed Batch Tests
// =============================================================================

#[tokio::test]
async fn test_sink_dst_50_seeds_calm() {
    let dir = tempfile::tempdir().unwrap();
    let results = run_dst_batch(0, 50, 100, dir.path(), SinkDSTConfig::calm).await;

    let summary = summarize_batch(&results);
    println!("50 Seeds Calm:\n{}", summary);

    assert!(
        failed_seeds(&results).is_empty(),
        "All calm runs should pass. Failed seeds: {:?}",
        failed_seeds(&results)
    );
}

#[tokio::test]
async fn test_sink_dst_50_seeds_moderate() {
    let dir = tempfile::tempdir().unwrap();
    let results = run_dst_batch(1000, 50, 100, dir.path(), SinkDSTConfig::moderate).await;

    let summary = summarize_batch(&results);
    println!("50 Seeds Moderate:\n{}", summary);

    assert!(
        failed_seeds(&results).is_empty(),
        "Failed seeds: {:?}",
        failed_seeds(&results)
    );
}

#[tokio::test]
async fn test_sink_dst_30_seeds_chaos() {
    let dir = tempfile::tempdir().unwrap();
    let results = run_dst_batch(2000, 30, 100, dir.path(), SinkDSTConfig::chaos).await;

    let summary = summarize_batch(&results);
    println!("30 Seeds Chaos:\n{}", summary);

    assert!(
        failed_seeds(&results).is_empty(),
        "Failed seeds: {:?}",
        failed_seeds(&results)
    );
    let failed_commits: u64 = results.iter().map(|r| r.failed_commits).sum();
    assert!(failed_commits > 0, "Chaos should break some commits");
}

// =============================================================================
// Stress Tests
// =============================================================================

#[tokio::test]
async fn test_sink_dst_crash_restart_stress() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SinkDSTConfig::calm(8888);
    config.crash_probability = 0.15;

    let mut harness = SinkDSTHarness::new(config, dir.path().to_path_buf());
    harness.run(500).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("Crash Restart Stress:\n{}", result.summary());

    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert!(result.crashes > 1, "Should have some crashes");
}

#[tokio::test]
async fn test_sink_dst_single_chunk_generations() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SinkDSTConfig::moderate(31337);
    config.writer_config = config.writer_config.with_threshold(64 * 1024);
    config.generation_config.max_records = 10;

    let mut harness = SinkDSTHarness::new(config, dir.path().to_path_buf());
    harness.run(400).await;
    harness.check_invariants().await;

    let result = harness.result();
    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert!(result.commits > 10);
}

// =============================================================================
// Determinism Verification
// =============================================================================

#[tokio::test]
async fn test_sink_dst_determinism() {
    async fn run_seed(seed: u64, dir: std::path::PathBuf) -> (u64, u64, u64, u64) {
        let mut harness = SinkDSTHarness::new(SinkDSTConfig::moderate(seed), dir);
        harness.run(150).await;
        harness.check_invariants().await;
        let result = harness.result();
        (
            result.successful_operations,
            result.failed_operations,
            result.commits,
            result.committed_offset,
        )
    }

    let dir = tempfile::tempdir().unwrap();
    let seed = 42424242;
    let run1 = run_seed(seed, dir.path().join("one")).await;
    let run2 = run_seed(seed, dir.path().join("two")).await;

    assert_eq!(
        run1, run2,
        "Same seed should produce identical results: {:?} vs {:?}",
        run1, run2
    );
}

// =============================================================================
// Large Scale Tests (run with --release for reasonable times)
// =============================================================================

#[tokio::test]
#[ignore] // Run with: cargo test --release -- --ignored
async fn test_sink_dst_1000_seeds_moderate() {
    let dir = tempfile::tempdir().unwrap();
    let results = run_dst_batch(10000, 1000, 100, dir.path(), SinkDSTConfig::moderate).await;

    let summary = summarize_batch(&results);
    println!("1000 Seeds Moderate:\n{}", summary);
    assert!(failed_seeds(&results).is_empty(), "{}", summary);
}
