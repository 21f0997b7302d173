// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Benchmarks for the per-step policy functions.
//!
//! Run with: `cargo bench --bench policy`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

use foreman::config::RuntimeConfig;
use foreman::policy::{
    build_prompt, evaluate_risk, parse_state, PathPolicy, PathPolicyMode, PromptContext,
};
use foreman::runtime::format::summarize_test_output;

fn bench_risk(c: &mut Criterion) {
    let mut group = c.benchmark_group("risk");
    group.throughput(Throughput::Elements(1));

    let long = "refactor the parser module and its callers ".repeat(40);
    let goals = [
        ("safe", "fix the off-by-one in the tokenizer"),
        ("sensitive", "pip install requests and deploy the client to production"),
        ("long", long.as_str()),
    ];
    for (name, goal) in goals {
        group.bench_with_input(BenchmarkId::new("evaluate", name), goal, |b, goal| {
            b.iter(|| evaluate_risk(black_box(goal), black_box(8), black_box(20)));
        });
    }

    group.finish();
}

fn bench_path_policy(c: &mut Criterion) {
    let config = RuntimeConfig::default();
    let allowed = vec!["src/**".to_string(), "tests/**".to_string(), "Cargo.toml".to_string()];
    let denylist = config.path_policy().unwrap();
    let enforced = PathPolicy::new(
        &allowed,
        &config.denied_paths,
        PathPolicyMode::AllowlistEnforced,
    )
    .unwrap();

    let mut group = c.benchmark_group("path_policy");
    for count in [1usize, 10, 100] {
        let paths: Vec<String> = (0..count)
            .map(|i| format!("src/module_{}/file_{}.rs", i % 7, i))
            .collect();
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("denylist", count), &paths, |b, paths| {
            b.iter(|| denylist.validate(black_box(paths)));
        });
        group.bench_with_input(BenchmarkId::new("allowlist", count), &paths, |b, paths| {
            b.iter(|| enforced.validate(black_box(paths)));
        });
    }

    // Violation found on the last path
    let mut rejected: Vec<String> = (0..50).map(|i| format!("src/f{}.rs", i)).collect();
    rejected.push(".env".to_string());
    group.bench_function("denylist_violation", |b| {
        b.iter(|| denylist.validate(black_box(&rejected)).is_err());
    });

    group.finish();
}

fn bench_prompt(c: &mut Criterion) {
    let failure = "test result: FAILED. 3 passed; 1 failed\n".repeat(30);
    let ctx = PromptContext {
        goal: "implement retries with exponential backoff in the http client",
        original_request: Some("please implement retries for the client"),
        step_no: 3,
        max_steps: 8,
        prior_failure: Some(&failure),
        resume_instruction: Some("keep the public API unchanged"),
    };

    let mut group = c.benchmark_group("prompt");
    group.bench_function("build_prompt", |b| {
        b.iter(|| build_prompt(black_box(&ctx)));
    });

    let short = "Done.\nTASK_STATE: DONE";
    let long = format!(
        "{}\nTASK_STATE: BLOCKED\nBLOCK_REASON: need credentials for the staging API",
        "Working through the change set.\n".repeat(500)
    );
    group.bench_function("parse_state_short", |b| {
        b.iter(|| parse_state(black_box(short)));
    });
    group.bench_function("parse_state_long", |b| {
        b.iter(|| parse_state(black_box(&long)));
    });

    group.finish();
}

fn bench_test_summary(c: &mut Criterion) {
    let mut cargo = String::new();
    for i in 0..400 {
        cargo.push_str(&format!("test module::case_{} ... ok\n", i));
    }
    cargo.push_str("test module::flaky ... FAILED\n");
    cargo.push_str("test result: FAILED. 400 passed; 1 failed; 0 ignored; finished in 2.31s\n");

    let mut pytest = String::new();
    for i in 0..200 {
        pytest.push_str(&format!("tests/test_api.py::test_case_{} PASSED\n", i));
    }
    pytest.push_str("FAILED tests/test_api.py::test_timeout - AssertionError\n");
    pytest.push_str("==== 1 failed, 200 passed in 4.02s ====\n");

    let mut group = c.benchmark_group("test_summary");
    group.bench_function("cargo", |b| {
        b.iter(|| summarize_test_output(black_box(&cargo)));
    });
    group.bench_function("pytest", |b| {
        b.iter(|| summarize_test_output(black_box(&pytest)));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_risk,
    bench_path_policy,
    bench_prompt,
    bench_test_summary,
);

criterion_main!(benches);
