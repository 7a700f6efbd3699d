// SPDX-License-Identifier: MIT OR Apache-2.0
//! Worker exit discipline and wire behavior against the env contract.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use coral_protocol::env::{
    ENV_BUNDLE_B64, ENV_CALLSPEC_B64, ENV_RESULT_STDOUT, ENV_RESULT_URI, split_env_chunks,
};
use coral_protocol::{
    CallSpec, PROTOCOL_VERSION, SERIALIZATION_JSON_V1, StdoutMode, encode_args,
    encode_kwargs, log_labels, parse_marker_line,
};
use coral_worker::{EXIT_CALL_FAILED, EXIT_SUCCESS, EXIT_WORKER_ERROR, Kwargs, Worker};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tempfile::TempDir;

fn worker(dir: &TempDir) -> Worker {
    Worker::sandboxed()
        .bundle_dest(dir.path().join("src"))
        .register("tasks", "process", |args, _kwargs| {
            let text = args
                .first()
                .and_then(Value::as_str)
                .ok_or("process() expects a string argument")?;
            Ok(json!({
                "words": text.split_whitespace().count(),
                "upper": text.to_uppercase(),
            }))
        })
        .register("tasks", "explode", |_args, _kwargs| {
            Err("Traceback: intentional failure".to_string())
        })
}

fn callspec(module: &str, qualname: &str, args: Vec<Value>, result_ref: &str) -> CallSpec {
    CallSpec {
        call_id: "c".repeat(32),
        module: module.into(),
        qualname: qualname.into(),
        args_b64: encode_args(&args).unwrap(),
        kwargs_b64: encode_kwargs(&Kwargs::new()).unwrap(),
        serialization: SERIALIZATION_JSON_V1.into(),
        result_ref: result_ref.into(),
        stdout_mode: StdoutMode::Stream,
        log_labels: log_labels("run", "app", &"c".repeat(32)),
        protocol_version: PROTOCOL_VERSION.into(),
    }
}

fn env_with(call: &CallSpec) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert(ENV_CALLSPEC_B64.to_string(), call.to_b64().unwrap());
    env
}

#[tokio::test]
async fn successful_call_exits_zero_and_writes_result() {
    let dir = TempDir::new().unwrap();
    let result_path = dir.path().join("results/out.bin");
    let call = callspec(
        "tasks",
        "process",
        vec![json!("hello coral")],
        &result_path.display().to_string(),
    );

    let outcome = worker(&dir).execute(&env_with(&call)).await;
    assert_eq!(outcome.exit_code, EXIT_SUCCESS);
    assert!(outcome.success);

    let written: Value = serde_json::from_slice(&std::fs::read(&result_path).unwrap()).unwrap();
    assert_eq!(written, json!({"words": 2, "upper": "HELLO CORAL"}));
    assert!(outcome.marker.is_none());
}

#[tokio::test]
async fn raising_call_exits_one_with_traceback_bytes() {
    let dir = TempDir::new().unwrap();
    let result_path = dir.path().join("results/out.bin");
    let call = callspec(
        "tasks",
        "explode",
        vec![],
        &result_path.display().to_string(),
    );

    let outcome = worker(&dir).execute(&env_with(&call)).await;
    assert_eq!(outcome.exit_code, EXIT_CALL_FAILED);
    assert!(!outcome.success);

    let written = std::fs::read_to_string(&result_path).unwrap();
    assert!(written.contains("intentional failure"));
}

#[tokio::test]
async fn markers_appear_iff_result_stdout_requested() {
    let dir = TempDir::new().unwrap();
    let call = callspec("tasks", "process", vec![json!("one two three")], "");

    let mut env = env_with(&call);
    env.insert(ENV_RESULT_STDOUT.to_string(), "1".to_string());
    let outcome = worker(&dir).execute(&env).await;
    let marker = outcome.marker.expect("marker expected");
    let (success, payload) = parse_marker_line(&marker).unwrap();
    assert!(success);
    let value: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(value["words"], 3);

    let outcome = worker(&dir).execute(&env_with(&call)).await;
    assert!(outcome.marker.is_none());
}

#[tokio::test]
async fn failure_marker_carries_traceback() {
    let dir = TempDir::new().unwrap();
    let call = callspec("tasks", "explode", vec![], "");
    let mut env = env_with(&call);
    env.insert(ENV_RESULT_STDOUT.to_string(), "1".to_string());

    let outcome = worker(&dir).execute(&env).await;
    let (success, payload) = parse_marker_line(outcome.marker.as_deref().unwrap()).unwrap();
    assert!(!success);
    assert!(String::from_utf8(payload).unwrap().contains("intentional"));
}

#[tokio::test]
async fn missing_callspec_is_a_worker_error() {
    let dir = TempDir::new().unwrap();
    let outcome = worker(&dir).execute(&BTreeMap::new()).await;
    assert_eq!(outcome.exit_code, EXIT_WORKER_ERROR);
    let text = String::from_utf8(outcome.payload).unwrap();
    assert!(text.contains("CALLSPEC_B64"), "{text}");
}

#[tokio::test]
async fn legacy_serialization_tag_is_a_worker_error() {
    let dir = TempDir::new().unwrap();
    let mut call = callspec("tasks", "process", vec![json!("x")], "");
    call.serialization = "cloudpickle-v1".to_string();

    let outcome = worker(&dir).execute(&env_with(&call)).await;
    assert_eq!(outcome.exit_code, EXIT_WORKER_ERROR);
    let text = String::from_utf8(outcome.payload).unwrap();
    assert!(text.contains("cloudpickle-v1"), "{text}");
}

#[tokio::test]
async fn unregistered_target_fails_the_call() {
    let dir = TempDir::new().unwrap();
    let call = callspec("tasks", "missing", vec![], "");
    let outcome = worker(&dir).execute(&env_with(&call)).await;
    assert_eq!(outcome.exit_code, EXIT_CALL_FAILED);
    let text = String::from_utf8(outcome.payload).unwrap();
    assert!(text.contains("not registered"), "{text}");
}

#[tokio::test]
async fn inline_chunked_bundle_is_materialized() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("pkg");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("data.txt"), "bundled\n").unwrap();
    let archive = dir.path().join("bundle.tar.gz");
    coral_bundle::create_bundle(&[src], &archive, "0.0.0", &[]).unwrap();

    let b64 = B64.encode(std::fs::read(&archive).unwrap());
    let call = callspec("tasks", "process", vec![json!("hi")], "");
    let mut env = env_with(&call);
    for (k, v) in split_env_chunks(ENV_BUNDLE_B64, &b64, 256) {
        env.insert(k, v);
    }

    let dest = dir.path().join("materialized");
    let outcome = worker(&dir)
        .bundle_dest(&dest)
        .execute(&env)
        .await;
    assert_eq!(outcome.exit_code, EXIT_SUCCESS);
    assert_eq!(
        std::fs::read_to_string(dest.join("pkg/data.txt")).unwrap(),
        "bundled\n"
    );
}

#[tokio::test]
async fn result_uri_env_overrides_envelope_ref() {
    let dir = TempDir::new().unwrap();
    let envelope_ref = dir.path().join("from_envelope.bin");
    let override_ref = dir.path().join("from_env.bin");
    let call = callspec(
        "tasks",
        "process",
        vec![json!("x")],
        &envelope_ref.display().to_string(),
    );

    let mut env = env_with(&call);
    env.insert(
        ENV_RESULT_URI.to_string(),
        override_ref.display().to_string(),
    );
    worker(&dir).execute(&env).await;

    assert!(override_ref.exists());
    assert!(!envelope_ref.exists());
}

#[tokio::test]
async fn panicking_handler_becomes_call_failure() {
    let dir = TempDir::new().unwrap();
    let panicky = Worker::sandboxed()
        .bundle_dest(dir.path().join("src"))
        .register("tasks", "panic", |_args, _kwargs| panic!("kaboom"));
    let call = callspec("tasks", "panic", vec![], "");

    let outcome = panicky.execute(&env_with(&call)).await;
    assert_eq!(outcome.exit_code, EXIT_CALL_FAILED);
    assert!(String::from_utf8(outcome.payload).unwrap().contains("kaboom"));
}
