use crate::test::run_encode::{assert_target, run_encode, sample_assembly};
use attest_common::config::VerifyMode;

#[test]
fn eval_payload_evaluates_the_entrypoint() {
    let run = run_encode(
        "eval",
        &sample_assembly(),
        VerifyMode::Evaluate,
        None,
        false,
    );
    assert!(run.payload.starts_with("(set-logic ALL)"));
    assert!(run.payload.contains("(define-fun $i_main"));
    assert!(run.payload.contains("(check-sat)"));
    assert!(run.payload.contains("(get-value (_@smtres@))"));
    assert!(!run.payload.contains(";;ACTION;;"));
    assert!(!run.payload.contains(";;SORT_DECLS;;"));
}

#[test]
fn witness_payload_targets_the_assert_fault() {
    let run = run_encode(
        "witness",
        &sample_assembly(),
        VerifyMode::Witness,
        Some(assert_target()),
        false,
    );
    assert!(run.payload.contains("(check-sat)"));
    assert!(run.payload.contains("(get-model)"));

    assert_eq!(run.api_module["entrypoint"]["key"], "main");
    assert_eq!(run.api_module["entrypoint"]["params"][0]["name"], "x");
    let tags: Vec<&str> = run.api_module["faults"]
        .as_array()
        .unwrap()
        .iter()
        .map(|fault| fault["tag"].as_str().unwrap())
        .collect();
    assert!(tags.contains(&"overflow"));
    assert!(tags.contains(&"assert_failed"));
}

#[test]
fn artifacts_mirror_the_primary_outputs() {
    let run = run_encode(
        "artifacts",
        &sample_assembly(),
        VerifyMode::Evaluate,
        None,
        true,
    );
    let artifacts = run.artifacts.unwrap();

    let copy = std::fs::read_to_string(artifacts.artifact_path("smt2")).unwrap();
    assert_eq!(copy, run.payload);

    let faults = std::fs::read_to_string(artifacts.artifact_path("faults.tsv")).unwrap();
    assert!(faults.contains("app.flow:3:8\tassert_failed\tsum out of range"));
    assert!(faults.contains("overflow"));
}
