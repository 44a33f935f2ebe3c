mod common;

use std::fs;

use predicates::{prelude::*, str::contains};
use schema_reconcile::plan::RemediationPlan;

use common::{SIGNATURE_CATALOG, TestWorkspace, reconcile_cmd, row_count};

const SALES: &str = "sales_id,product_id,alcohol_percentage,price,email\n\
2,11,4.5,12.0,a@example.com\n\
3,12,40,30.25,b@example.com\n";

#[test]
fn probe_reports_canonical_types_as_json() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", SALES);
    let output = reconcile_cmd()
        .args(["probe", "-i", input.to_str().unwrap(), "--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let snapshot: serde_json::Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(snapshot["origin"], "source");
    assert_eq!(snapshot["columns"][2]["name"], "alcohol_percentage");
    assert_eq!(snapshot["columns"][2]["canonical_type"], "REAL");
    assert_eq!(snapshot["columns"][4]["canonical_type"], "TEXT");
}

#[test]
fn probe_honours_delimiter_and_writes_file() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.txt", "id;active\n1;yes\n2;no\n");
    let output = workspace.path().join("schema.yaml");
    reconcile_cmd()
        .args([
            "probe",
            "-i",
            input.to_str().unwrap(),
            "--delimiter",
            ";",
            "-o",
            output.to_str().unwrap(),
        ])
        .assert()
        .success();
    let yaml = fs::read_to_string(&output).expect("probe output");
    assert!(yaml.contains("canonical_type: BOOLEAN"));
    assert!(yaml.contains("canonical_type: INTEGER"));
}

#[test]
fn describe_reads_the_target_table() {
    let workspace = TestWorkspace::new();
    let db = workspace.raw_pos_db();
    reconcile_cmd()
        .args(["describe", "--database", db.to_str().unwrap(), "--table", "raw_pos"])
        .assert()
        .success()
        .stdout(contains("origin: target").and(contains("name: description")));
}

#[test]
fn describe_missing_table_fails() {
    let workspace = TestWorkspace::new();
    let db = workspace.raw_pos_db();
    reconcile_cmd()
        .args(["describe", "--database", db.to_str().unwrap(), "--table", "raw_sales"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("target table 'raw_sales' does not exist"));
}

#[test]
fn diff_resolves_target_through_mapping() {
    let workspace = TestWorkspace::new();
    let db = workspace.raw_pos_db();
    let input = workspace.write("sales.csv", SALES);
    let mapping = workspace.write(
        "mapping.json",
        &serde_json::json!({
            "sales.csv": {"database_name": db.to_str().unwrap(), "table_name": "raw_pos"}
        })
        .to_string(),
    );
    let output = reconcile_cmd()
        .args([
            "diff",
            "-i",
            input.to_str().unwrap(),
            "--mapping",
            mapping.to_str().unwrap(),
            "--format",
            "json",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let diff: serde_json::Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(diff["table"], "raw_pos");
    assert_eq!(diff["diff"]["source_only"]["email"], "TEXT");
    assert_eq!(diff["diff"]["target_only"][0], "description");
    assert_eq!(diff["diff"]["type_mismatches"]["alcohol_percentage"]["source"], "REAL");
}

#[test]
fn plan_renders_mysql_ddl_and_apply_executes_saved_plan() {
    let workspace = TestWorkspace::new();
    let db = workspace.raw_pos_db();
    let input = workspace.write("sales.csv", SALES);
    let plan_path = workspace.path().join("plan.json");

    let output = reconcile_cmd()
        .args([
            "plan",
            "-i",
            input.to_str().unwrap(),
            "--database",
            db.to_str().unwrap(),
            "--table",
            "raw_pos",
            "--dialect",
            "mysql",
            "--plan-out",
            plan_path.to_str().unwrap(),
            "--format",
            "json",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let planned: serde_json::Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(
        planned["ddl"]["statements"],
        serde_json::json!([
            "ALTER TABLE `raw_pos` MODIFY COLUMN `alcohol_percentage` DOUBLE",
            "ALTER TABLE `raw_pos` ADD COLUMN `email` TEXT",
        ])
    );
    assert_eq!(planned["ddl"]["casts"][0]["column"], "alcohol_percentage");

    let saved: RemediationPlan =
        serde_json::from_str(&fs::read_to_string(&plan_path).expect("plan file")).expect("plan json");
    assert_eq!(saved.len(), 3);
    assert!(saved.target_fingerprint.is_some());

    reconcile_cmd()
        .args([
            "apply",
            "--plan",
            plan_path.to_str().unwrap(),
            "--database",
            db.to_str().unwrap(),
            "--table",
            "raw_pos",
        ])
        .assert()
        .success()
        .stdout(contains("ADD COLUMN \"email\" TEXT"));

    // The table no longer matches the plan's fingerprint.
    reconcile_cmd()
        .args([
            "apply",
            "--plan",
            plan_path.to_str().unwrap(),
            "--database",
            db.to_str().unwrap(),
            "--table",
            "raw_pos",
        ])
        .assert()
        .failure()
        .stderr(contains("changed since the plan was computed"));
}

#[test]
fn plan_refuses_unsafe_narrowing() {
    let workspace = TestWorkspace::new();
    let db = workspace.raw_pos_db();
    let input = workspace.write("sales.csv", "sales_id,product_id\n1,P-10\n");
    reconcile_cmd()
        .args([
            "plan",
            "-i",
            input.to_str().unwrap(),
            "--database",
            db.to_str().unwrap(),
            "--table",
            "raw_pos",
        ])
        .assert()
        .failure()
        .stderr(contains("unsafe narrowing required for 'product_id' (TEXT -> INTEGER)"));
}

#[test]
fn cast_writes_clean_rows_and_reports_rejects() {
    let workspace = TestWorkspace::new();
    let input = workspace.write("sales.csv", "sku,qty\nA,1\nB,two\nC,3\n");
    let plan = workspace.write(
        "plan.yaml",
        "actions:\n  - action: cast_rule\n    name: qty\n    from_type: TEXT\n    to_type: INTEGER\n",
    );
    let output = workspace.path().join("out.csv");
    let rejects = workspace.path().join("rejects.json");
    reconcile_cmd()
        .args([
            "cast",
            "-i",
            input.to_str().unwrap(),
            "--plan",
            plan.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--rejects",
            rejects.to_str().unwrap(),
        ])
        .assert()
        .success();
    assert_eq!(fs::read_to_string(&output).unwrap(), "sku,qty\nA,1\nC,3\n");
    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&rejects).unwrap()).expect("rejects json");
    assert_eq!(report["rows_written"], 2);
    assert_eq!(report["rejected"][0]["row"], 3);
    assert_eq!(report["rejected"][0]["value"], "two");
}

#[test]
fn failed_load_then_recover_reconciles() {
    let workspace = TestWorkspace::new();
    let db = workspace.raw_pos_db();
    let input = workspace.write("sales.csv", SALES);
    let catalog = workspace.write("tasks.yaml", SIGNATURE_CATALOG);
    let failure_log = workspace.path().join("failure.log");

    reconcile_cmd()
        .args([
            "load",
            "-i",
            input.to_str().unwrap(),
            "--database",
            db.to_str().unwrap(),
            "--table",
            "raw_pos",
            "--failure-log",
            failure_log.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(contains("has no column named email"));
    assert!(failure_log.exists());
    assert_eq!(row_count(&db, "raw_pos"), 1);

    let output = reconcile_cmd()
        .args([
            "recover",
            "--log",
            failure_log.to_str().unwrap(),
            "--catalog",
            catalog.to_str().unwrap(),
            "-i",
            input.to_str().unwrap(),
            "--database",
            db.to_str().unwrap(),
            "--table",
            "raw_pos",
            "--format",
            "json",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let recovered: serde_json::Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(recovered["outcome"], "matched");
    assert_eq!(recovered["task_key"], "schema_validator_task");
    assert_eq!(recovered["trigger"], "has no column named");
    assert_eq!(
        recovered["reconciliation"]["plan"]["actions"][0]["action"],
        "widen_column_type"
    );
}

#[test]
fn recover_without_match_exits_two() {
    let workspace = TestWorkspace::new();
    let catalog = workspace.write("tasks.yaml", SIGNATURE_CATALOG);
    let log = workspace.write("failure.log", "database is locked\n");
    reconcile_cmd()
        .args([
            "recover",
            "--log",
            log.to_str().unwrap(),
            "--catalog",
            catalog.to_str().unwrap(),
        ])
        .assert()
        .code(2)
        .stdout(contains("outcome: no_match"))
        .stderr(contains("no matching error signature"));
}

#[test]
fn recover_with_malformed_catalog_fails() {
    let workspace = TestWorkspace::new();
    let catalog = workspace.write("tasks.yaml", "task:\n  triggers_on_errors: [\"\"]\n  description: d\n  expected_output: o\n");
    let log = workspace.write("failure.log", "anything\n");
    reconcile_cmd()
        .args([
            "recover",
            "--log",
            log.to_str().unwrap(),
            "--catalog",
            catalog.to_str().unwrap(),
        ])
        .assert()
        .code(1)
        .stderr(contains("failed to load error-signature catalog"));
}

#[test]
fn apply_and_load_refuse_a_missing_database() {
    let workspace = TestWorkspace::new();
    let missing = workspace.path().join("typo.db");
    let input = workspace.write("sales.csv", SALES);
    let plan = workspace.write("plan.json", r#"{"actions": []}"#);

    reconcile_cmd()
        .args([
            "apply",
            "--plan",
            plan.to_str().unwrap(),
            "--database",
            missing.to_str().unwrap(),
            "--table",
            "raw_pos",
        ])
        .assert()
        .failure()
        .stderr(contains("is unreachable"));
    reconcile_cmd()
        .args([
            "load",
            "-i",
            input.to_str().unwrap(),
            "--database",
            missing.to_str().unwrap(),
            "--table",
            "raw_pos",
            "--failure-log",
            workspace.path().join("failure.log").to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(contains("is unreachable"));
    assert!(!missing.exists());
}

#[test]
fn recover_passes_source_options_and_policy_to_reconciliation() {
    let workspace = TestWorkspace::new();
    let db = workspace.raw_pos_db();
    let input = workspace.write("sales.csv", "sales_id;product_id\n2;P-10\n");
    let catalog = workspace.write("tasks.yaml", SIGNATURE_CATALOG);
    let log = workspace.write(
        "failure.log",
        "Incorrect integer value 'P-10' for column 'product_id' at row 2\n",
    );
    let recover = |extra: &[&str]| {
        let mut cmd = reconcile_cmd();
        cmd.args([
            "recover",
            "--log",
            log.to_str().unwrap(),
            "--catalog",
            catalog.to_str().unwrap(),
            "-i",
            input.to_str().unwrap(),
            "--database",
            db.to_str().unwrap(),
            "--table",
            "raw_pos",
            "--delimiter",
            ";",
            "--format",
            "json",
        ])
        .args(extra);
        cmd
    };

    recover(&[])
        .assert()
        .failure()
        .stderr(contains("unsafe narrowing required for 'product_id' (TEXT -> INTEGER)"));

    let output = recover(&["--promote-to-text"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let recovered: serde_json::Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(recovered["task_key"], "schema_validator_task");
    let widen = &recovered["reconciliation"]["plan"]["actions"][0];
    assert_eq!(widen["action"], "widen_column_type");
    assert_eq!(widen["name"], "product_id");
    assert_eq!(widen["to_type"], "TEXT");
}
