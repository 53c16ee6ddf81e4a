use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

use agentflow_test_utils::{failing_branch_flow, hello_world_flow, write_flow_file};

fn agentflow(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_agentflow"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("AGENTFLOW_CONFIG")
        .env("AGENTFLOW_LOG", "error")
        .output()
        .expect("spawn agentflow")
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("agentflow.toml");
    let toml = format!(
        "[store]\npath = \"{}\"\n\n[log]\nlog_dir = \"{}\"\n",
        dir.join("store.db").display(),
        dir.join("logs").display()
    );
    std::fs::write(&path, toml).unwrap();
    path
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn test_run_prints_record_and_persists_it() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let flow_file = write_flow_file(&hello_world_flow());

    let output = agentflow(&config, &["run", flow_file.path().to_str().unwrap(), "--save"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let run = stdout_json(&output);
    assert_eq!(run["status"], "completed");
    assert_eq!(run["final_output"], "Hello World");
    let run_id = run["id"].as_str().unwrap().to_string();

    let shown = agentflow(&config, &["runs", "show", &run_id]);
    assert!(shown.status.success());
    assert_eq!(stdout_json(&shown)["id"], run_id.as_str());

    let listed = agentflow(&config, &["runs", "list", "hello"]);
    assert!(String::from_utf8_lossy(&listed.stdout).contains(&run_id));

    // The saved flow can be run again by id.
    let again = agentflow(&config, &["run", "hello"]);
    assert!(again.status.success());

    let log = std::fs::read_to_string(dir.path().join("logs").join("hello.jsonl")).unwrap();
    assert!(log.lines().any(|l| l.contains("\"run_finished\"")));
}

#[test]
fn test_failed_run_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let flow_file = write_flow_file(&failing_branch_flow());

    let output = agentflow(&config, &["run", flow_file.path().to_str().unwrap()]);
    assert!(!output.status.success());
    let run = stdout_json(&output);
    assert_eq!(run["status"], "failed");
    assert_eq!(run["error"]["failed_nodes"][0], "boom");
}

#[test]
fn test_validate_reports_order_and_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let flow_file = write_flow_file(&hello_world_flow());
    let output = agentflow(&config, &["validate", flow_file.path().to_str().unwrap()]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("a -> b -> c"));

    let mut cyclic = hello_world_flow();
    cyclic
        .edges
        .push(agentflow_core::types::EdgeSpec::new("c", "a"));
    let flow_file = write_flow_file(&cyclic);
    let output = agentflow(&config, &["validate", flow_file.path().to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn test_flow_store_commands() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let flow_file = write_flow_file(&hello_world_flow());

    assert!(agentflow(&config, &["flows", "put", flow_file.path().to_str().unwrap()])
        .status
        .success());
    let listed = agentflow(&config, &["flows", "list"]);
    assert!(String::from_utf8_lossy(&listed.stdout).starts_with("hello\t"));

    let shown = agentflow(&config, &["flows", "show", "hello"]);
    assert_eq!(stdout_json(&shown)["nodes"].as_array().unwrap().len(), 3);

    assert!(agentflow(&config, &["flows", "delete", "hello"]).status.success());
    assert!(!agentflow(&config, &["flows", "delete", "hello"]).status.success());
}

#[test]
fn test_node_types_lists_builtins() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let output = agentflow(&config, &["node-types"]);
    assert!(output.status.success());
    let catalog = stdout_json(&output);
    let tags: Vec<&str> = catalog
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["type"].as_str())
        .collect();
    assert_eq!(tags, vec!["end", "function", "llm", "prompt", "start"]);
}

#[test]
fn test_config_command_masks_api_key() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    let mut toml = std::fs::read_to_string(&config).unwrap();
    toml.push_str("\n[model]\napi_key = \"sk-live-secret\"\n");
    std::fs::write(&config, toml).unwrap();

    let output = agentflow(&config, &["config"]);
    assert!(output.status.success());
    let shown = String::from_utf8_lossy(&output.stdout);
    assert!(!shown.contains("sk-live-secret"));
    assert!(shown.contains("api_key = \"***\""));
}
