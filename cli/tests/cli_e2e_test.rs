use assert_cmd::{Command, cargo_bin_cmd};
use testing::ConfigTree;

fn strata() -> Command {
    let mut cmd = cargo_bin_cmd!("strata");
    cmd.env("NO_COLOR", "1")
        .env_remove("STRATA_CONFIG_DIR")
        .env_remove("STRATA_ENV")
        .env_remove("STRATA_BACKUP_DIR")
        .env_remove("STRATA_CONFIG_ID")
        .env_remove("RUST_LOG");
    cmd
}

/// `strata --config-dir <tree> --env development <args>`
fn in_tree(tree: &ConfigTree, args: &[&str]) -> Command {
    let mut cmd = strata();
    cmd.arg("--config-dir")
        .arg(tree.path())
        .args(["--env", "development"])
        .args(args);
    cmd
}

fn stdout_json(cmd: &mut Command) -> serde_json::Value {
    let out = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&out).expect("stdout is JSON")
}

mod help_and_version {
    use super::*;
    use predicates::prelude::predicate;

    #[test]
    fn test_help_flag() {
        strata()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Usage:"))
            .stdout(predicate::str::contains("versions"))
            .stdout(predicate::str::contains("--config-dir"));
    }

    #[test]
    fn test_version_flag() {
        strata()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("strata"));
    }

    #[test]
    fn test_no_args_shows_help() {
        strata()
            .assert()
            .failure()
            .stderr(predicate::str::contains("Usage:"));
    }

    #[test]
    fn test_versions_help_lists_subcommands() {
        strata()
            .args(["versions", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("rollback"))
            .stdout(predicate::str::contains("backup"))
            .stdout(predicate::str::contains("verify"));
    }

    #[test]
    fn test_completion_bash() {
        strata()
            .args(["completion", "bash"])
            .assert()
            .success()
            .stdout(predicate::str::contains("strata"));
    }
}

mod inspect {
    use super::*;
    use predicates::prelude::predicate;
    use serde_json::json;

    #[test]
    fn test_show_json() {
        let tree = ConfigTree::standard().unwrap();
        let config = stdout_json(&mut in_tree(&tree, &["show", "--format", "json"]));
        assert_eq!(config["api"]["workers"], json!(1));
        assert_eq!(config["system"]["debug"], json!(true));
    }

    #[test]
    fn test_show_section_yaml() {
        let tree = ConfigTree::standard().unwrap();
        let out = in_tree(&tree, &["show", "--section", "logging"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let parsed: serde_yaml::Value = serde_yaml::from_slice(&out).unwrap();
        assert_eq!(parsed["logging"]["level"], serde_yaml::Value::from("DEBUG"));
        assert!(parsed.get("api").is_none());
    }

    #[test]
    fn test_show_unknown_section_fails() {
        let tree = ConfigTree::standard().unwrap();
        in_tree(&tree, &["show", "--section", "nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Section 'nope' is not defined"));
    }

    #[test]
    fn test_get_value_and_source() {
        let tree = ConfigTree::standard().unwrap();
        in_tree(&tree, &["get", "api.workers"])
            .assert()
            .success()
            .stdout("1\n");
        in_tree(&tree, &["get", "system.name", "--source"])
            .assert()
            .success()
            .stdout(predicate::str::contains("strata (default)"));

        let value = stdout_json(&mut in_tree(&tree, &["get", "api.workers", "--json"]));
        assert_eq!(value["source"], json!("development"));
    }

    #[test]
    fn test_get_missing_key_fails() {
        let tree = ConfigTree::standard().unwrap();
        in_tree(&tree, &["get", "api.nothing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("is not set"));
    }

    #[test]
    fn test_files_lists_sources() {
        let tree = ConfigTree::standard().unwrap();
        tree.write("presets/fast.yaml", "api:\n  workers: 2\n").unwrap();
        in_tree(&tree, &["files"])
            .assert()
            .success()
            .stdout(predicate::str::contains("default"))
            .stdout(predicate::str::contains("development"))
            .stdout(predicate::str::contains("fast.preset"));
    }

    #[test]
    fn test_missing_config_dir_explains() {
        let tree = ConfigTree::empty().unwrap();
        strata()
            .arg("--config-dir")
            .arg(tree.join("missing"))
            .arg("show")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Configuration directory not found"));
    }

    #[test]
    fn test_status_json() {
        let tree = ConfigTree::standard().unwrap();
        let status = stdout_json(&mut in_tree(&tree, &["status", "--json"]));
        assert_eq!(status["status"]["loaded"], json!(true));
        assert_eq!(status["status"]["environment"], json!("development"));
        assert_eq!(status["load_error"], json!(null));
    }
}

mod validate {
    use super::*;
    use predicates::prelude::predicate;
    use serde_json::json;

    #[test]
    fn test_valid_configuration() {
        let tree = ConfigTree::standard().unwrap();
        in_tree(&tree, &["validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("is valid"));
    }

    #[test]
    fn test_invalid_configuration_fails_with_violation() {
        let tree = ConfigTree::standard().unwrap();
        tree.write("override.yaml", "api:\n  workers: 500\n").unwrap();
        let out = in_tree(&tree, &["validate", "--json"])
            .assert()
            .failure()
            .get_output()
            .stdout
            .clone();
        let report: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(report["valid"], json!(false));
        assert!(report["errors"][0].as_str().unwrap().starts_with("api.workers"));

        in_tree(&tree, &["validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("api.workers"));
    }

    #[test]
    fn test_production_debug_is_rejected() {
        let tree = ConfigTree::standard().unwrap();
        tree.write("override.yaml", "system:\n  debug: true\n").unwrap();
        strata()
            .arg("--config-dir")
            .arg(tree.path())
            .args(["--env", "production", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("system.debug must be disabled in production"));
    }
}

mod transfer {
    use super::*;
    use predicates::prelude::predicate;
    use serde_json::json;

    #[test]
    fn test_export_json_without_metadata() {
        let tree = ConfigTree::standard().unwrap();
        let exported = stdout_json(&mut in_tree(
            &tree,
            &["export", "--format", "json", "--no-metadata"]
        ));
        assert!(exported.get("_metadata").is_none());
        assert_eq!(exported["logging"]["level"], json!("DEBUG"));
    }

    #[test]
    fn test_export_to_file_then_dry_run_import() {
        let tree = ConfigTree::standard().unwrap();
        let scratch = ConfigTree::empty().unwrap();
        let file = scratch.join("export.yaml");
        in_tree(&tree, &["export", "--output", file.to_str().unwrap()])
            .assert()
            .success();
        assert!(scratch.read("export.yaml").unwrap().contains("_metadata"));

        in_tree(&tree, &["import", file.to_str().unwrap(), "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("is a valid configuration"));
    }

    #[test]
    fn test_import_invalid_file_fails() {
        let tree = ConfigTree::standard().unwrap();
        let scratch = ConfigTree::empty().unwrap();
        let file = scratch.write("bad.json", r#"{"api": {"workers": 0}}"#).unwrap();
        in_tree(&tree, &["import", file.to_str().unwrap()])
            .assert()
            .failure();
        assert!(tree.read("default.yaml").unwrap().contains("name: strata"));
    }

    #[test]
    fn test_import_replaces_live_file() {
        let tree = ConfigTree::standard().unwrap();
        let scratch = ConfigTree::empty().unwrap();
        let file = scratch
            .write("new.yaml", "system:\n  name: imported\n  version: 2.0.0\n")
            .unwrap();
        in_tree(&tree, &["import", file.to_str().unwrap()])
            .assert()
            .success()
            .stdout(predicate::str::contains("Imported"));

        in_tree(&tree, &["get", "system.name"])
            .assert()
            .success()
            .stdout("imported\n");
        assert!(tree.exists("restored.json"));
        assert!(tree.read("default.yaml").unwrap().contains("name: strata"));
    }
}

mod versions {
    use super::*;
    use predicates::prelude::predicate;
    use serde_json::json;

    #[test]
    fn test_backup_is_deduplicated() {
        let tree = ConfigTree::standard().unwrap();
        in_tree(&tree, &["versions", "backup", "--reason", "first", "--tag", "baseline"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Stored main v1"));
        in_tree(&tree, &["versions", "backup"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Stored main v1"));

        let list = stdout_json(&mut in_tree(&tree, &["versions", "list", "--json"]));
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["tags"], json!(["baseline"]));
        assert!(tree.exists("backups/versions.json"));
    }

    #[test]
    fn test_rollback_round_trip() {
        let tree = ConfigTree::standard().unwrap();
        in_tree(&tree, &["versions", "backup"]).assert().success();
        tree.write("override.yaml", "api:\n  workers: 8\n").unwrap();
        in_tree(&tree, &["versions", "backup"])
            .assert()
            .success()
            .stdout(predicate::str::contains("v2"));

        let diff = stdout_json(&mut in_tree(&tree, &["versions", "diff", "1", "2", "--json"]));
        assert_eq!(diff["modified"], json!(["api"]));

        tree.remove("override.yaml").unwrap();
        in_tree(&tree, &["versions", "rollback", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("previous state saved as v3"));

        in_tree(&tree, &["get", "api.workers"])
            .assert()
            .success()
            .stdout("1\n");
        let list = stdout_json(&mut in_tree(&tree, &["versions", "list", "--type", "rollback", "--json"]));
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["version"], json!(3));
        assert!(
            list[0]["tags"]
                .as_array()
                .unwrap()
                .contains(&json!("rollback_to:v1"))
        );
    }

    #[test]
    fn test_rollback_pins_until_release() {
        let tree = ConfigTree::standard().unwrap();
        in_tree(&tree, &["versions", "backup"]).assert().success();
        in_tree(&tree, &["versions", "rollback", "1"])
            .assert()
            .success()
            .stderr(predicate::str::contains("versions release"));

        tree.write("override.yaml", "api:\n  workers: 8\n").unwrap();
        in_tree(&tree, &["get", "api.workers"])
            .assert()
            .success()
            .stdout("1\n");

        in_tree(&tree, &["versions", "release"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Released"));
        assert!(!tree.exists("restored.json"));
        in_tree(&tree, &["get", "api.workers"])
            .assert()
            .success()
            .stdout("8\n");
        in_tree(&tree, &["versions", "release"])
            .assert()
            .success()
            .stderr(predicate::str::contains("No restored configuration"));
    }

    #[test]
    fn test_rollback_unknown_version_fails() {
        let tree = ConfigTree::standard().unwrap();
        in_tree(&tree, &["versions", "backup"]).assert().success();
        let before = tree.read("default.yaml").unwrap();
        in_tree(&tree, &["versions", "rollback", "9"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Version not found"));
        assert_eq!(tree.read("default.yaml").unwrap(), before);
    }

    #[test]
    fn test_show_with_content() {
        let tree = ConfigTree::standard().unwrap();
        in_tree(&tree, &["versions", "backup"]).assert().success();
        let details = stdout_json(&mut in_tree(&tree, &["versions", "show", "1", "--content", "--json"]));
        assert_eq!(details["version"], json!(1));
        assert_eq!(details["version_type"], json!("manual"));
        assert_eq!(details["content"]["api"]["workers"], json!(1));
        assert_eq!(details["payload_present"], json!(true));
    }

    #[test]
    fn test_tag_verify_and_stats() {
        let tree = ConfigTree::standard().unwrap();
        in_tree(&tree, &["versions", "backup"]).assert().success();
        in_tree(&tree, &["versions", "tag", "1", "release", "stable"])
            .assert()
            .success()
            .stdout(predicate::str::contains("release, stable"));
        in_tree(&tree, &["versions", "verify"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1 version(s) verified"));

        let stats = stdout_json(&mut in_tree(&tree, &["versions", "stats", "--json"]));
        assert_eq!(stats["total_versions"], json!(1));
        assert_eq!(stats["by_type"]["manual"], json!(1));
    }

    #[test]
    fn test_delete_requires_confirmation() {
        let tree = ConfigTree::standard().unwrap();
        in_tree(&tree, &["versions", "backup"]).assert().success();
        in_tree(&tree, &["versions", "delete", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Re-run with --yes"));
        in_tree(&tree, &["versions", "delete", "1", "--yes"])
            .assert()
            .success();
        let list = stdout_json(&mut in_tree(&tree, &["versions", "list", "--json"]));
        assert_eq!(list, json!([]));
    }
}
