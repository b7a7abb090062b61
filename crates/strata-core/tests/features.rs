mod support;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use strata_core::error::Error;
use strata_core::feature::{
    FeatureDeployer, FeatureOptions, Prompter, Question, QuestionKind, deployed_features,
};
use strata_core::hooks::FeatureHooks;
use strata_core::remote::{MemoryRemote, RemoteApi};
use strata_core::script::{RegistryLoader, ScriptContext};
use strata_core::state::store::FEATURE_OBJECT_TYPE;
use strata_core::state::{FeatureRemoteState, REDACTED_MARKER};
use strata_core::types::VarMap;

use support::*;

fn write_feature(features: &Path, name: &str, descriptor: &str) -> std::path::PathBuf {
    let dir = features.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("feature.toml"), descriptor).unwrap();
    dir
}

fn insert_instance(remote: &MemoryRemote, name: &str, variables: Value) {
    remote.insert_object(
        FEATURE_OBJECT_TYPE,
        name,
        vars(json!({ "variables": variables.to_string() })),
    );
}

async fn stored_attr(remote: &MemoryRemote, name: &str, attr: &str) -> Option<Value> {
    let object = remote.get_object(FEATURE_OBJECT_TYPE, name).await.ok()?;
    let raw = object.attributes.get(attr)?.clone();
    match raw {
        Value::String(text) => serde_json::from_str(&text).ok(),
        other => Some(other),
    }
}

#[derive(Default)]
struct RecordingFeatureHooks {
    events: Mutex<Vec<String>>,
    seen: Mutex<Option<VarMap>>,
    fail_remove: bool,
    produced: Option<Vec<Question>>,
}

impl RecordingFeatureHooks {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeatureHooks for RecordingFeatureHooks {
    async fn before_deploy(&self, _ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        self.events.lock().unwrap().push("before_deploy".to_string());
        Ok(())
    }

    async fn questions(
        &self,
        _ctx: &ScriptContext<'_>,
        _state: &FeatureRemoteState,
    ) -> anyhow::Result<Option<Vec<Question>>> {
        self.events.lock().unwrap().push("questions".to_string());
        Ok(self.produced.clone())
    }

    async fn finish(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        self.events.lock().unwrap().push("finish".to_string());
        *self.seen.lock().unwrap() = Some(ctx.vars.clone());
        Ok(())
    }

    async fn remove(&self, ctx: &ScriptContext<'_>) -> anyhow::Result<()> {
        self.events.lock().unwrap().push("remove".to_string());
        *self.seen.lock().unwrap() = Some(ctx.vars.clone());
        if self.fail_remove {
            anyhow::bail!("remote cleanup failed");
        }
        Ok(())
    }
}

struct FixedAnswers(VarMap);

impl Prompter for FixedAnswers {
    fn ask(&self, questions: &[Question], _known: &VarMap) -> anyhow::Result<VarMap> {
        Ok(questions
            .iter()
            .filter_map(|q| self.0.get(&q.name).map(|v| (q.name.clone(), v.clone())))
            .collect())
    }
}

#[tokio::test]
async fn deploy_merges_defaults_stored_and_caller() {
    let temp = TempDir::new().unwrap();
    write_feature(temp.path(), "search", "[variables]\nx = 1\n");

    let remote = current_remote(&[]);
    insert_instance(&remote, "search", json!({"x": 2, "y": 3}));
    let ctx = context(&remote, RegistryLoader::new());

    let options = FeatureOptions {
        vars: vars(json!({"y": 4})),
        ..FeatureOptions::default()
    };
    let report = FeatureDeployer::new(&ctx, temp.path())
        .deploy("search", &options)
        .await
        .unwrap();

    assert_eq!(Value::Object(report.variables), json!({"x": 2, "y": 4}));
    assert!(!report.bootstrapped);
    assert_eq!(
        stored_attr(&remote, "search", "variables").await,
        Some(json!({"x": 2, "y": 4}))
    );
}

#[tokio::test]
async fn persisted_secrets_are_redacted_in_the_plain_record() {
    let temp = TempDir::new().unwrap();
    write_feature(temp.path(), "payments", "secret_variables = [\"token\"]\n");

    let remote = current_remote(&[]);
    let ctx = context(&remote, RegistryLoader::new());
    let options = FeatureOptions {
        vars: vars(json!({"token": "abc", "merchant": "m-1"})),
        persist_secrets: true,
        ..FeatureOptions::default()
    };
    let report = FeatureDeployer::new(&ctx, temp.path())
        .deploy("payments", &options)
        .await
        .unwrap();

    assert_eq!(report.variables.get("token"), Some(&json!(REDACTED_MARKER)));
    assert_eq!(
        stored_attr(&remote, "payments", "variables").await,
        Some(json!({"token": REDACTED_MARKER, "merchant": "m-1"}))
    );
    assert_eq!(
        stored_attr(&remote, "payments", "secretVariables").await,
        Some(json!({"token": "abc"}))
    );

    // A redeploy reuses the readable secret, never the marker
    let hooks = Arc::new(RecordingFeatureHooks::default());
    let feature_dir = temp.path().join("payments");
    touch(&feature_dir.join("feature.script"));
    let ctx = context(
        &remote,
        RegistryLoader::new().with_feature_hooks(feature_dir.join("feature.script"), hooks.clone()),
    );
    FeatureDeployer::new(&ctx, temp.path())
        .deploy("payments", &FeatureOptions::default())
        .await
        .unwrap();
    let seen = hooks.seen.lock().unwrap().clone().unwrap();
    assert_eq!(seen.get("token"), Some(&json!("abc")));
}

#[tokio::test]
async fn unpersisted_secrets_are_dropped() {
    let temp = TempDir::new().unwrap();
    write_feature(temp.path(), "payments", "secret_variables = [\"token\"]\n");

    let remote = current_remote(&[]);
    let ctx = context(&remote, RegistryLoader::new());
    let options = FeatureOptions {
        vars: vars(json!({"token": "abc"})),
        ..FeatureOptions::default()
    };
    FeatureDeployer::new(&ctx, temp.path())
        .deploy("payments", &options)
        .await
        .unwrap();

    assert_eq!(
        stored_attr(&remote, "payments", "variables").await,
        Some(json!({}))
    );
    assert_eq!(stored_attr(&remote, "payments", "secretVariables").await, None);
}

#[tokio::test]
async fn first_deploy_bootstraps_feature_state() {
    let temp = TempDir::new().unwrap();
    write_feature(temp.path(), "search", "");

    let remote = Arc::new(MemoryRemote::new());
    let ctx = context(&remote, RegistryLoader::new());
    let report = FeatureDeployer::new(&ctx, temp.path())
        .deploy("search", &FeatureOptions::default())
        .await
        .unwrap();

    assert!(report.bootstrapped);
    assert_eq!(remote.imports()[0].name, "strata_features_bootstrap");
    let state = ctx.state_store().read_feature_state().await.unwrap().unwrap();
    assert_eq!(state.features_schema_version, Some(1));
    assert!(state.registered_identities.contains_key(IDENTITY));
    assert!(state.instance("search").is_some());
}

#[tokio::test]
async fn feature_bootstrap_can_be_forbidden() {
    let temp = TempDir::new().unwrap();
    write_feature(temp.path(), "search", "");

    let remote = Arc::new(MemoryRemote::new());
    let ctx = context(&remote, RegistryLoader::new());
    let options = FeatureOptions {
        allow_bootstrap: false,
        ..FeatureOptions::default()
    };
    let err = FeatureDeployer::new(&ctx, temp.path())
        .deploy("search", &options)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::BootstrapRequired { scope: "features", .. }));
}

#[tokio::test]
async fn unknown_feature_is_not_found() {
    let temp = TempDir::new().unwrap();
    write_feature(temp.path(), "search", "");
    let remote = current_remote(&[]);
    let ctx = context(&remote, RegistryLoader::new());

    let err = FeatureDeployer::new(&ctx, temp.path())
        .deploy("missing", &FeatureOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotFound { what: "feature", .. }));
}

#[tokio::test]
async fn feature_units_record_into_the_feature_scope() {
    let temp = TempDir::new().unwrap();
    let dir = write_feature(temp.path(), "search", "");
    let unit = dir.join("migrations/0001-index.script");
    touch(&unit);

    let ran = Arc::new(AtomicUsize::new(0));
    let remote = current_remote(&["0001-index"]);
    let ctx = context(&remote, RegistryLoader::new().with_unit(&unit, counting(&ran)));
    let deployer = FeatureDeployer::new(&ctx, temp.path());

    let report = deployer
        .deploy("search", &FeatureOptions::default())
        .await
        .unwrap();

    // The project record holds the same id; feature scopes are separate
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(report.migrations.unwrap().executed, vec!["0001-index"]);
    assert_eq!(
        stored_attr(&remote, "search", "appliedUnits").await,
        Some(json!(["0001-index"]))
    );

    let again = deployer
        .deploy("search", &FeatureOptions::default())
        .await
        .unwrap();
    assert!(again.migrations.unwrap().executed.is_empty());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn code_artifacts_sync_except_excluded() {
    let temp = TempDir::new().unwrap();
    let dir = write_feature(
        temp.path(),
        "search",
        "exclude_cartridges = [\"int_search_tests\"]\n",
    );
    for cartridge in ["int_search", "int_search_tests", "app_search"] {
        let path = dir.join("cartridges").join(cartridge);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("package.json"), "{}").unwrap();
    }

    let remote = current_remote(&[]);
    let ctx = context(&remote, RegistryLoader::new());
    let report = FeatureDeployer::new(&ctx, temp.path())
        .deploy("search", &FeatureOptions::default())
        .await
        .unwrap();

    assert_eq!(report.artifacts, vec!["app_search", "int_search"]);
    assert_eq!(remote.code_uploads(), vec!["app_search", "int_search"]);
}

#[tokio::test]
async fn update_all_redeploys_only_locally_defined_instances() {
    let temp = TempDir::new().unwrap();
    write_feature(temp.path(), "search", "[variables]\npageSize = 12\n");
    write_feature(temp.path(), "reviews", "");

    let remote = current_remote(&[]);
    insert_instance(&remote, "search", json!({"pageSize": 48}));
    insert_instance(&remote, "legacy", json!({}));
    let ctx = context(&remote, RegistryLoader::new());

    let reports = FeatureDeployer::new(&ctx, temp.path())
        .update_all(&FeatureOptions::default())
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].name, "search");
    assert_eq!(reports[0].variables.get("pageSize"), Some(&json!(48)));
    assert!(remote.object(FEATURE_OBJECT_TYPE, "reviews").is_none());
    assert!(remote.object(FEATURE_OBJECT_TYPE, "legacy").is_some());
}

#[tokio::test]
async fn remove_hook_error_aborts_before_deletion() {
    let temp = TempDir::new().unwrap();
    let dir = write_feature(temp.path(), "search", "");
    let hooks_path = dir.join("feature.script");
    touch(&hooks_path);

    let hooks = Arc::new(RecordingFeatureHooks {
        fail_remove: true,
        ..RecordingFeatureHooks::default()
    });
    let remote = current_remote(&[]);
    insert_instance(&remote, "search", json!({"x": 1}));
    let ctx = context(
        &remote,
        RegistryLoader::new().with_feature_hooks(&hooks_path, hooks.clone()),
    );

    let err = FeatureDeployer::new(&ctx, temp.path())
        .remove("search", &VarMap::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Hook { hook: "remove", .. }));
    assert!(remote.object(FEATURE_OBJECT_TYPE, "search").is_some());
}

#[tokio::test]
async fn remove_runs_hook_with_merged_vars_then_deletes() {
    let temp = TempDir::new().unwrap();
    let dir = write_feature(temp.path(), "search", "[variables]\nx = 1\ny = 1\n");
    let hooks_path = dir.join("feature.script");
    touch(&hooks_path);

    let hooks = Arc::new(RecordingFeatureHooks::default());
    let remote = current_remote(&[]);
    insert_instance(&remote, "search", json!({"x": 2}));
    let ctx = context(
        &remote,
        RegistryLoader::new().with_feature_hooks(&hooks_path, hooks.clone()),
    );

    FeatureDeployer::new(&ctx, temp.path())
        .remove("search", &vars(json!({"y": 3})))
        .await
        .unwrap();

    let seen = hooks.seen.lock().unwrap().clone().unwrap();
    assert_eq!(Value::Object(seen), json!({"x": 2, "y": 3}));
    assert!(remote.object(FEATURE_OBJECT_TYPE, "search").is_none());
    assert!(deployed_features(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn prompter_answers_outstanding_questions() {
    let temp = TempDir::new().unwrap();
    write_feature(
        temp.path(),
        "search",
        r#"
[variables]
pageSize = 24

[[question]]
name = "pageSize"
message = "Page size"

[[question]]
name = "apiKey"
message = "API key"
type = "password"
"#,
    );

    let remote = current_remote(&[]);
    let ctx = context(&remote, RegistryLoader::new());
    let prompter = FixedAnswers(vars(json!({"pageSize": 99, "apiKey": "k-1"})));
    let report = FeatureDeployer::new(&ctx, temp.path())
        .with_prompter(&prompter)
        .deploy("search", &FeatureOptions::default())
        .await
        .unwrap();

    assert_eq!(report.answered, vec!["apiKey"]);
    assert_eq!(report.variables.get("apiKey"), Some(&json!("k-1")));
    assert_eq!(report.variables.get("pageSize"), Some(&json!(24)));
}

#[tokio::test]
async fn without_prompter_questions_stay_unanswered() {
    let temp = TempDir::new().unwrap();
    write_feature(
        temp.path(),
        "search",
        "[[question]]\nname = \"apiKey\"\nmessage = \"API key\"\n",
    );

    let remote = current_remote(&[]);
    let ctx = context(&remote, RegistryLoader::new());
    let report = FeatureDeployer::new(&ctx, temp.path())
        .deploy("search", &FeatureOptions::default())
        .await
        .unwrap();

    assert!(report.answered.is_empty());
    assert!(!report.variables.contains_key("apiKey"));
}

#[tokio::test]
async fn produced_questions_replace_the_static_list() {
    let temp = TempDir::new().unwrap();
    let dir = write_feature(
        temp.path(),
        "search",
        "[[question]]\nname = \"static\"\nmessage = \"Static\"\n",
    );
    let hooks_path = dir.join("feature.script");
    touch(&hooks_path);

    let hooks = Arc::new(RecordingFeatureHooks {
        produced: Some(vec![Question {
            name: "dynamic".to_string(),
            message: "Dynamic".to_string(),
            kind: QuestionKind::Confirm,
            default: None,
            choices: Vec::new(),
        }]),
        ..RecordingFeatureHooks::default()
    });
    let remote = current_remote(&[]);
    let ctx = context(
        &remote,
        RegistryLoader::new().with_feature_hooks(&hooks_path, hooks.clone()),
    );
    let prompter = FixedAnswers(vars(json!({"static": 1, "dynamic": true})));
    let report = FeatureDeployer::new(&ctx, temp.path())
        .with_prompter(&prompter)
        .deploy("search", &FeatureOptions::default())
        .await
        .unwrap();

    assert_eq!(report.answered, vec!["dynamic"]);
    assert_eq!(
        hooks.events(),
        vec!["before_deploy", "questions", "finish"]
    );
}

#[tokio::test]
async fn failed_first_deploy_leaves_no_instance() {
    let temp = TempDir::new().unwrap();
    let dir = write_feature(temp.path(), "search", "");
    let first = dir.join("migrations/0001-ok.script");
    let second = dir.join("migrations/0002-bad.script");
    touch(&first);
    touch(&second);

    let ran = Arc::new(AtomicUsize::new(0));
    let remote = current_remote(&[]);
    let failing_ctx = context(
        &remote,
        RegistryLoader::new()
            .with_unit(&first, counting(&ran))
            .with_unit(&second, failing("index build failed")),
    );
    let err = FeatureDeployer::new(&failing_ctx, temp.path())
        .deploy("search", &FeatureOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnitExecution { .. }));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(remote.object(FEATURE_OBJECT_TYPE, "search").is_none());
    assert!(deployed_features(&failing_ctx).await.unwrap().is_empty());

    let fixed_ctx = context(
        &remote,
        RegistryLoader::new()
            .with_unit(&first, counting(&ran))
            .with_unit(&second, counting(&ran)),
    );
    let report = FeatureDeployer::new(&fixed_ctx, temp.path())
        .deploy("search", &FeatureOptions::default())
        .await
        .unwrap();

    assert_eq!(
        report.migrations.unwrap().executed,
        vec!["0001-ok", "0002-bad"]
    );
    assert_eq!(
        stored_attr(&remote, "search", "appliedUnits").await,
        Some(json!(["0001-ok", "0002-bad"]))
    );
}

#[tokio::test]
async fn update_all_log_never_collides_with_a_feature_log() {
    let temp = TempDir::new().unwrap();
    write_feature(temp.path(), "all", "");

    let remote = current_remote(&[]);
    insert_instance(&remote, "all", json!({}));
    let ctx = context(&remote, RegistryLoader::new());

    FeatureDeployer::new(&ctx, temp.path())
        .update_all(&FeatureOptions::default())
        .await
        .unwrap();

    let paths: Vec<String> = remote.files().into_keys().collect();
    assert_eq!(paths.len(), 2, "{paths:?}");
    assert!(paths.iter().any(|p| p.starts_with("Logs/strata/feature-all-")));
    assert!(paths.iter().any(|p| p.starts_with("Logs/strata/features-update-")));
}
