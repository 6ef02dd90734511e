use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use warden_runtime::plan::NodeKind;
use warden_runtime::{
    InMemoryActionRegistry, RunInput, RuntimeConfig, StaticSecretsProvider, WorkflowService,
};

/// Secrets file layout: `secrets` maps name to `{key: value}`, `grants` maps role to names
#[derive(Debug, Default, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    secrets: Value,
    #[serde(default)]
    grants: HashMap<String, Vec<String>>,
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn parse_json(flag: &str, raw: Option<&str>) -> Result<Value> {
    match raw {
        Some(raw) => {
            serde_json::from_str(raw).with_context(|| format!("Invalid JSON for --{}", flag))
        }
        None => Ok(Value::Null),
    }
}

fn load_secrets(path: Option<&Path>) -> Result<StaticSecretsProvider> {
    let Some(path) = path else {
        return Ok(StaticSecretsProvider::new());
    };
    let file: SecretsFile = serde_yaml::from_str(&read(path)?)
        .with_context(|| format!("Invalid secrets file {}", path.display()))?;
    let secrets = if file.secrets.is_null() {
        json!({})
    } else {
        file.secrets
    };
    let mut provider = StaticSecretsProvider::from_value(secrets)?;
    for (role, names) in file.grants {
        provider = provider.grant(role, names);
    }
    Ok(provider)
}

fn service(secrets: StaticSecretsProvider) -> WorkflowService {
    WorkflowService::builder()
        .config(RuntimeConfig::from_env())
        .registry(Arc::new(InMemoryActionRegistry::with_builtins()))
        .secrets(Arc::new(secrets))
        .build()
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Check a definition and print its execution order
pub fn validate(file: &Path) -> Result<()> {
    let service = service(StaticSecretsProvider::new());
    let definition = service.load(&read(file)?)?;
    let plan = service.validate(&definition)?;

    let actions: Vec<Value> = plan
        .ordered()
        .map(|node| {
            let kind = match &node.kind {
                NodeKind::Action => "action",
                NodeKind::Scatter => "scatter",
                NodeKind::Gather { .. } => "gather",
            };
            json!({
                "ref": node.action_ref(),
                "action": node.statement.action,
                "kind": kind,
                "scope": node.run_scope,
            })
        })
        .collect();
    print(&json!({ "valid": true, "title": definition.title, "actions": actions }))
}

/// Arguments of the `run` subcommand
pub struct RunArgs<'a> {
    pub file: &'a Path,
    pub trigger: Option<&'a str>,
    pub inputs: Option<&'a str>,
    pub role: Option<String>,
    pub secrets: Option<&'a Path>,
}

/// Execute a definition to completion and print the result
pub async fn run(args: RunArgs<'_>) -> Result<()> {
    let service = service(load_secrets(args.secrets)?);
    let definition = service.load(&read(args.file)?)?;
    let input = RunInput {
        trigger: parse_json("trigger", args.trigger)?,
        inputs: parse_json("inputs", args.inputs)?,
        role: args.role,
    };

    let workflow_id = service.start(definition, input).await?;
    info!(%workflow_id, file = %args.file.display(), "Run started");

    let outcome = tokio::select! {
        result = service.run_to_completion(workflow_id) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!(%workflow_id, "Received shutdown signal");
            service.cancel(workflow_id, "interrupted").await?;
            service.result(workflow_id).await?
        }
    };
    service.shutdown();

    print(&serde_json::to_value(&outcome)?)?;
    if !outcome.is_success() {
        bail!("run {} finished as {:?}", workflow_id, outcome.status);
    }
    Ok(())
}

/// Print the actions the built-in registry provides
pub fn actions() -> Result<()> {
    print(&json!(InMemoryActionRegistry::with_builtins().names()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_runtime::SecretsProvider;

    fn temp_file(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("warden-{}.yaml", uuid::Uuid::now_v7()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_parse_json_flags() {
        assert_eq!(parse_json("trigger", None).unwrap(), Value::Null);
        assert_eq!(
            parse_json("trigger", Some(r#"{"ip": "10.0.0.1"}"#)).unwrap(),
            json!({"ip": "10.0.0.1"})
        );
        let err = parse_json("inputs", Some("{nope")).unwrap_err();
        assert!(err.to_string().contains("--inputs"));
    }

    #[tokio::test]
    async fn test_secrets_file_applies_grants() {
        let path = temp_file(
            r#"
secrets:
  vt:
    api_key: k-123
grants:
  analyst: [vt]
"#,
        );
        let provider = load_secrets(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        let names = vec!["vt".to_string()];
        let creds = provider.resolve(Some("analyst"), &names).await.unwrap();
        assert_eq!(creds.get("vt"), Some(&json!({"api_key": "k-123"})));
        assert!(provider.resolve(Some("intern"), &names).await.is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_action() {
        let path = temp_file(
            r#"
actions:
  - ref: a
    action: does.not.exist
"#,
        );
        let result = validate(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
