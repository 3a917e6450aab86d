//! Cluster credential document handling.
//!
//! The control plane returns a kubeconfig whose first user carries either a
//! local-account client certificate or an exec plugin. Sessions replace that
//! identity with the caller's own cluster token so every request is made as
//! the delegated user.

use kubecred_core::{CredentialError, CredentialResult};
use serde_yaml::{Mapping, Value};

/// Parse a document that may be YAML or JSON.
pub fn parse_document(raw: &str) -> CredentialResult<Value> {
    let yaml_error = match serde_yaml::from_str::<Value>(raw) {
        Ok(value) if value.is_mapping() => return Ok(value),
        Ok(_) => "document is not a mapping".to_string(),
        Err(e) => e.to_string(),
    };
    let json: serde_json::Value = serde_json::from_str(raw).map_err(|_| {
        CredentialError::kubeconfig_generation_failed(format!(
            "Failed to parse kubeconfig: {yaml_error}"
        ))
    })?;
    let value = serde_yaml::to_value(json).map_err(|e| {
        CredentialError::kubeconfig_generation_failed(format!("Failed to convert kubeconfig: {e}"))
    })?;
    if value.is_mapping() {
        Ok(value)
    } else {
        Err(CredentialError::kubeconfig_generation_failed(
            "Failed to parse kubeconfig: document is not a mapping",
        ))
    }
}

/// Replace the first user's identity with `token` under `user_object_id`.
///
/// Contexts that referenced the old user name are pointed at the new name;
/// when none did, the first context is.
pub fn rewrite_identity(doc: &mut Value, user_object_id: &str, token: &str) -> CredentialResult<()> {
    let old_name = {
        let users = sequence_mut(doc, "users")?;
        let first = users[0].as_mapping_mut().ok_or_else(|| {
            CredentialError::kubeconfig_generation_failed("users[0] is not a mapping")
        })?;

        let old_name = first
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);

        let replaced_local_account = first
            .get("user")
            .and_then(Value::as_mapping)
            .is_some_and(|user| user.contains_key("client-certificate-data"));
        if replaced_local_account {
            tracing::warn!(
                old_user = old_name.as_deref().unwrap_or("-"),
                "replacing local-account client certificate with delegated token"
            );
        }

        let mut identity = Mapping::new();
        identity.insert(Value::from("token"), Value::from(token));
        first.insert(Value::from("user"), Value::Mapping(identity));
        first.insert(Value::from("name"), Value::from(user_object_id));
        old_name
    };

    let contexts = sequence_mut(doc, "contexts")?;
    let mut updated = 0usize;
    if let Some(old_name) = old_name.as_deref() {
        for context in contexts.iter_mut() {
            let Some(inner) = context
                .as_mapping_mut()
                .and_then(|c| c.get_mut("context"))
                .and_then(Value::as_mapping_mut)
            else {
                continue;
            };
            if inner.get("user").and_then(Value::as_str) == Some(old_name) {
                inner.insert(Value::from("user"), Value::from(user_object_id));
                updated += 1;
            }
        }
    }

    if updated == 0 {
        let first = contexts[0].as_mapping_mut().ok_or_else(|| {
            CredentialError::kubeconfig_generation_failed("contexts[0] is not a mapping")
        })?;
        if !first.contains_key("context") {
            first.insert(Value::from("context"), Value::Mapping(Mapping::new()));
        }
        let inner = first.get_mut("context").and_then(Value::as_mapping_mut).ok_or_else(|| {
            CredentialError::kubeconfig_generation_failed("contexts[0].context is not a mapping")
        })?;
        inner.insert(Value::from("user"), Value::from(user_object_id));
    }

    Ok(())
}

/// Parse, rewrite, and re-serialize a control-plane document as YAML.
pub fn render_for_user(raw: &str, user_object_id: &str, token: &str) -> CredentialResult<String> {
    let mut doc = parse_document(raw)?;
    rewrite_identity(&mut doc, user_object_id, token)?;
    serde_yaml::to_string(&doc).map_err(|e| {
        CredentialError::kubeconfig_generation_failed(format!("Failed to serialize kubeconfig: {e}"))
    })
}

/// Identity embedded in a rendered document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedIdentity {
    pub user_name: String,
    pub token: String,
}

/// Read back the first user's name and token, if present.
pub fn embedded_identity(raw: &str) -> Option<EmbeddedIdentity> {
    let doc = parse_document(raw).ok()?;
    let first = doc.get("users")?.as_sequence()?.first()?;
    Some(EmbeddedIdentity {
        user_name: first.get("name")?.as_str()?.to_string(),
        token: first.get("user")?.get("token")?.as_str()?.to_string(),
    })
}

/// What a session needs to know about its document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KubeconfigSummary {
    pub current_context: Option<String>,
    pub cluster: Option<String>,
    pub server: Option<String>,
    pub namespace: Option<String>,
}

/// Resolve the current context (or the first one) to its cluster and server.
pub fn summarize(raw: &str) -> CredentialResult<KubeconfigSummary> {
    let doc = parse_document(raw)?;
    let contexts = doc
        .get("contexts")
        .and_then(Value::as_sequence)
        .cloned()
        .unwrap_or_default();

    let current = doc
        .get("current-context")
        .and_then(Value::as_str)
        .map(str::to_string);
    let context = current
        .as_deref()
        .and_then(|name| {
            contexts
                .iter()
                .find(|c| c.get("name").and_then(Value::as_str) == Some(name))
        })
        .or_else(|| contexts.first());

    let inner = context.and_then(|c| c.get("context"));
    let cluster = inner
        .and_then(|c| c.get("cluster"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let namespace = inner
        .and_then(|c| c.get("namespace"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let server = cluster.as_deref().and_then(|name| {
        doc.get("clusters")?
            .as_sequence()?
            .iter()
            .find(|c| c.get("name").and_then(Value::as_str) == Some(name))?
            .get("cluster")?
            .get("server")?
            .as_str()
            .map(str::to_string)
    });

    Ok(KubeconfigSummary {
        current_context: current.or_else(|| {
            context
                .and_then(|c| c.get("name"))
                .and_then(Value::as_str)
                .map(str::to_string)
        }),
        cluster,
        server,
        namespace,
    })
}

fn sequence_mut<'a>(doc: &'a mut Value, field: &str) -> CredentialResult<&'a mut Vec<Value>> {
    match doc.get_mut(field).and_then(Value::as_sequence_mut) {
        Some(seq) if !seq.is_empty() => Ok(seq),
        _ => Err(CredentialError::kubeconfig_generation_failed(format!(
            "kubeconfig has no {field}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubecred_core::ErrorKind;
    use kubecred_test_utils::fixtures;

    #[test]
    fn test_rewrite_replaces_certificate_user() {
        let rendered = render_for_user(&fixtures::aks_user_kubeconfig(), "oid-123", "cluster-token").unwrap();
        let doc: Value = serde_yaml::from_str(&rendered).unwrap();

        let user = &doc["users"][0];
        assert_eq!(user["name"].as_str(), Some("oid-123"));
        assert_eq!(user["user"]["token"].as_str(), Some("cluster-token"));
        assert!(user["user"].get("client-certificate-data").is_none());
        assert_eq!(doc["contexts"][0]["context"]["user"].as_str(), Some("oid-123"));
        // untouched fields survive
        assert_eq!(doc["contexts"][0]["context"]["namespace"].as_str(), Some("workloads"));
        assert_eq!(doc["current-context"].as_str(), Some("aks-prod"));
    }

    #[test]
    fn test_rewrite_accepts_json_documents() {
        let rendered = render_for_user(&fixtures::aks_exec_kubeconfig_json(), "oid", "tok").unwrap();
        let identity = embedded_identity(&rendered).unwrap();
        assert_eq!(identity.user_name, "oid");
        assert_eq!(identity.token, "tok");
        assert!(!rendered.contains("kubelogin"));
    }

    #[test]
    fn test_every_context_of_old_user_is_updated() {
        let raw = r#"
users:
- name: shared
  user: { token: old }
contexts:
- name: a
  context: { cluster: c1, user: shared }
- name: b
  context: { cluster: c2, user: someone-else }
- name: c
  context: { cluster: c3, user: shared }
"#;
        let rendered = render_for_user(raw, "me", "t").unwrap();
        let doc: Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(doc["contexts"][0]["context"]["user"].as_str(), Some("me"));
        assert_eq!(doc["contexts"][1]["context"]["user"].as_str(), Some("someone-else"));
        assert_eq!(doc["contexts"][2]["context"]["user"].as_str(), Some("me"));
    }

    #[test]
    fn test_first_context_used_when_no_reference_matches() {
        let raw = "users:\n- name: x\n  user: {}\ncontexts:\n- name: a\n  context:\n    cluster: c\n    user: y\n";
        let rendered = render_for_user(raw, "me", "t").unwrap();
        let doc: Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(doc["contexts"][0]["context"]["user"].as_str(), Some("me"));
    }

    #[test]
    fn test_missing_users_or_contexts_rejected() {
        let err = render_for_user(&fixtures::kubeconfig_without_users(), "me", "t").unwrap_err();
        assert_eq!(err.kind, ErrorKind::KubeconfigGenerationFailed);

        let err = render_for_user("users:\n- name: x\n  user: {}\n", "me", "t").unwrap_err();
        assert_eq!(err.kind, ErrorKind::KubeconfigGenerationFailed);
    }

    #[test]
    fn test_unparseable_document_rejected() {
        for raw in ["", "- just\n- a list\n", "{not json", "plain scalar"] {
            let err = render_for_user(raw, "me", "t").unwrap_err();
            assert_eq!(err.kind, ErrorKind::KubeconfigGenerationFailed, "{raw:?}");
        }
    }

    #[test]
    fn test_summary_resolves_current_context() {
        let summary = summarize(&fixtures::aks_user_kubeconfig()).unwrap();
        assert_eq!(summary.current_context.as_deref(), Some("aks-prod"));
        assert_eq!(summary.cluster.as_deref(), Some("aks-prod"));
        assert_eq!(
            summary.server.as_deref(),
            Some("https://aks-prod-dns-12345678.hcp.westeurope.azmk8s.io:443")
        );
        assert_eq!(summary.namespace.as_deref(), Some("workloads"));
    }

    #[test]
    fn test_embedded_identity_absent_for_certificate_user() {
        assert!(embedded_identity(&fixtures::aks_user_kubeconfig()).is_none());
    }
}
