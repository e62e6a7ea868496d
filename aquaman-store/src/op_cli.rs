//! 1Password CLI (`op`) backend.
//!
//! Each credential is one Password-category item titled
//! `aquaman:<service>:<key>` in a dedicated vault, tagged so list operations
//! can filter to items this tool owns. The colon-separated title is
//! unambiguous because validated names cannot contain `:`.
//!
//! Arguments are always passed as an argv array, never interpolated into a
//! shell line, and metadata key names are validated against a strict
//! identifier pattern before they reach the CLI.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{CredentialMetadata, CredentialStore, StoreError, check_names};

const TITLE_PREFIX: &str = "aquaman";

#[derive(Debug)]
pub struct OpCliStore {
    vault: String,
    tag: String,
}

#[derive(Debug, Deserialize)]
struct OpItem {
    title: String,
}

#[derive(Debug, Deserialize)]
struct OpItemDetail {
    #[serde(default)]
    fields: Vec<OpField>,
}

#[derive(Debug, Deserialize)]
struct OpField {
    #[serde(default)]
    id: String,
    #[serde(default)]
    value: Option<String>,
}

struct OpOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn run_op(args: &[&str]) -> Result<OpOutput, StoreError> {
    debug!(args = ?args, "invoking op");
    let output = Command::new("op")
        .args(args)
        .output()
        .await
        .map_err(|e| StoreError::Unavailable(format!("op CLI not runnable: {e}")))?;
    Ok(OpOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("isn't an item") || stderr.contains("no item found")
}

/// Metadata key names must be plain identifiers before they are embedded in
/// a notes field handed to the CLI.
fn validate_metadata_field(name: &str) -> Result<(), StoreError> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidName(format!("metadata field {name:?}")))
    }
}

fn metadata_notes(metadata: &CredentialMetadata) -> Result<String, StoreError> {
    let mut pairs: Vec<(&str, &str)> = Vec::new();
    if let Some(source) = &metadata.source {
        pairs.push(("source", source));
    }
    if let Some(created_at) = &metadata.created_at {
        pairs.push(("created_at", created_at));
    }
    let mut notes = String::new();
    for (name, value) in pairs {
        validate_metadata_field(name)?;
        notes.push_str(name);
        notes.push('=');
        notes.push_str(value);
        notes.push('\n');
    }
    Ok(notes)
}

impl OpCliStore {
    /// Connect, verifying the CLI is installed and signed in. Either failure
    /// is fatal at daemon startup.
    pub async fn connect(vault: String, tag: String) -> Result<Self, StoreError> {
        let version = run_op(&["--version"]).await?;
        if !version.success {
            return Err(StoreError::Unavailable(
                "op CLI is installed but not functional".into(),
            ));
        }

        let whoami = run_op(&["whoami", "--format=json"]).await?;
        if !whoami.success {
            return Err(StoreError::Unavailable(format!(
                "op CLI is not signed in: {}",
                whoami.stderr.trim()
            )));
        }

        info!(version = %version.stdout.trim(), vault = %vault, "1Password CLI backend ready");
        Ok(Self { vault, tag })
    }

    fn title(service: &str, key: &str) -> String {
        format!("{TITLE_PREFIX}:{service}:{key}")
    }
}

#[async_trait]
impl CredentialStore for OpCliStore {
    async fn get(&self, service: &str, key: &str) -> Result<Option<String>, StoreError> {
        check_names(service, key)?;
        let title = Self::title(service, key);
        let out = run_op(&["item", "get", &title, "--vault", &self.vault, "--format", "json"]).await?;

        if !out.success {
            if is_not_found(&out.stderr) {
                return Ok(None);
            }
            return Err(StoreError::Backend(format!("op item get: {}", out.stderr.trim())));
        }

        let detail: OpItemDetail = serde_json::from_str(&out.stdout)
            .map_err(|e| StoreError::Backend(format!("op item get returned bad JSON: {e}")))?;
        Ok(detail
            .fields
            .into_iter()
            .find(|f| f.id == "password")
            .and_then(|f| f.value))
    }

    async fn set(
        &self,
        service: &str,
        key: &str,
        value: &str,
        metadata: Option<CredentialMetadata>,
    ) -> Result<(), StoreError> {
        check_names(service, key)?;
        let title = Self::title(service, key);
        let assignment = format!("password={value}");

        let edit = run_op(&["item", "edit", &title, "--vault", &self.vault, &assignment]).await?;
        if edit.success {
            return Ok(());
        }
        if !is_not_found(&edit.stderr) {
            return Err(StoreError::Backend(format!("op item edit: {}", edit.stderr.trim())));
        }

        let notes = metadata_notes(&metadata.unwrap_or_default())?;
        let notes_assignment = format!("notesPlain={notes}");
        let create = run_op(&[
            "item",
            "create",
            "--category",
            "Password",
            "--title",
            &title,
            "--vault",
            &self.vault,
            "--tags",
            &self.tag,
            &assignment,
            &notes_assignment,
        ])
        .await?;
        if create.success {
            Ok(())
        } else {
            Err(StoreError::Backend(format!("op item create: {}", create.stderr.trim())))
        }
    }

    async fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError> {
        check_names(service, key)?;
        let title = Self::title(service, key);
        let out = run_op(&["item", "delete", &title, "--vault", &self.vault]).await?;
        if out.success {
            Ok(true)
        } else if is_not_found(&out.stderr) {
            Ok(false)
        } else {
            Err(StoreError::Backend(format!("op item delete: {}", out.stderr.trim())))
        }
    }

    async fn list(&self, service: Option<&str>) -> Result<Vec<(String, String)>, StoreError> {
        let out = run_op(&[
            "item", "list", "--vault", &self.vault, "--tags", &self.tag, "--format", "json",
        ])
        .await?;
        if !out.success {
            return Err(StoreError::Backend(format!("op item list: {}", out.stderr.trim())));
        }

        let items: Vec<OpItem> = serde_json::from_str(&out.stdout)
            .map_err(|e| StoreError::Backend(format!("op item list returned bad JSON: {e}")))?;

        let mut pairs: Vec<(String, String)> = items
            .iter()
            .filter_map(|item| {
                let rest = item.title.strip_prefix(TITLE_PREFIX)?.strip_prefix(':')?;
                let (s, k) = rest.split_once(':')?;
                if service.is_none_or(|want| s == want) {
                    Some((s.to_string(), k.to_string()))
                } else {
                    None
                }
            })
            .collect();
        pairs.sort();
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_a_colon_triple() {
        assert_eq!(OpCliStore::title("ms-teams", "client_id"), "aquaman:ms-teams:client_id");
    }

    #[test]
    fn titles_parse_back_even_with_dashes_in_the_service() {
        let title = OpCliStore::title("ms-teams", "client_id");
        let rest = title.strip_prefix("aquaman").unwrap().strip_prefix(':').unwrap();
        let (s, k) = rest.split_once(':').unwrap();
        assert_eq!(s, "ms-teams");
        assert_eq!(k, "client_id");
    }

    #[test]
    fn metadata_field_names_are_strict_identifiers() {
        assert!(validate_metadata_field("source").is_ok());
        assert!(validate_metadata_field("created_at").is_ok());
        assert!(validate_metadata_field("a b").is_err());
        assert!(validate_metadata_field("x;rm -rf").is_err());
        assert!(validate_metadata_field("").is_err());
    }

    #[test]
    fn metadata_notes_encode_as_key_value_lines() {
        let notes = metadata_notes(&CredentialMetadata {
            source: Some("cli".into()),
            created_at: Some("2026-01-01T00:00:00Z".into()),
        })
        .unwrap();
        assert_eq!(notes, "source=cli\ncreated_at=2026-01-01T00:00:00Z\n");
    }

    #[test]
    fn not_found_detection_matches_op_phrasing() {
        assert!(is_not_found(r#""aquaman:x:y" isn't an item in the "aquaman" vault"#));
        assert!(!is_not_found("authorization failed"));
    }

    #[tokio::test]
    async fn unsafe_names_never_reach_the_cli() {
        let store = OpCliStore { vault: "aquaman".into(), tag: "aquaman".into() };
        assert!(matches!(
            store.get("svc; rm -rf /", "k").await,
            Err(StoreError::InvalidName(_))
        ));
    }
}
