use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use scriptdeck_core::ScriptDefinition;
use scriptdeck_core::ScriptId;

/// Reads the script catalog: a JSON array of script definitions.
pub fn load_catalog(path: &Path) -> Result<Vec<ScriptDefinition>> {
    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read script catalog: {}", path.display()))?;
    let scripts: Vec<ScriptDefinition> = serde_json::from_slice(&data)
        .with_context(|| format!("Invalid script catalog: {}", path.display()))?;

    let mut seen = std::collections::HashSet::new();
    for script in &scripts {
        if !seen.insert(&script.id) {
            bail!("duplicate script id `{}` in {}", script.id, path.display());
        }
    }
    Ok(scripts)
}

pub fn select<'a>(
    catalog: &'a [ScriptDefinition],
    ids: &[String],
) -> Result<Vec<&'a ScriptDefinition>> {
    ids.iter()
        .map(|raw| {
            let id = ScriptId::new(raw.as_str());
            catalog
                .iter()
                .find(|script| script.id == id)
                .with_context(|| format!("no script named `{raw}` in the catalog"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn rejects_duplicate_ids() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("scripts.json");
        std::fs::write(
            &path,
            r#"[{"id": "a", "command": "true"}, {"id": "a", "command": "false"}]"#,
        )
        .expect("write");
        let err = load_catalog(&path).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn select_finds_scripts_in_request_order() {
        let catalog = vec![
            ScriptDefinition::new("a", "true"),
            ScriptDefinition::new("b", "true"),
        ];
        let picked = select(&catalog, &["b".to_string(), "a".to_string()]).expect("select");
        let ids: Vec<_> = picked.iter().map(|script| script.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        assert!(select(&catalog, &["zzz".to_string()]).is_err());
    }
}
