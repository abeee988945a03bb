use std::path::Path;

use anyhow::{anyhow, Context, Result};
use kube::core::DynamicObject;
use serde::Deserialize;

/// Parse a multi-document YAML stream into desired objects. Empty documents are skipped.
pub fn parse_desired(text: &str) -> Result<Vec<DynamicObject>> {
    let mut out = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("document {}", i + 1))?;
        if value.is_null() {
            continue;
        }
        let obj: DynamicObject = serde_yaml::from_value(value).with_context(|| format!("document {}", i + 1))?;
        if obj.types.is_none() {
            return Err(anyhow!("document {}: missing apiVersion/kind", i + 1));
        }
        if obj.metadata.uid.is_some() || obj.metadata.resource_version.is_some() {
            return Err(anyhow!("document {}: desired objects must not carry uid or resourceVersion", i + 1));
        }
        out.push(obj);
    }
    Ok(out)
}

pub fn load_desired(path: &Path) -> Result<Vec<DynamicObject>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_desired(&text).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_every_document_and_skips_empty_ones() {
        let yaml = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  k: v\n---\n---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: b\nspec:\n  replicas: 2\n";
        let objs = parse_desired(yaml).unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0].types.as_ref().unwrap().kind, "ConfigMap");
        assert_eq!(objs[0].data["data"]["k"], serde_json::json!("v"));
        assert_eq!(objs[1].data["spec"]["replicas"], serde_json::json!(2));
    }

    #[test]
    fn rejects_documents_without_type_or_with_server_fields() {
        let e1 = parse_desired("metadata:\n  name: x\n").unwrap_err();
        assert!(format!("{:#}", e1).contains("document 1"), "{:#}", e1);
        let e2 = parse_desired("apiVersion: v1\nkind: Secret\nmetadata:\n  name: x\n  uid: abc\n").unwrap_err();
        assert!(e2.to_string().contains("must not carry uid"), "{}", e2);
    }
}
