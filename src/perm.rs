//! Permission projection.
//!
//! Compiles the XML policy file into the per-session JSON feature mask
//! sent as `perm: <json>`. For a permission name P, each category lists
//! the entities whose attribute named P is "true". The exception is
//! `toolbar`, which enumerates the items to disable, so its condition
//! is "false".

use serde_json::json;
use std::path::Path;

use crate::error::{BrokerError, Result};

const CATEGORIES: [&str; 4] = ["text", "spreadsheet", "presentation", "toolbar"];
const FALLBACK_FILE: &str = "perm.xml";

/// Project one permission name out of a policy document.
///
/// Deterministic: the same XML and permission yield byte-identical JSON.
pub fn project(xml: &str, permission: &str) -> Result<String> {
    let doc = roxmltree::Document::parse(xml).map_err(|e| BrokerError::Xml(e.to_string()))?;

    let mut mask = serde_json::Map::new();
    mask.insert("perm".into(), json!(permission));
    for category in CATEGORIES {
        mask.insert(category.into(), json!(category_entities(&doc, category, permission)));
    }
    Ok(serde_json::Value::Object(mask).to_string())
}

fn category_entities(doc: &roxmltree::Document, category: &str, permission: &str) -> Vec<String> {
    // Disabled toolbar items are flagged with "false".
    let wanted = if category == "toolbar" { "false" } else { "true" };

    let mut entities = Vec::new();
    for section in doc
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == category)
    {
        for child in section.children().filter(|n| n.is_element()) {
            if child.attribute(permission) == Some(wanted) {
                entities.push(child.text().unwrap_or("").trim().to_string());
            }
        }
    }
    entities
}

/// Read the policy file and project the given permission.
///
/// Prefers the configured path; falls back to `perm.xml` in the working
/// directory.
pub fn load_mask(configured: Option<&Path>, permission: &str) -> Result<String> {
    let path = match configured {
        Some(p) if p.exists() => p.to_path_buf(),
        _ => Path::new(FALLBACK_FILE).to_path_buf(),
    };
    let xml = std::fs::read_to_string(&path)?;
    project(&xml, permission)
}
