use anyhow::{anyhow, Result};
use kuchiki::traits::*;
use kuchiki::{parse_html, NodeRef};
use serde_json::{json, Map, Value};

/// What a parsed sandbox document declares about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentSummary {
    pub content_security_policy: Option<String>,
    pub theme: Option<String>,
    pub root_style: Option<String>,
    pub has_root: bool,
    pub inline_scripts: usize,
    pub external_scripts: usize,
}

/// Inline classic script bodies in document order. External and non-JS
/// scripts are skipped.
pub fn collect_inline_scripts(html: &str) -> Result<Vec<String>> {
    let parsed = parse_html().one(html);
    let selector = parsed
        .select("script")
        .map_err(|_| anyhow!("failed to compile selector"))?;

    let mut collected = Vec::new();
    for script in selector {
        let attributes = script.attributes.borrow();
        if attributes.get("src").is_some() || !is_classic(attributes.get("type")) {
            continue;
        }
        drop(attributes);
        let code = script.text_contents();
        if code.trim().is_empty() {
            continue;
        }
        collected.push(code);
    }
    Ok(collected)
}

pub fn inspect_document(html: &str) -> Result<DocumentSummary> {
    let parsed = parse_html().one(html);
    let mut summary = DocumentSummary::default();

    let metas = parsed
        .select("meta[http-equiv]")
        .map_err(|_| anyhow!("failed to compile selector"))?;
    for meta in metas {
        let attributes = meta.attributes.borrow();
        let is_policy = attributes
            .get("http-equiv")
            .is_some_and(|value| value.eq_ignore_ascii_case("content-security-policy"));
        if is_policy {
            summary.content_security_policy = attributes.get("content").map(str::to_string);
        }
    }

    if let Ok(root) = parsed.select_first("html") {
        let attributes = root.attributes.borrow();
        summary.theme = attributes.get("data-theme").map(str::to_string);
        summary.root_style = attributes.get("style").map(str::to_string);
    }

    summary.has_root = parsed.select_first("#root").is_ok();

    let scripts = parsed
        .select("script")
        .map_err(|_| anyhow!("failed to compile selector"))?;
    for script in scripts {
        if script.attributes.borrow().get("src").is_some() {
            summary.external_scripts += 1;
        } else {
            summary.inline_scripts += 1;
        }
    }

    Ok(summary)
}

/// Parse an HTML fragment into a JSON node tree for the window shim.
///
/// Elements become `{"tag", "attrs", "children"}`, text becomes
/// `{"text"}`; comments and doctypes are dropped.
pub fn fragment_tree(markup: &str) -> Result<Value> {
    let parsed = parse_html().one(format!(
        "<!DOCTYPE html><html><head></head><body>{markup}</body></html>"
    ));
    let body = parsed
        .select_first("body")
        .map_err(|_| anyhow!("fragment has no body"))?;
    Ok(Value::Array(
        body.as_node().children().filter_map(|child| node_json(&child)).collect(),
    ))
}

fn node_json(node: &NodeRef) -> Option<Value> {
    if let Some(text) = node.as_text() {
        return Some(json!({ "text": text.borrow().as_str() }));
    }
    let element = node.as_element()?;
    let attrs: Map<String, Value> = element
        .attributes
        .borrow()
        .map
        .iter()
        .map(|(name, attr)| (name.local.to_string(), Value::String(attr.value.clone())))
        .collect();
    let children: Vec<Value> = node.children().filter_map(|child| node_json(&child)).collect();
    Some(json!({
        "tag": element.name.local.to_string(),
        "attrs": attrs,
        "children": children,
    }))
}

fn is_classic(script_type: Option<&str>) -> bool {
    match script_type {
        None => true,
        Some(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "" | "text/javascript" | "application/javascript" | "text/ecmascript"
        ),
    }
}
