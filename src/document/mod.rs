//! The static document loaded into every sandboxed output surface.
//!
//! The document is self-contained: styling, a content policy and one inline
//! script that renders primitive MIME types and reports lifecycle and
//! interaction events to the parent window. It never references host code.

use std::collections::{BTreeMap, BTreeSet};

use html_escape::{encode_double_quoted_attribute, encode_text};
use serde::{Deserialize, Serialize};

/// Capability grant applied to the sandboxed surface.
///
/// Same-origin access is deliberately absent; that omission is what keeps
/// output code away from the host's document, storage and privileged APIs.
pub const SANDBOX_ATTRIBUTES: &str = "allow-scripts allow-downloads allow-forms \
allow-pointer-lock allow-popups allow-popups-to-escape-sandbox allow-modals";

const SAME_ORIGIN_TOKEN: &str = "allow-same-origin";

const _: () = assert!(!contains(SANDBOX_ATTRIBUTES, SAME_ORIGIN_TOKEN));

/// Content policy for the generated document. The sandbox attribute is the
/// primary isolation; this policy is the second line of defense.
pub const CONTENT_SECURITY_POLICY: &str = "default-src 'self' blob: data:; \
script-src 'self' 'unsafe-inline' 'unsafe-eval' blob: data:; \
style-src 'self' 'unsafe-inline' blob: data:; \
img-src * data: blob:; \
font-src * data: blob:; \
connect-src *; \
media-src 'self' blob: data:";

const HANDLER_SCRIPT: &str = include_str!("handler.js");
const BASE_STYLESHEET: &str = include_str!("sandbox.css");

const fn contains(haystack: &str, needle: &str) -> bool {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.len() > haystack.len() {
        return false;
    }
    let mut start = 0;
    while start + needle.len() <= haystack.len() {
        let mut offset = 0;
        while offset < needle.len() && haystack[start + offset] == needle[offset] {
            offset += 1;
        }
        if offset == needle.len() {
            return true;
        }
        start += 1;
    }
    false
}

/// The sandbox attribute string as a token set.
pub fn sandbox_tokens() -> BTreeSet<&'static str> {
    SANDBOX_ATTRIBUTES.split_ascii_whitespace().collect()
}

/// Host theme mirrored into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Theme {
    #[serde(default)]
    pub dark: bool,
    /// Custom properties (`--name` -> value) applied to the document root.
    #[serde(default)]
    pub css_variables: BTreeMap<String, String>,
}

impl Theme {
    pub fn light() -> Self {
        Self::default()
    }

    pub fn dark() -> Self {
        Self {
            dark: true,
            ..Self::default()
        }
    }

    fn root_style(&self) -> String {
        self.css_variables
            .iter()
            .filter(|(name, _)| name.starts_with("--"))
            .map(|(name, value)| format!("{name}: {value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone)]
pub struct DocumentOptions {
    pub theme: Theme,
    pub title: String,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            title: String::from("output"),
        }
    }
}

/// A generated sandbox document, ready to be loaded into a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxDocument {
    html: String,
}

impl SandboxDocument {
    pub fn generate(options: &DocumentOptions) -> Self {
        let theme_name = if options.theme.dark { "dark" } else { "light" };
        let root_style = options.theme.root_style();

        let mut html = String::with_capacity(
            HANDLER_SCRIPT.len() + BASE_STYLESHEET.len() + CONTENT_SECURITY_POLICY.len() + 512,
        );
        html.push_str("<!DOCTYPE html>\n");
        html.push_str("<html lang=\"en\" data-theme=\"");
        html.push_str(theme_name);
        html.push('"');
        if !root_style.is_empty() {
            html.push_str(" style=\"");
            html.push_str(&encode_double_quoted_attribute(&root_style));
            html.push('"');
        }
        html.push_str(">\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str("<meta http-equiv=\"Content-Security-Policy\" content=\"");
        html.push_str(&encode_double_quoted_attribute(CONTENT_SECURITY_POLICY));
        html.push_str("\">\n");
        html.push_str(
            "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n",
        );
        html.push_str("<title>");
        html.push_str(&encode_text(&options.title));
        html.push_str("</title>\n<style>\n");
        html.push_str(BASE_STYLESHEET);
        html.push_str("</style>\n</head>\n<body>\n<div id=\"root\"></div>\n<script>\n");
        html.push_str(HANDLER_SCRIPT);
        html.push_str("</script>\n</body>\n</html>\n");

        Self { html }
    }

    pub fn html(&self) -> &str {
        &self.html
    }

    pub fn into_html(self) -> String {
        self.html
    }

    /// Surfaces must apply exactly this grant when loading the document.
    pub fn sandbox_attributes(&self) -> &'static str {
        SANDBOX_ATTRIBUTES
    }

    pub fn content_security_policy(&self) -> &'static str {
        CONTENT_SECURITY_POLICY
    }
}
