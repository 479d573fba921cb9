//! Minimal `{{name}}` template rendering
//!
//! Templates are plain text with `{{variable}}` placeholders. Variables
//! come from the manifest `[host.vars]` table plus gathered facts. An
//! unknown placeholder is an error, not silently left in place - a config
//! file with a literal `{{listen_port}}` in it is never what anyone wants.

use anyhow::{Context, Result, bail};
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap());

/// Render a template string with the given variables
pub fn render(template: &str, vars: &HashMap<String, String>) -> Result<String> {
    let mut missing: Vec<String> = Vec::new();

    let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures| {
        let name = &caps[1];
        vars.get(name).cloned().unwrap_or_else(|| {
            missing.push(name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        bail!("undefined template variables: {}", missing.join(", "));
    }

    Ok(rendered.into_owned())
}

/// Render a template file with the given variables
pub fn render_file(path: &Path, vars: &HashMap<String, String>) -> Result<String> {
    let template = std::fs::read_to_string(path)
        .with_context(|| format!("could not read template {}", path.display()))?;
    render(&template, vars)
        .with_context(|| format!("could not render template {}", path.display()))
}

/// List the placeholder names used by a template, in order of appearance
pub fn placeholders(template: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = caps[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn renders_simple_placeholder() {
        let result = render("port={{port}}", &vars(&[("port", "8000")])).unwrap();
        assert_eq!(result, "port=8000");
    }

    #[test]
    fn whitespace_inside_braces_is_allowed() {
        let result = render("{{ app_name }} here", &vars(&[("app_name", "bot")])).unwrap();
        assert_eq!(result, "bot here");
    }

    #[test]
    fn repeated_placeholder_renders_everywhere() {
        let result = render("{{x}}-{{x}}", &vars(&[("x", "a")])).unwrap();
        assert_eq!(result, "a-a");
    }

    #[test]
    fn unknown_placeholder_is_an_error() {
        let err = render("{{port}} and {{host}}", &vars(&[("port", "80")])).unwrap_err();
        assert!(err.to_string().contains("host"));
        assert!(!err.to_string().contains("port"));
    }

    #[test]
    fn text_without_placeholders_passes_through() {
        let nginx = "server { listen 80; }";
        assert_eq!(render(nginx, &HashMap::new()).unwrap(), nginx);
    }

    #[test]
    fn single_braces_are_not_placeholders() {
        let result = render("fn main() { body }", &HashMap::new()).unwrap();
        assert_eq!(result, "fn main() { body }");
    }

    #[test]
    fn lists_placeholders_in_order() {
        let names = placeholders("{{b}} {{a}} {{b}}");
        assert_eq!(names, ["b", "a"]);
    }
}
