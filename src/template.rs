//! `{{placeholder}}` substitution for commands, paths, and download URLs.

use std::collections::BTreeMap;

use thiserror::Error;

/// Template rendering failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown placeholder '{{{{{name}}}}}' in '{template}'")]
    UnknownPlaceholder { name: String, template: String },

    #[error("unterminated placeholder in '{0}'")]
    Unterminated(String),

    #[error("empty placeholder in '{0}'")]
    Empty(String),
}

/// Named values available to a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    values: BTreeMap<String, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// List the placeholder names used by `template`, in order of appearance.
pub fn placeholders(template: &str) -> Result<Vec<String>, TemplateError> {
    let mut names = Vec::new();
    scan(template, |name| {
        names.push(name.to_string());
        Ok(String::new())
    })?;
    Ok(names)
}

/// Substitute every placeholder in `template` from `vars`.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    scan(template, |name| {
        vars.get(name)
            .map(str::to_string)
            .ok_or_else(|| TemplateError::UnknownPlaceholder {
                name: name.to_string(),
                template: template.to_string(),
            })
    })
}

/// Check that every placeholder in `template` is either set in `vars` or
/// starts with one of `deferred_prefixes` (resolved later, e.g. tool paths).
pub fn check(
    template: &str,
    vars: &TemplateVars,
    deferred_prefixes: &[&str],
) -> Result<(), TemplateError> {
    for name in placeholders(template)? {
        if vars.contains(&name) || deferred_prefixes.iter().any(|p| name.starts_with(p)) {
            continue;
        }
        return Err(TemplateError::UnknownPlaceholder {
            name,
            template: template.to_string(),
        });
    }
    Ok(())
}

fn scan<F>(template: &str, mut resolve: F) -> Result<String, TemplateError>
where
    F: FnMut(&str) -> Result<String, TemplateError>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(template.to_string()))?;
        let name = after[..end].trim();
        if name.is_empty() {
            return Err(TemplateError::Empty(template.to_string()));
        }
        out.push_str(&resolve(name)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}
