//! Challenge and failure page lookup.
//!
//! Built-in pages live under the `core/` namespace. Operators can override
//! them per public hostname and URL path by dropping `.hbs` files into a
//! directory tree:
//!
//! ```text
//! <root>/example.com/challenge.hbs          every path on example.com
//! <root>/example.com/admin/failed.hbs       /admin and everything below it
//! ```
//!
//! Lookups pick the override registered for the longest matching path
//! prefix and fall back to `core/<name>`. A top-level `core` directory is
//! ignored so overrides can never replace the built-in pages for every
//! host. Path segments are matched percent-decoded.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use serde::Serialize;
use thiserror::Error;

/// Namespace of the built-in pages.
pub const CORE_NAMESPACE: &str = "core";

/// Page asking the client to solve the challenge.
pub const CHALLENGE_TEMPLATE: &str = "challenge";

/// Page shown when the authority rejects a proof.
pub const FAILED_TEMPLATE: &str = "failed";

const TEMPLATE_EXTENSION: &str = "hbs";

const CORE_TEMPLATES: [(&str, &str); 2] = [
    (CHALLENGE_TEMPLATE, include_str!("../templates/challenge.hbs")),
    (FAILED_TEMPLATE, include_str!("../templates/failed.hbs")),
];

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid template {name}: {reason}")]
    Invalid { name: String, reason: String },

    #[error("failed to read templates under {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to render template {name}: {reason}")]
    Render { name: String, reason: String },
}

/// Values every page is rendered with.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PageContext {
    pub site_key: String,
    pub request_id: String,
    pub post_action: String,
}

/// Read-only index of the core pages plus operator overrides.
#[derive(Debug)]
pub struct TemplateResolver {
    registry: Handlebars<'static>,
}

impl TemplateResolver {
    /// Index the built-in pages only.
    pub fn core_only() -> Result<Self, TemplateError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);

        for (name, source) in CORE_TEMPLATES {
            let key = format!("{CORE_NAMESPACE}/{name}");
            register(&mut registry, &key, source)?;
        }

        Ok(Self { registry })
    }

    /// Index the built-in pages and every override under `root`.
    ///
    /// A missing root is not an error: the server then runs with the
    /// built-in pages alone.
    pub fn load(root: &Path) -> Result<Self, TemplateError> {
        let mut resolver = Self::core_only()?;

        if !root.is_dir() {
            tracing::warn!(path = %root.display(), "template override directory not found, using built-in pages");
            return Ok(resolver);
        }

        let mut found = Vec::new();
        collect_overrides(root, root, &mut found).map_err(|source| TemplateError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        for (name, path) in found {
            let source = fs::read_to_string(&path).map_err(|source| TemplateError::Io {
                path: path.clone(),
                source,
            })?;
            register(&mut resolver.registry, &name, &source)?;
            tracing::debug!(name = %name, path = %path.display(), "registered template override");
        }

        Ok(resolver)
    }

    /// Whether a template is registered under exactly `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.registry.has_template(name)
    }

    /// Most specific template name for `host` and `path`.
    ///
    /// `host` must be the public hostname the client asked for, without a
    /// port.
    pub fn resolve(&self, host: &str, path: &str, name: &str) -> String {
        if is_usable_host(host) {
            let host = host.to_ascii_lowercase();
            let segments = clean_segments(path);

            for depth in (0..=segments.len()).rev() {
                let candidate = if depth == 0 {
                    format!("{host}/{name}")
                } else {
                    format!("{host}/{}/{name}", segments[..depth].join("/"))
                };
                tracing::debug!(candidate = %candidate, "looking for template override");
                if self.registry.has_template(&candidate) {
                    return candidate;
                }
            }
        }

        format!("{CORE_NAMESPACE}/{name}")
    }

    /// Render a registered template.
    pub fn render<T: Serialize>(&self, name: &str, data: &T) -> Result<String, TemplateError> {
        self.registry
            .render(name, data)
            .map_err(|e| TemplateError::Render {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    /// Resolve then render in one step.
    pub fn render_for(
        &self,
        host: &str,
        path: &str,
        name: &str,
        context: &PageContext,
    ) -> Result<String, TemplateError> {
        let resolved = self.resolve(host, path, name);
        tracing::debug!(template = %resolved, host = %host, path = %path, "resolved template");
        self.render(&resolved, context)
    }
}

fn register(
    registry: &mut Handlebars<'static>,
    name: &str,
    source: &str,
) -> Result<(), TemplateError> {
    registry
        .register_template_string(name, source)
        .map_err(|e| TemplateError::Invalid {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

/// Recursively gather `(name, file)` pairs for every `.hbs` file below `dir`.
fn collect_overrides(root: &Path, dir: &Path, found: &mut Vec<(String, PathBuf)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if dir == root && entry.file_name().eq_ignore_ascii_case(CORE_NAMESPACE) {
                tracing::warn!(path = %path.display(), "skipping override directory named after the built-in namespace");
                continue;
            }
            collect_overrides(root, &path, found)?;
        } else if file_type.is_file()
            && path.extension().is_some_and(|ext| ext == TEMPLATE_EXTENSION)
        {
            match override_name(root, &path) {
                Some(name) => found.push((name, path)),
                None => {
                    tracing::warn!(path = %path.display(), "skipping template override outside a host directory");
                }
            }
        }
    }
    Ok(())
}

/// `<root>/Example.com/a/challenge.hbs` becomes `example.com/a/challenge`.
fn override_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let mut parts = relative
        .components()
        .map(|c| c.as_os_str().to_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()?;

    // Files directly under the root are not tied to a host.
    if parts.len() < 2 {
        return None;
    }
    parts[0] = parts[0].to_ascii_lowercase();
    Some(parts.join("/"))
}

fn is_usable_host(host: &str) -> bool {
    !host.is_empty() && host != "." && host != ".." && !host.contains('/')
}

/// Normalise a URL path into decoded segments, resolving `.` and `..`.
///
/// A segment that is not valid UTF-8 once decoded, or that decodes to
/// something containing `/`, is kept as received.
fn clean_segments(path: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    for raw in path.split('/') {
        let segment = match urlencoding::decode(raw) {
            Ok(decoded) if !decoded.contains('/') => decoded.into_owned(),
            _ => raw.to_string(),
        };
        match segment.as_str() {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    segments
}
