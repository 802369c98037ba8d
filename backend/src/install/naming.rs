//! Destination naming from profile templates

use super::InstallError;
use crate::catalog::CatalogEntry;
use std::path::{Path, PathBuf};

const PLACEHOLDERS: &[&str] = &["Title", "Region", "Regions", "Platform", "Slug"];

fn field(entry: &CatalogEntry, name: &str) -> Option<String> {
    let value = match name {
        "Title" => entry.title.clone(),
        "Region" => entry.regions.first().cloned().unwrap_or_default(),
        "Regions" => entry.regions.join(", "),
        "Platform" => entry.platform.clone(),
        "Slug" => entry.slug.clone(),
        _ => return None,
    };
    Some(value)
}

/// Expand `{Placeholder}`s in `template` with fields of `entry`.
pub fn render_template(template: &str, entry: &CatalogEntry) -> Result<String, InstallError> {
    let mut out = String::with_capacity(template.len() + entry.title.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') | None => {
                            return Err(InstallError::InvalidTemplate(format!(
                                "unclosed placeholder in {template:?}"
                            )))
                        }
                        Some(c) => name.push(c),
                    }
                }
                let value = field(entry, &name).ok_or_else(|| {
                    InstallError::InvalidTemplate(format!(
                        "unknown placeholder {{{name}}}, expected one of {}",
                        PLACEHOLDERS.join(", ")
                    ))
                })?;
                out.push_str(&value);
            }
            '}' => {
                return Err(InstallError::InvalidTemplate(format!(
                    "unbalanced '}}' in {template:?}"
                )))
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Reject templates with unknown placeholders or unbalanced braces.
pub fn check_template(template: &str) -> Result<(), InstallError> {
    let sample = CatalogEntry {
        slug: "sample".into(),
        title: "Sample".into(),
        platform: "sample".into(),
        regions: vec!["World".into()],
        links: vec![],
    };
    for part in template.split(['/', '\\']) {
        render_template(part, &sample)?;
    }
    Ok(())
}

/// Drop `()` / `[]` groups left behind by empty fields and tidy spaces.
fn tidy_segment(segment: &str) -> String {
    let mut text = segment.to_string();
    loop {
        let before = text.len();
        for empty in ["()", "[]", "( )", "[ ]"] {
            text = text.replace(empty, "");
        }
        if text.len() == before {
            break;
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve the final path of an install under `root`.
///
/// Only `/` in the template itself creates subdirectories; separators coming
/// from catalog fields are sanitized away with the rest of the segment.
/// `extension` is appended to the last segment.
pub fn destination_path(
    root: &Path,
    template: &str,
    entry: &CatalogEntry,
    extension: Option<&str>,
) -> Result<PathBuf, InstallError> {
    if template.starts_with(['/', '\\']) {
        return Err(InstallError::InvalidPath(format!(
            "template renders an absolute path: {template:?}"
        )));
    }

    let mut segments = Vec::new();
    for part in template.split(['/', '\\']) {
        let segment = tidy_segment(&render_template(part, entry)?);
        if segment.is_empty() {
            continue;
        }
        if segment == "." || segment == ".." {
            return Err(InstallError::InvalidPath(format!(
                "template escapes the library root: {template:?}"
            )));
        }
        let clean = tidy_segment(&sanitize_filename::sanitize(&segment));
        let clean = clean.trim_end_matches('.').to_string();
        if clean.is_empty() {
            return Err(InstallError::InvalidTemplate(format!(
                "segment {segment:?} is empty after sanitizing"
            )));
        }
        segments.push(clean);
    }

    let Some(last) = segments.pop() else {
        return Err(InstallError::InvalidTemplate(format!(
            "template {template:?} renders an empty filename"
        )));
    };

    let filename = match extension.map(sanitize_filename::sanitize) {
        Some(ext) if !ext.is_empty() => format!("{last}.{ext}"),
        _ => last,
    };

    let mut path = root.to_path_buf();
    path.extend(segments);
    path.push(filename);
    Ok(path)
}
