//! Dependency-graph reconciliation
//!
//! Scans every third-party requirement file under `custom_nodes/`, intersects
//! the collected version specifiers per package, and emits one installable
//! constraint file plus an explicit conflict report. Output ordering is
//! stable by package name so repeated runs are byte-identical.

mod specset;

pub use specset::{PyVersion, Resolution, SpecSet};

use crate::locator::BackendLocation;
use anyhow::{Context, Result};
use modusnap_common::{DependencyAuditReport, RequirementConflict};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Cap on reported conflicts and unparsed lines.
const REPORT_CAP: usize = 200;
/// Directory recursion guard; packs keep requirements near their root.
const MAX_DEPTH: usize = 4;

#[derive(Debug, Default)]
struct PackageGroup {
    specs: SpecSet,
    markers: Vec<String>,
}

/// Scan the backend and write the three reconciliation artifacts.
pub fn run(location: &BackendLocation) -> Result<DependencyAuditReport> {
    let files = find_requirement_files(&location.custom_nodes_dir);
    info!(
        "reconciling {} requirement files under {}",
        files.len(),
        location.custom_nodes_dir.display()
    );

    let mut groups: BTreeMap<String, PackageGroup> = BTreeMap::new();
    let mut unparsed_lines = Vec::new();

    for file in &files {
        let contents = match std::fs::read_to_string(file) {
            Ok(contents) => contents,
            Err(err) => {
                debug!("skipping unreadable {}: {err}", file.display());
                continue;
            }
        };
        for line in contents.lines() {
            match parse_requirement_line(line) {
                ParsedLine::Requirement {
                    name,
                    specs,
                    marker,
                } => {
                    let group = groups.entry(name).or_default();
                    for spec in specs {
                        group.specs.add(&spec);
                    }
                    if let Some(marker) = marker {
                        if !group.markers.contains(&marker) {
                            group.markers.push(marker);
                        }
                    }
                }
                ParsedLine::Skip => {}
                ParsedLine::Unparsed => {
                    if unparsed_lines.len() < REPORT_CAP {
                        unparsed_lines
                            .push(format!("{}: {}", file.display(), line.trim()));
                    }
                }
            }
        }
    }

    let mut compatible_lines = Vec::new();
    let mut incompatible_lines = Vec::new();
    let mut conflicts = Vec::new();

    for (name, group) in &groups {
        match group.specs.resolve() {
            Resolution::Compatible(spec) => {
                compatible_lines.push(format!("{name}{spec}"));
            }
            Resolution::Conflict(reasons) => {
                incompatible_lines.push(format!(
                    "{name} :: {} :: {}",
                    group.specs.raw_specs().join(" | "),
                    reasons.join("; ")
                ));
                if conflicts.len() < REPORT_CAP {
                    conflicts.push(RequirementConflict {
                        package: name.clone(),
                        specs: group.specs.raw_specs().to_vec(),
                        markers: group.markers.clone(),
                        reasons,
                    });
                }
            }
        }
    }

    let compatible_path = location.compatible_requirements_path();
    let incompatible_path = location.incompatible_requirements_path();
    let report_path = location.dependency_report_path();

    write_atomic(&compatible_path, &join_lines(&compatible_lines))?;
    write_atomic(&incompatible_path, &join_lines(&incompatible_lines))?;

    let report = DependencyAuditReport {
        files_scanned: files.len(),
        packages_scanned: groups.len(),
        conflicts,
        compatible_requirement_count: compatible_lines.len(),
        compatible_requirements_path: compatible_path.display().to_string(),
        incompatible_requirements_path: incompatible_path.display().to_string(),
        report_path: report_path.display().to_string(),
        unparsed_lines,
    };
    let json =
        serde_json::to_string_pretty(&report).context("failed to serialize audit report")?;
    write_atomic(&report_path, &json)?;

    Ok(report)
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n", lines.join("\n"))
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Requirement files under `custom_nodes/`: any `*.txt` whose name contains
/// `requirements`, skipping `.disabled` paths. Sorted for determinism.
fn find_requirement_files(custom_nodes_dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    walk(custom_nodes_dir, 0, &mut found);
    found.sort();
    found
}

fn walk(dir: &Path, depth: usize, found: &mut Vec<PathBuf>) {
    if depth > MAX_DEPTH {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.to_string_lossy().contains(".disabled") {
            continue;
        }
        if path.is_dir() {
            walk(&path, depth + 1, found);
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if name.contains("requirements") && name.ends_with(".txt") {
            found.push(path);
        }
    }
}

enum ParsedLine {
    Requirement {
        name: String,
        specs: Vec<String>,
        marker: Option<String>,
    },
    Skip,
    Unparsed,
}

/// Parse one requirement line. Blanks, comments and `-r`/`--` directives are
/// skipped; URL requirements and other unrecognized shapes are recorded as
/// unparsed but never fail the scan.
fn parse_requirement_line(line: &str) -> ParsedLine {
    let mut text = line.trim();
    if text.is_empty() || text.starts_with('#') || text.starts_with('-') {
        return ParsedLine::Skip;
    }
    if let Some(idx) = text.find(" #") {
        text = text[..idx].trim_end();
    }

    let (requirement, marker) = match text.split_once(';') {
        Some((req, marker)) => (req.trim(), Some(marker.trim().to_string())),
        None => (text, None),
    };

    if requirement.contains('@') || requirement.contains("://") {
        return ParsedLine::Unparsed;
    }

    let name_end = requirement
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'))
        .unwrap_or(requirement.len());
    let raw_name = &requirement[..name_end];
    if raw_name.is_empty() || !raw_name.chars().next().unwrap().is_ascii_alphanumeric() {
        return ParsedLine::Unparsed;
    }

    let mut rest = requirement[name_end..].trim();
    // Optional extras such as `[gpu]`.
    if rest.starts_with('[') {
        match rest.find(']') {
            Some(close) => rest = rest[close + 1..].trim(),
            None => return ParsedLine::Unparsed,
        }
    }
    // Legacy parenthesized specifiers: `pkg (>=1.0)`.
    let rest = rest
        .strip_prefix('(')
        .and_then(|inner| inner.strip_suffix(')'))
        .unwrap_or(rest)
        .trim();

    if !rest.is_empty() && !rest.starts_with(['<', '>', '=', '!', '~']) {
        return ParsedLine::Unparsed;
    }

    let specs = rest
        .split(',')
        .map(str::trim)
        .filter(|spec| !spec.is_empty())
        .map(str::to_string)
        .collect();

    ParsedLine::Requirement {
        name: normalize_name(raw_name),
        specs,
        marker,
    }
}

/// Canonical package name: lowercase, underscores folded to hyphens.
pub fn normalize_name(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace('_', "-")
}
