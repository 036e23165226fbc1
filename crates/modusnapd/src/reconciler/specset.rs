//! Version specifier algebra
//!
//! Intersects the version constraints collected for one package across many
//! requirement files. Versions are compared as dotted numeric releases with a
//! lexicographic tail for suffixes like `rc1` or `.post1`; that covers the
//! requirement files in the wild without a full packaging-grammar port.
//! `===` and anything unrecognized is "not fully analyzable" and downgrades
//! the package to a conflict.

use std::cmp::Ordering;
use std::fmt;

/// A parsed version: numeric release components plus a non-numeric tail.
#[derive(Debug, Clone)]
pub struct PyVersion {
    pub raw: String,
    release: Vec<u64>,
    tail: String,
}

impl PyVersion {
    /// Parse a dotted version. Returns `None` when no leading numeric
    /// component exists (epochs, URLs, and friends).
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_start_matches('v');
        if trimmed.is_empty() || trimmed.contains('!') {
            return None;
        }
        let mut release = Vec::new();
        let mut tail = String::new();
        for (idx, component) in trimmed.split('.').enumerate() {
            let digits: String = component.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                if idx == 0 {
                    return None;
                }
                // Suffix component such as `post1` or `dev0`.
                tail = format!(".{component}");
                break;
            }
            release.push(digits.parse().ok()?);
            let rest = &component[digits.len()..];
            if !rest.is_empty() {
                // Suffix glued to a numeric component, e.g. `0rc1`.
                tail = rest.to_ascii_lowercase();
                break;
            }
        }
        if release.is_empty() {
            return None;
        }
        Some(Self {
            raw: trimmed.to_string(),
            release,
            tail,
        })
    }

    /// Compatible-release upper boundary: bump the second-to-last release
    /// component and drop the last (`1.15.3` -> `1.16`, `2` -> `3`).
    pub fn next_boundary(&self) -> PyVersion {
        let mut release = self.release.clone();
        if release.len() >= 2 {
            release.pop();
        }
        if let Some(last) = release.last_mut() {
            *last += 1;
        }
        let raw = release
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(".");
        PyVersion {
            raw,
            release,
            tail: String::new(),
        }
    }

    fn tail_rank(&self) -> u8 {
        if self.tail.is_empty() {
            1
        } else if self.tail.starts_with(".post") || self.tail.starts_with("post") {
            2
        } else {
            // Pre-releases and dev builds sort below the final release.
            0
        }
    }
}

impl PartialEq for PyVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PyVersion {}

impl PartialOrd for PyVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PyVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.release.len().max(other.release.len());
        for idx in 0..len {
            let a = self.release.get(idx).copied().unwrap_or(0);
            let b = other.release.get(idx).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => {}
                other => return other,
            }
        }
        self.tail_rank()
            .cmp(&other.tail_rank())
            .then_with(|| self.tail.cmp(&other.tail))
    }
}

impl fmt::Display for PyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[derive(Debug, Clone)]
struct Bound {
    version: PyVersion,
    inclusive: bool,
}

/// Accumulated constraints for one package.
#[derive(Debug, Default)]
pub struct SpecSet {
    raw_specs: Vec<String>,
    exacts: Vec<PyVersion>,
    exclusions: Vec<PyVersion>,
    lower: Option<Bound>,
    upper: Option<Bound>,
    unanalyzable: Vec<String>,
}

/// Outcome of intersecting every collected specifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Normalized specifier string admitting exactly the intersection;
    /// empty when the package is unconstrained.
    Compatible(String),
    Conflict(Vec<String>),
}

impl SpecSet {
    pub fn raw_specs(&self) -> &[String] {
        &self.raw_specs
    }

    /// Record one specifier such as `>=1.2`, `==1.0.*` or `~=1.15.3`.
    pub fn add(&mut self, spec: &str) {
        let spec = spec.trim();
        if spec.is_empty() {
            return;
        }
        self.raw_specs.push(spec.to_string());

        let (op, version_text) = split_operator(spec);
        match op {
            "===" => self.unanalyzable.push(spec.to_string()),
            "==" => {
                if let Some(stripped) = version_text.strip_suffix(".*") {
                    // Wildcard pin behaves like a compatible-release range.
                    match PyVersion::parse(stripped) {
                        Some(version) => {
                            let boundary = wildcard_boundary(&version);
                            self.push_lower(version, true);
                            self.push_upper(boundary, false);
                        }
                        None => self.unanalyzable.push(spec.to_string()),
                    }
                } else {
                    match PyVersion::parse(version_text) {
                        Some(version) => self.exacts.push(version),
                        None => self.unanalyzable.push(spec.to_string()),
                    }
                }
            }
            "!=" => match PyVersion::parse(version_text) {
                Some(version) => self.exclusions.push(version),
                None => self.unanalyzable.push(spec.to_string()),
            },
            ">=" | ">" => match PyVersion::parse(version_text) {
                Some(version) => self.push_lower(version, op == ">="),
                None => self.unanalyzable.push(spec.to_string()),
            },
            "<=" | "<" => match PyVersion::parse(version_text) {
                Some(version) => self.push_upper(version, op == "<="),
                None => self.unanalyzable.push(spec.to_string()),
            },
            "~=" => match PyVersion::parse(version_text) {
                Some(version) => {
                    let boundary = version.next_boundary();
                    self.push_lower(version, true);
                    self.push_upper(boundary, false);
                }
                None => self.unanalyzable.push(spec.to_string()),
            },
            _ => self.unanalyzable.push(spec.to_string()),
        }
    }

    fn push_lower(&mut self, version: PyVersion, inclusive: bool) {
        match &mut self.lower {
            Some(current) => match version.cmp(&current.version) {
                Ordering::Greater => *current = Bound { version, inclusive },
                Ordering::Equal => current.inclusive = current.inclusive && inclusive,
                Ordering::Less => {}
            },
            None => self.lower = Some(Bound { version, inclusive }),
        }
    }

    fn push_upper(&mut self, version: PyVersion, inclusive: bool) {
        match &mut self.upper {
            Some(current) => match version.cmp(&current.version) {
                Ordering::Less => *current = Bound { version, inclusive },
                Ordering::Equal => current.inclusive = current.inclusive && inclusive,
                Ordering::Greater => {}
            },
            None => self.upper = Some(Bound { version, inclusive }),
        }
    }

    fn admits(&self, version: &PyVersion) -> bool {
        if let Some(lower) = &self.lower {
            match version.cmp(&lower.version) {
                Ordering::Less => return false,
                Ordering::Equal if !lower.inclusive => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match version.cmp(&upper.version) {
                Ordering::Greater => return false,
                Ordering::Equal if !upper.inclusive => return false,
                _ => {}
            }
        }
        true
    }

    /// Intersect everything recorded so far.
    pub fn resolve(&self) -> Resolution {
        let mut reasons = Vec::new();

        for raw in &self.unanalyzable {
            reasons.push(format!("specifier '{raw}' is not fully analyzable"));
        }

        // Distinct exact pins contradict each other.
        if self.exacts.len() > 1 {
            let mut distinct: Vec<&PyVersion> = Vec::new();
            for exact in &self.exacts {
                if !distinct.iter().any(|v| *v == exact) {
                    distinct.push(exact);
                }
            }
            if distinct.len() > 1 {
                let pins = distinct
                    .iter()
                    .map(|v| format!("=={v}"))
                    .collect::<Vec<_>>()
                    .join(" and ");
                reasons.push(format!("multiple exact pins: {pins}"));
            }
        }

        if let (Some(lower), Some(upper)) = (&self.lower, &self.upper) {
            match lower.version.cmp(&upper.version) {
                Ordering::Greater => reasons.push(format!(
                    "lower bound {} is greater than upper bound {}",
                    lower.version, upper.version
                )),
                Ordering::Equal if !(lower.inclusive && upper.inclusive) => {
                    reasons.push(format!(
                        "bounds {} and {} admit no version (exclusive endpoint)",
                        render_bound(lower, true),
                        render_bound(upper, false)
                    ));
                }
                _ => {}
            }
        }

        if let Some(exact) = self.exacts.first() {
            if !self.admits(exact) {
                reasons.push(format!(
                    "exact pin =={exact} is outside bounds {}",
                    self.render_bounds()
                ));
            }
            if let Some(excluded) = self.exclusions.iter().find(|v| *v == exact) {
                reasons.push(format!(
                    "exact pin =={exact} is excluded by !={excluded}"
                ));
            }
        }

        // A range collapsed to a single admissible point that is excluded.
        if let (Some(lower), Some(upper)) = (&self.lower, &self.upper) {
            if lower.version == upper.version
                && lower.inclusive
                && upper.inclusive
                && self.exclusions.iter().any(|v| v == &lower.version)
            {
                reasons.push(format!(
                    "the only admissible version {} is excluded",
                    lower.version
                ));
            }
        }

        if !reasons.is_empty() {
            return Resolution::Conflict(reasons);
        }

        if let Some(exact) = self.exacts.first() {
            return Resolution::Compatible(format!("=={exact}"));
        }

        let mut parts = Vec::new();
        if let Some(lower) = &self.lower {
            parts.push(render_bound(lower, true));
        }
        if let Some(upper) = &self.upper {
            parts.push(render_bound(upper, false));
        }
        let mut in_range: Vec<&PyVersion> = self
            .exclusions
            .iter()
            .filter(|v| self.admits(v))
            .collect();
        in_range.sort();
        in_range.dedup_by(|a, b| a == b);
        for excluded in in_range {
            parts.push(format!("!={excluded}"));
        }
        Resolution::Compatible(parts.join(","))
    }

    /// Whether a concrete version satisfies every recorded constraint.
    /// Unanalyzable specifiers admit nothing.
    pub fn admits_version(&self, version: &PyVersion) -> bool {
        if !self.unanalyzable.is_empty() {
            return false;
        }
        if self.exacts.iter().any(|exact| exact != version) {
            return false;
        }
        if self.exclusions.iter().any(|excluded| excluded == version) {
            return false;
        }
        self.admits(version)
    }

    fn render_bounds(&self) -> String {
        let mut parts = Vec::new();
        if let Some(lower) = &self.lower {
            parts.push(render_bound(lower, true));
        }
        if let Some(upper) = &self.upper {
            parts.push(render_bound(upper, false));
        }
        parts.join(",")
    }
}

fn render_bound(bound: &Bound, is_lower: bool) -> String {
    let op = match (is_lower, bound.inclusive) {
        (true, true) => ">=",
        (true, false) => ">",
        (false, true) => "<=",
        (false, false) => "<",
    };
    format!("{op}{}", bound.version)
}

/// Wildcard `==X.Y.*` admits `[X.Y, X.(Y+1))`: bump the last named component.
fn wildcard_boundary(version: &PyVersion) -> PyVersion {
    let mut release = version.release.clone();
    if let Some(last) = release.last_mut() {
        *last += 1;
    }
    let raw = release
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(".");
    PyVersion {
        raw,
        release,
        tail: String::new(),
    }
}

fn split_operator(spec: &str) -> (&str, &str) {
    for op in ["===", "==", "!=", ">=", "<=", "~=", ">", "<"] {
        if let Some(rest) = spec.strip_prefix(op) {
            return (op, rest.trim());
        }
    }
    ("", spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(raw: &str) -> PyVersion {
        PyVersion::parse(raw).unwrap()
    }

    #[test]
    fn version_ordering() {
        assert!(version("1.16") > version("1.15.3"));
        assert!(version("0.47.0") < version("0.49.1"));
        assert_eq!(version("1.0"), version("1.0.0"));
        assert!(version("2.0.0rc1") < version("2.0.0"));
        assert!(version("2.0.0.post1") > version("2.0.0"));
    }

    #[test]
    fn unparseable_versions_are_rejected() {
        assert!(PyVersion::parse("").is_none());
        assert!(PyVersion::parse("1!2.0").is_none());
        assert!(PyVersion::parse("abc").is_none());
    }

    #[test]
    fn compatible_release_boundary() {
        assert_eq!(version("1.15.3").next_boundary().raw, "1.16");
        assert_eq!(version("1.15").next_boundary().raw, "2");
        assert_eq!(version("2").next_boundary().raw, "3");
    }

    #[test]
    fn simple_range_intersection() {
        let mut set = SpecSet::default();
        set.add(">=0.40.0");
        set.add("<0.47.0");
        set.add(">=0.42");
        assert_eq!(
            set.resolve(),
            Resolution::Compatible(">=0.42,<0.47.0".to_string())
        );
    }

    #[test]
    fn disjoint_bounds_conflict_with_bound_values_in_reason() {
        let mut set = SpecSet::default();
        set.add("<0.47.0");
        set.add(">=0.40.0");
        set.add(">=0.49.1");
        match set.resolve() {
            Resolution::Conflict(reasons) => {
                assert!(reasons
                    .iter()
                    .any(|r| r.contains("lower bound 0.49.1") && r.contains("upper bound 0.47.0")));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn equal_bounds_exclusive_conflict() {
        let mut set = SpecSet::default();
        set.add(">=1.2");
        set.add("<1.2");
        assert!(matches!(set.resolve(), Resolution::Conflict(_)));

        let mut set = SpecSet::default();
        set.add(">=1.2");
        set.add("<=1.2");
        assert_eq!(set.resolve(), Resolution::Compatible(">=1.2,<=1.2".into()));
    }

    #[test]
    fn exact_pin_within_bounds_wins() {
        let mut set = SpecSet::default();
        set.add(">=1.0");
        set.add("==1.5");
        set.add("<2.0");
        assert_eq!(set.resolve(), Resolution::Compatible("==1.5".to_string()));
    }

    #[test]
    fn exact_pin_outside_bounds_conflicts() {
        let mut set = SpecSet::default();
        set.add("==2.5");
        set.add("<2.0");
        assert!(matches!(set.resolve(), Resolution::Conflict(_)));
    }

    #[test]
    fn exact_pin_excluded_conflicts() {
        let mut set = SpecSet::default();
        set.add("==1.5");
        set.add("!=1.5");
        match set.resolve() {
            Resolution::Conflict(reasons) => {
                assert!(reasons.iter().any(|r| r.contains("excluded")));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn distinct_exact_pins_conflict() {
        let mut set = SpecSet::default();
        set.add("==1.5");
        set.add("==1.6");
        match set.resolve() {
            Resolution::Conflict(reasons) => {
                assert!(reasons.iter().any(|r| r.contains("multiple exact pins")));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_exact_pins_agree() {
        let mut set = SpecSet::default();
        set.add("==1.5");
        set.add("==1.5.0");
        assert_eq!(set.resolve(), Resolution::Compatible("==1.5".to_string()));
    }

    #[test]
    fn compatible_release_expands_to_range() {
        let mut set = SpecSet::default();
        set.add("~=1.15.3");
        assert_eq!(
            set.resolve(),
            Resolution::Compatible(">=1.15.3,<1.16".to_string())
        );
    }

    #[test]
    fn wildcard_pin_expands_to_range() {
        let mut set = SpecSet::default();
        set.add("==1.15.*");
        assert_eq!(
            set.resolve(),
            Resolution::Compatible(">=1.15,<1.16".to_string())
        );
    }

    #[test]
    fn arbitrary_equality_is_conflict() {
        let mut set = SpecSet::default();
        set.add("===1.5");
        match set.resolve() {
            Resolution::Conflict(reasons) => {
                assert!(reasons.iter().any(|r| r.contains("not fully analyzable")));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn exclusions_outside_range_are_dropped_from_output() {
        let mut set = SpecSet::default();
        set.add(">=2.0");
        set.add("!=1.0");
        set.add("!=2.5");
        assert_eq!(
            set.resolve(),
            Resolution::Compatible(">=2.0,!=2.5".to_string())
        );
    }

    #[test]
    fn unconstrained_package_resolves_to_empty_specifier() {
        let set = SpecSet::default();
        assert_eq!(set.resolve(), Resolution::Compatible(String::new()));
    }
}
