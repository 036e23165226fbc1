//! Bounded heuristic repair of a dirty environment
//!
//! Drives `pip check` toward green: canned recipes for well-known conflict
//! signatures, extracted-specifier installs for the rest, and a prune pass
//! that removes conflicting parents not on the protected list. The ruleset
//! is a data table; the loop terminates on success, on a repeated
//! extracted-spec set, or after a fixed number of rounds.

use crate::locator::BackendLocation;
use crate::reconciler::normalize_name;
use crate::subprocess::{self, INSTALL_TIMEOUT, PROBE_TIMEOUT};
use modusnap_common::EnvStep;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Heal and prune round bounds.
pub const MAX_HEAL_ROUNDS: usize = 6;
pub const MAX_PRUNE_ROUNDS: usize = 6;

/// Packages the prune pass may never remove, before the per-backend
/// requirement names are added.
const PROTECTED_PACKAGES: &[&str] = &[
    "pip",
    "setuptools",
    "wheel",
    "torch",
    "torchvision",
    "torchaudio",
    "comfyui-manager",
    "comfyui_frontend_package",
];

struct HealRecipe {
    name: &'static str,
    /// Fires when any of these substrings matches the check output.
    any_of: &'static [&'static str],
    /// Fires only when every one of these matches.
    all_of: &'static [&'static str],
    installs: &'static [&'static [&'static str]],
}

const RECIPES: &[HealRecipe] = &[
    HealRecipe {
        name: "media-stack-pins",
        any_of: &["shaderflow", "depthflow", "rembg", "gradio"],
        all_of: &[],
        installs: &[
            &[
                "-m",
                "pip",
                "install",
                "scipy~=1.15.3",
                "pillow<12",
                "rembg==2.0.69",
                "onnxruntime",
            ],
            &[
                "-m",
                "pip",
                "install",
                "--no-deps",
                "gradio==5.35.0",
                "shaderflow==0.9.1",
            ],
        ],
    },
    HealRecipe {
        name: "fastapi-sse-starlette",
        any_of: &[],
        all_of: &["fastapi", "sse-starlette"],
        installs: &[&[
            "-m",
            "pip",
            "install",
            "starlette>=0.40.0,<0.47.0",
            "sse-starlette<3.0",
        ]],
    },
    HealRecipe {
        name: "typer-click",
        any_of: &[],
        all_of: &["typer", "click"],
        installs: &[&[
            "-m",
            "pip",
            "install",
            "typer==0.15.4",
            "typer-slim==0.15.4",
            "click<8.2,>=8.0.0",
        ]],
    },
];

impl HealRecipe {
    fn matches(&self, output: &str) -> bool {
        if !self.all_of.is_empty() {
            return self.all_of.iter().all(|needle| output.contains(needle));
        }
        self.any_of.iter().any(|needle| output.contains(needle))
    }
}

#[derive(Debug, Default)]
pub struct HealOutcome {
    pub healthy: bool,
    pub heal_rounds: usize,
    pub prune_rounds: usize,
    pub steps: Vec<EnvStep>,
    pub removed_packages: Vec<String>,
    pub pip_check_output: String,
}

fn spec_hint_regexes() -> &'static (Regex, Regex) {
    static REGEXES: OnceLock<(Regex, Regex)> = OnceLock::new();
    REGEXES.get_or_init(|| {
        (
            Regex::new(r"has requirement ([^,]+), but you have").unwrap(),
            Regex::new(r"requires ([^,]+), which is not installed").unwrap(),
        )
    })
}

fn parent_regex() -> &'static Regex {
    static PARENT: OnceLock<Regex> = OnceLock::new();
    PARENT.get_or_init(|| {
        Regex::new(r"(?m)^([A-Za-z0-9][A-Za-z0-9._-]*) \S+ (?:has requirement|requires) ")
            .unwrap()
    })
}

/// Required-spec hints pulled out of `pip check` output.
pub fn extract_spec_hints(output: &str) -> BTreeSet<String> {
    let (has_requirement, not_installed) = spec_hint_regexes();
    let mut specs = BTreeSet::new();
    for captures in has_requirement.captures_iter(output) {
        specs.insert(captures[1].trim().to_string());
    }
    for captures in not_installed.captures_iter(output) {
        specs.insert(captures[1].trim().to_string());
    }
    specs
}

/// Packages named as the complaining side of a conflict line.
pub fn extract_conflict_parents(output: &str) -> BTreeSet<String> {
    parent_regex()
        .captures_iter(output)
        .map(|captures| normalize_name(&captures[1]))
        .collect()
}

/// Names declared in a requirements file, normalized.
fn requirement_names(path: &std::path::Path) -> BTreeSet<String> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return BTreeSet::new(),
    };
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .filter_map(|line| {
            let end = line
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'))
                .unwrap_or(line.len());
            let name = &line[..end];
            if name.is_empty() {
                None
            } else {
                Some(normalize_name(name))
            }
        })
        .collect()
}

fn protected_set(location: &BackendLocation) -> BTreeSet<String> {
    let mut protected: BTreeSet<String> = PROTECTED_PACKAGES
        .iter()
        .map(|name| normalize_name(name))
        .collect();
    protected.extend(requirement_names(&location.backend_dir.join("requirements.txt")));
    protected.extend(requirement_names(
        &location.backend_dir.join("manager_requirements.txt"),
    ));
    protected.extend(requirement_names(&location.compatible_requirements_path()));
    protected
}

async fn pip_check(location: &BackendLocation) -> EnvStep {
    subprocess::run_step(
        location,
        "python -m pip check",
        &["-m", "pip", "check"],
        PROBE_TIMEOUT,
    )
    .await
}

async fn run_install(location: &BackendLocation, args: &[&str]) -> EnvStep {
    let display = format!("python {}", args.join(" "));
    subprocess::run_step(location, &display, args, INSTALL_TIMEOUT).await
}

/// Run the heal loop, then prune if conflicts persist. The caller owns the
/// backend write lock.
pub async fn run_autoheal(location: &BackendLocation) -> HealOutcome {
    let mut outcome = HealOutcome::default();
    let mut seen_spec_sets: HashSet<BTreeSet<String>> = HashSet::new();

    for round in 1..=MAX_HEAL_ROUNDS {
        let check = pip_check(location).await;
        let check_ok = check.ok;
        outcome.pip_check_output = check.output.clone();
        outcome.steps.push(check);
        outcome.heal_rounds = round;

        if check_ok {
            outcome.healthy = true;
            info!("autoheal: environment healthy after {} round(s)", round);
            return outcome;
        }

        let output = outcome.pip_check_output.to_ascii_lowercase();
        let specs = extract_spec_hints(&output);
        if !seen_spec_sets.insert(specs.clone()) {
            info!("autoheal: extracted spec set repeated, stopping");
            break;
        }

        let recipes: Vec<&HealRecipe> =
            RECIPES.iter().filter(|r| r.matches(&output)).collect();
        if !recipes.is_empty() {
            for recipe in recipes {
                info!("autoheal: applying recipe '{}'", recipe.name);
                for install in recipe.installs {
                    outcome.steps.push(run_install(location, install).await);
                }
            }
        } else if !specs.is_empty() {
            let mut args = vec!["-m", "pip", "install"];
            args.extend(specs.iter().map(String::as_str));
            outcome.steps.push(run_install(location, &args).await);
        } else {
            warn!("autoheal: no recipe or spec hints matched, stopping");
            break;
        }
    }

    // Re-verify before deciding to prune; the last round may have fixed it.
    let check = pip_check(location).await;
    outcome.healthy = check.ok;
    outcome.pip_check_output = check.output.clone();
    outcome.steps.push(check);
    if outcome.healthy {
        return outcome;
    }

    prune(location, &mut outcome).await;
    outcome
}

/// Remove conflicting parent packages that are not protected, then re-apply
/// the baseline installs and re-check.
async fn prune(location: &BackendLocation, outcome: &mut HealOutcome) {
    let protected = protected_set(location);

    for round in 1..=MAX_PRUNE_ROUNDS {
        let parents = extract_conflict_parents(&outcome.pip_check_output);
        let removable: Vec<String> = parents
            .into_iter()
            .filter(|name| !protected.contains(name))
            .collect();
        if removable.is_empty() {
            info!("prune: no removable conflict parents, stopping");
            return;
        }

        outcome.prune_rounds = round;
        info!("prune round {round}: removing {}", removable.join(", "));
        let mut args = vec!["-m", "pip", "uninstall", "-y"];
        args.extend(removable.iter().map(String::as_str));
        outcome.steps.push(run_install(location, &args).await);
        for name in &removable {
            if !outcome.removed_packages.contains(name) {
                outcome.removed_packages.push(name.clone());
            }
        }

        outcome
            .steps
            .push(run_install(location, &["-m", "pip", "install", "-r", "requirements.txt"]).await);
        outcome.steps.push(
            run_install(
                location,
                &["-m", "pip", "install", "-r", "manager_requirements.txt"],
            )
            .await,
        );
        let compatible = location.compatible_requirements_path();
        if compatible.is_file() {
            let compatible = compatible.display().to_string();
            outcome.steps.push(
                run_install(location, &["-m", "pip", "install", "-r", &compatible]).await,
            );
        }

        let check = pip_check(location).await;
        outcome.healthy = check.ok;
        outcome.pip_check_output = check.output.clone();
        outcome.steps.push(check);
        if outcome.healthy {
            info!("prune: environment healthy after {round} round(s)");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_backend(python_body: &str) -> (tempfile::TempDir, BackendLocation) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        std::fs::write(dir.join("main.py"), "").unwrap();
        std::fs::write(dir.join("requirements.txt"), "torch\n").unwrap();
        std::fs::write(dir.join("manager_requirements.txt"), "").unwrap();
        let bin = dir.join("venv").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join("python");
        std::fs::write(&python, python_body).unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        let location = crate::locator::BackendLocator::new(Some(dir.display().to_string()))
            .resolve()
            .unwrap();
        (tmp, location)
    }

    #[test]
    fn spec_hints_are_extracted_from_both_shapes() {
        let output = "pkg 1.0 has requirement foo<2.0, but you have foo 3.0.\n\
                      bar 2.1 requires baz>=1.5, which is not installed.";
        let specs = extract_spec_hints(output);
        assert!(specs.contains("foo<2.0"));
        assert!(specs.contains("baz>=1.5"));
        assert_eq!(specs.len(), 2);
    }

    #[test]
    fn conflict_parents_are_extracted_and_normalized() {
        let output = "Fast_API 0.110.0 requires starlette<0.47.0, which is not installed.\n\
                      gradio 5.0 has requirement pillow<12, but you have pillow 12.1.";
        let parents = extract_conflict_parents(output);
        assert!(parents.contains("fast-api"));
        assert!(parents.contains("gradio"));
    }

    #[test]
    fn recipe_matching_requires_all_of() {
        let recipe = RECIPES
            .iter()
            .find(|r| r.name == "fastapi-sse-starlette")
            .unwrap();
        assert!(recipe.matches("fastapi 0.1 requires sse-starlette<3.0"));
        assert!(!recipe.matches("fastapi 0.1 requires pydantic>=2"));
    }

    #[tokio::test]
    async fn heals_via_recipe_and_stops_on_green() {
        // pip check fails until any install runs, then succeeds.
        let (_tmp, location) = fake_backend(
            "#!/bin/sh\n\
             if [ \"$3\" = check ]; then\n\
               if [ -f healed ]; then echo 'No broken requirements found.'; exit 0; fi\n\
               echo 'fastapi 0.110.0 requires sse-starlette<3.0, which is not installed.'\n\
               exit 1\n\
             fi\n\
             if [ \"$3\" = install ]; then touch healed; fi\n\
             exit 0\n",
        );
        let outcome = run_autoheal(&location).await;
        assert!(outcome.healthy);
        assert!(outcome.heal_rounds <= 2);
        assert!(outcome.removed_packages.is_empty());
        assert!(outcome
            .steps
            .iter()
            .any(|s| s.command.contains("sse-starlette<3.0")));
    }

    #[tokio::test]
    async fn repeated_spec_set_terminates_and_prunes_unprotected_parent() {
        // pip check always fails the same way; installs change nothing, so
        // the heal loop must stop on the repeated spec set and prune takes
        // over. The parent is not protected and gets uninstalled.
        let (_tmp, location) = fake_backend(
            "#!/bin/sh\n\
             if [ \"$3\" = check ]; then\n\
               if [ -f pruned ]; then echo 'No broken requirements found.'; exit 0; fi\n\
               echo 'sillypkg 1.0 has requirement foo<2.0, but you have foo 3.0.'\n\
               exit 1\n\
             fi\n\
             if [ \"$3\" = uninstall ]; then touch pruned; fi\n\
             exit 0\n",
        );
        let outcome = run_autoheal(&location).await;
        assert!(outcome.healthy);
        assert!(outcome.heal_rounds <= MAX_HEAL_ROUNDS);
        assert_eq!(outcome.removed_packages, vec!["sillypkg".to_string()]);
        assert!(outcome
            .steps
            .iter()
            .any(|s| s.command.contains("pip uninstall -y sillypkg")));
    }

    #[tokio::test]
    async fn protected_parents_are_never_removed() {
        let (_tmp, location) = fake_backend(
            "#!/bin/sh\n\
             if [ \"$3\" = check ]; then\n\
               echo 'torch 2.4.0 has requirement numpy<2.0, but you have numpy 2.1.'\n\
               exit 1\n\
             fi\n\
             exit 0\n",
        );
        let outcome = run_autoheal(&location).await;
        assert!(!outcome.healthy);
        assert!(outcome.removed_packages.is_empty());
        assert!(!outcome
            .steps
            .iter()
            .any(|s| s.command.contains("uninstall")));
    }
}
