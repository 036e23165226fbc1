//! Property tests for the specifier algebra
//!
//! Uses a hand-rolled xorshift generator rather than an external test-gen
//! crate to keep dependencies flat. Invariants:
//!
//! - the normalized output of a compatible resolution admits exactly the
//!   versions the original constraint set admits
//! - resolution is idempotent: re-resolving the normalized output yields the
//!   same normalized output
//! - conflicting sets always carry at least one reason

use modusnapd::reconciler::{PyVersion, Resolution, SpecSet};

/// xorshift64 test generator.
struct TestRng {
    state: u64,
}

impl TestRng {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_range(&mut self, min: u64, max: u64) -> u64 {
        if max <= min {
            return min;
        }
        min + (self.next_u64() % (max - min))
    }
}

fn random_version(rng: &mut TestRng) -> String {
    let parts = rng.next_range(1, 4);
    (0..parts)
        .map(|_| rng.next_range(0, 8).to_string())
        .collect::<Vec<_>>()
        .join(".")
}

fn random_spec(rng: &mut TestRng) -> String {
    let version = random_version(rng);
    match rng.next_range(0, 7) {
        0 => format!("=={version}"),
        1 => format!("!={version}"),
        2 => format!(">{version}"),
        3 => format!(">={version}"),
        4 => format!("<{version}"),
        5 => format!("<={version}"),
        _ => format!("~={version}"),
    }
}

fn set_from_specs(specs: &[String]) -> SpecSet {
    let mut set = SpecSet::default();
    for spec in specs {
        set.add(spec);
    }
    set
}

#[test]
fn normalized_output_admits_exactly_the_intersection() {
    let mut rng = TestRng::new(0x5eed);
    let mut compatible_seen = 0u32;

    for _ in 0..500 {
        let spec_count = rng.next_range(1, 5) as usize;
        let specs: Vec<String> = (0..spec_count).map(|_| random_spec(&mut rng)).collect();
        let set = set_from_specs(&specs);

        let normalized = match set.resolve() {
            Resolution::Compatible(normalized) => normalized,
            Resolution::Conflict(reasons) => {
                assert!(
                    !reasons.is_empty(),
                    "conflict without reasons for specs {specs:?}"
                );
                continue;
            }
        };
        compatible_seen += 1;

        let renormalized_set = if normalized.is_empty() {
            SpecSet::default()
        } else {
            let parts: Vec<String> =
                normalized.split(',').map(str::to_string).collect();
            set_from_specs(&parts)
        };

        // Probe a batch of random versions: the original set and the
        // normalized set must agree on every one of them.
        for _ in 0..40 {
            let probe = PyVersion::parse(&random_version(&mut rng)).unwrap();
            assert_eq!(
                set.admits_version(&probe),
                renormalized_set.admits_version(&probe),
                "disagreement on {} for specs {specs:?} (normalized '{normalized}')",
                probe
            );
        }
    }

    // The generator must actually exercise the compatible path.
    assert!(compatible_seen > 50);
}

#[test]
fn resolution_is_idempotent_on_normalized_output() {
    let mut rng = TestRng::new(0xfeed);

    for _ in 0..500 {
        let spec_count = rng.next_range(1, 5) as usize;
        let specs: Vec<String> = (0..spec_count).map(|_| random_spec(&mut rng)).collect();

        let normalized = match set_from_specs(&specs).resolve() {
            Resolution::Compatible(normalized) => normalized,
            Resolution::Conflict(_) => continue,
        };
        if normalized.is_empty() {
            continue;
        }

        let parts: Vec<String> = normalized.split(',').map(str::to_string).collect();
        match set_from_specs(&parts).resolve() {
            Resolution::Compatible(renormalized) => {
                assert_eq!(
                    normalized, renormalized,
                    "renormalization changed the specifier (from {specs:?})"
                );
            }
            Resolution::Conflict(reasons) => {
                panic!("normalized output '{normalized}' re-resolved to conflict: {reasons:?}");
            }
        }
    }
}

#[test]
fn exact_pins_survive_normalization() {
    let mut rng = TestRng::new(0xabc);
    for _ in 0..200 {
        let version = random_version(&mut rng);
        let pinned = PyVersion::parse(&version).unwrap();
        let mut set = SpecSet::default();
        set.add(&format!("=={version}"));
        set.add(&format!(">={}", "0.0.1"));

        match set.resolve() {
            Resolution::Compatible(normalized) => {
                assert_eq!(normalized, format!("=={version}"));
                assert!(set.admits_version(&pinned));
            }
            Resolution::Conflict(_) => {
                // Only possible when the pin sits below the lower bound.
                assert!(pinned < PyVersion::parse("0.0.1").unwrap());
            }
        }
    }
}
