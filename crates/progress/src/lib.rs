//! Zenith progress: map unstructured build output to a coarse completion estimate.
//!
//! `estimate` is a pure lookup over an ordered checkpoint table. It knows nothing
//! about the build tool's internal model; false matches are fine. The
//! `ProgressTracker` owns the per-session running maximum so the reported value
//! never regresses.

#![forbid(unsafe_code)]

use once_cell::sync::Lazy;
use regex::Regex;

/// Increment applied for a line that matches no checkpoint.
pub const NUDGE: f32 = 0.08;
/// Nudges never push the estimate past this value.
pub const NUDGE_CEILING: f32 = 95.0;

/// Build phases in the order they normally happen, with their checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialization,
    Dependencies,
    Configuration,
    Preprocessing,
    Compilation,
    ResourceMerge,
    Packaging,
    Assembly,
    Signing,
    Complete,
}

/// (phase, checkpoint %, case-insensitive substrings)
pub const CHECKPOINTS: &[(Phase, f32, &[&str])] = &[
    (Phase::Initialization, 5.0, &["starting a gradle daemon", "welcome to gradle", "initializ", "daemon will be stopped", "pre-flight"]),
    (Phase::Dependencies, 12.0, &["resolv", "download", "dependencies", "hydrating", "pod install", "installing pods", "npm ci", "npm install"]),
    (Phase::Configuration, 20.0, &["configure project", "configuring", "configuration cache", "> configure"]),
    (Phase::Preprocessing, 28.0, &["generate", "codegen", "preprocess", "kapt", "ksp", "processdebugmanifest", "write auxiliary"]),
    (Phase::Compilation, 45.0, &["compil", "kotlin", "javac", "swiftcompile", "compilec"]),
    (Phase::ResourceMerge, 60.0, &["merge", "processdebugresources", "dexbuilder", "mergedex", "copy resources", "compileassetcatalog"]),
    (Phase::Packaging, 72.0, &["package", "zipalign", "processinfoplist", "copyswiftlibs"]),
    (Phase::Assembly, 85.0, &["assemble", "bundle", " ld ", "linking", "link "]),
    (Phase::Signing, 92.0, &["sign", "codesign", "validate"]),
    (Phase::Complete, 100.0, &["build successful", "** build succeeded **", "satellite build complete"]),
];

static TABLE: Lazy<Vec<(Regex, Phase, f32)>> = Lazy::new(|| {
    CHECKPOINTS
        .iter()
        .filter_map(|(phase, pct, keys)| {
            let alternation = keys.iter().map(|k| regex::escape(k)).collect::<Vec<_>>().join("|");
            Regex::new(&format!("(?i){}", alternation)).ok().map(|re| (re, *phase, *pct))
        })
        .collect()
});

/// Highest checkpoint whose keywords appear in `line`, if any.
///
/// The table is scanned from the last phase backwards so a line that mentions
/// both an early and a late phase reports the late one.
pub fn classify(line: &str) -> Option<(Phase, f32)> {
    TABLE.iter().rev().find(|(re, _, _)| re.is_match(line)).map(|(_, phase, pct)| (*phase, *pct))
}

/// Checkpoint percentage for `line`, `None` for lines that match nothing.
pub fn estimate(line: &str) -> Option<f32> {
    classify(line).map(|(_, pct)| pct)
}

/// Running maximum over one session's output.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    current: f32,
    lines: u64,
}

impl ProgressTracker {
    pub fn new() -> Self { Self::default() }

    /// Feed one line; returns the (non-decreasing) estimate after it.
    pub fn observe(&mut self, line: &str) -> f32 {
        self.lines += 1;
        match estimate(line) {
            Some(pct) => self.current = self.current.max(pct),
            None if self.current < NUDGE_CEILING => self.current = (self.current + NUDGE).min(NUDGE_CEILING),
            None => {}
        }
        self.current
    }

    pub fn current(&self) -> f32 { self.current }
    pub fn lines(&self) -> u64 { self.lines }

    /// Start of the next session.
    pub fn reset(&mut self) { *self = Self::default(); }
}
