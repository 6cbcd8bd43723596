//! Already-applied detection.
//!
//! Two tiers: an Aho-Corasick scan for the instruction's markers, then an
//! optional verifier call that only runs when a marker was found. The marker
//! scan decides; the verifier can only annotate the reason.

use std::{sync::Arc, time::Duration};

use aho_corasick::AhoCorasick;
use tracing::{debug, warn};

use crate::core::{
    generator::{EditGenerator, verify_with_timeout},
    instruction::EditInstruction,
};

/// Outcome of the gate for one instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub skip: bool,
    pub reason: String,
}

impl GateDecision {
    fn proceed(reason: impl Into<String>) -> Self {
        Self {
            skip: false,
            reason: reason.into(),
        }
    }

    fn skip(reason: impl Into<String>) -> Self {
        Self {
            skip: true,
            reason: reason.into(),
        }
    }
}

pub struct IdempotencyGate {
    verifier: Option<Arc<dyn EditGenerator>>,
    timeout: Option<Duration>,
}

impl IdempotencyGate {
    /// Marker scan only
    pub fn markers_only() -> Self {
        Self {
            verifier: None,
            timeout: None,
        }
    }

    /// Marker scan plus a verifier consulted on hits
    pub fn with_verifier(verifier: Arc<dyn EditGenerator>, timeout: Option<Duration>) -> Self {
        Self {
            verifier: Some(verifier),
            timeout,
        }
    }

    /// First marker of `instruction` present in `content`, if any
    pub fn find_marker(content: &str, instruction: &EditInstruction) -> Option<String> {
        let markers = instruction.markers();
        if markers.is_empty() {
            return None;
        }
        let ac = match AhoCorasick::new(&markers) {
            Ok(ac) => ac,
            Err(e) => {
                // Only reachable with absurd marker sizes; fall back to a plain scan
                debug!(error = %e, "aho-corasick build failed");
                return markers.into_iter().find(|m| content.contains(m.as_str()));
            }
        };
        ac.find(content)
            .map(|m| markers[m.pattern().as_usize()].clone())
    }

    pub fn should_skip(&self, content: &str, instruction: &EditInstruction) -> GateDecision {
        let Some(marker) = Self::find_marker(content, instruction) else {
            return GateDecision::proceed("no marker found");
        };

        let base = format!("marker `{marker}` already present");
        let Some(verifier) = &self.verifier else {
            return GateDecision::skip(base);
        };

        match verify_with_timeout(verifier, content, instruction, &marker, self.timeout) {
            Ok(None) => GateDecision::skip(base),
            Ok(Some(v)) if v.already_applied => {
                GateDecision::skip(format!("{base}; verifier agrees: {}", v.reason))
            }
            Ok(Some(v)) => {
                warn!(
                    path = %instruction.file_path.display(),
                    marker = %marker,
                    "verifier disagrees with marker scan; keeping skip"
                );
                GateDecision::skip(format!("{base}; verifier disagreed: {}", v.reason))
            }
            Err(e) => {
                debug!(error = %e, "verifier unavailable");
                GateDecision::skip(format!("{base}; verifier unavailable: {e}"))
            }
        }
    }
}
