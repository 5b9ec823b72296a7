//! Status translation
//!
//! Turns a non-success response into a [`KvError`] and decides whether the
//! attempt that produced it may be retried. Hints from a negotiated error map
//! win over the built-in classification.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::Deserialize;

use crate::error::KvError;
use crate::protocol::Packet;

use super::{translate, ErrorMap, RetryClass, StatusCode};

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Surface the error to the caller
    Never,
    /// Resend to the same routing target after the delay
    AfterDelay(Duration),
    /// Re-route against the latest topology after the delay, then resend
    AfterTopologyRefresh(Duration),
}

#[derive(Debug, Deserialize)]
struct EnhancedBody {
    error: EnhancedError,
}

#[derive(Debug, Deserialize)]
struct EnhancedError {
    context: Option<String>,
    #[serde(rename = "ref")]
    reference: Option<String>,
}

/// Parse an enhanced error body (`{"error":{"context":..,"ref":..}}`)
pub fn parse_enhanced_error(value: &[u8]) -> Option<(Option<String>, Option<String>)> {
    let body: EnhancedBody = serde_json::from_slice(value).ok()?;
    Some((body.error.context, body.error.reference))
}

/// Shared status translator
///
/// One per agent; the error map is swapped in atomically whenever a pipeline
/// fetches a newer revision.
pub struct Translator {
    error_map: ArcSwapOption<ErrorMap>,
    default_delay: Duration,
}

impl Translator {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            error_map: ArcSwapOption::empty(),
            default_delay,
        }
    }

    /// Install an error map unless an equal or newer revision is already held
    pub fn install_error_map(&self, map: Arc<ErrorMap>) {
        let current = self.error_map.load();
        if let Some(existing) = &*current {
            if existing.revision >= map.revision {
                return;
            }
        }
        tracing::debug!(
            "Installing error map v{} rev {} ({} entries)",
            map.version,
            map.revision,
            map.len()
        );
        self.error_map.store(Some(map));
    }

    pub fn error_map(&self) -> Option<Arc<ErrorMap>> {
        self.error_map.load_full()
    }

    /// Build the error for a failed response
    pub fn to_error(&self, packet: &Packet) -> KvError {
        let mut error = KvError::new(packet.status);

        if packet.is_json() && !packet.value.is_empty() {
            if let Some((context, reference)) = parse_enhanced_error(&packet.value) {
                error.context = context;
                error.reference = reference;
            }
        }

        if let Some(map) = &*self.error_map.load() {
            if let Some(entry) = map.get(packet.status) {
                error.name = Some(entry.name.clone());
                error.description = Some(entry.description.clone());
            }
        }

        error
    }

    /// Decide whether retry number `attempt` (1-based) may proceed
    pub fn retry_decision(
        &self,
        status: StatusCode,
        attempt: u32,
        elapsed: Duration,
    ) -> RetryDecision {
        if let Some(decision) = self.error_map_decision(status, attempt, elapsed) {
            return decision;
        }

        match translate(status).retry_class() {
            RetryClass::Terminal => RetryDecision::Never,
            RetryClass::AfterDelay => RetryDecision::AfterDelay(self.default_delay),
            RetryClass::AfterTopologyRefresh => {
                RetryDecision::AfterTopologyRefresh(self.default_delay)
            }
        }
    }

    fn error_map_decision(
        &self,
        status: StatusCode,
        attempt: u32,
        elapsed: Duration,
    ) -> Option<RetryDecision> {
        let guard = self.error_map.load();
        let entry = (*guard).as_ref()?.get(status)?;

        let delay = match &entry.retry {
            Some(spec) if !spec.allows(elapsed) => return Some(RetryDecision::Never),
            Some(spec) => Some(spec.delay(attempt)),
            None if entry.has_attr("retry-now") => Some(Duration::ZERO),
            None if entry.has_attr("retry-later") => Some(self.default_delay),
            None => None,
        };

        if entry.has_attr("fetch-config") {
            return Some(RetryDecision::AfterTopologyRefresh(
                delay.unwrap_or(self.default_delay),
            ));
        }

        delay.map(RetryDecision::AfterDelay)
    }
}
