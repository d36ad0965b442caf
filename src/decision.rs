//! Decisions as published by the decision source.

use crate::duration::parse_duration;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::debug;

/// A single ban decision issued by the decision source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Decision {
    #[serde(default)]
    pub id: i64,

    /// Who issued the decision (`crowdsec`, `cscli`, ...).
    #[serde(default)]
    pub origin: String,

    /// Remediation type, usually `ban`.
    #[serde(rename = "type", default)]
    pub kind: String,

    /// `Ip` or `Range`.
    #[serde(default)]
    pub scope: String,

    /// The IP address or CIDR the decision applies to.
    pub value: String,

    /// Time left on the decision, Go duration syntax.
    #[serde(default)]
    pub duration: String,

    #[serde(default)]
    pub scenario: String,

    #[serde(default)]
    pub simulated: bool,
}

impl Decision {
    /// Time this decision still has to run.
    ///
    /// Unparsable or missing durations fall back to `fallback` so that an
    /// entry built from it can never outlive its intended lifetime by
    /// accident. Returns `None` when the decision has already expired.
    pub fn ttl(&self, fallback: Duration) -> Option<Duration> {
        match parse_duration(&self.duration) {
            Ok(parsed) => parsed.to_positive(),
            Err(e) => {
                debug!(
                    value = %self.value,
                    duration = %self.duration,
                    error = %e,
                    "Unparsable decision duration, using fallback TTL"
                );
                Some(fallback)
            }
        }
    }
}

/// Incremental changes returned by the stream endpoint.
///
/// On the first call after startup `new` holds the full active ban set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct StreamDiff {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub new: Vec<Decision>,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub deleted: Vec<Decision>,
}

impl StreamDiff {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.deleted.is_empty()
    }
}

/// Parse a point-query body: a JSON array of decisions or the literal `null`.
pub fn parse_decisions(body: &[u8]) -> Result<Vec<Decision>, serde_json::Error> {
    let decisions: Option<Vec<Decision>> = serde_json::from_slice(body)?;
    Ok(decisions.unwrap_or_default())
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Decision>, D::Error>
where
    D: Deserializer<'de>,
{
    let decisions: Option<Vec<Decision>> = Option::deserialize(deserializer)?;
    Ok(decisions.unwrap_or_default())
}
