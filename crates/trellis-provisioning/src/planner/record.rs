//! Plan record codec
//!
//! A node's plan lives in its plan secret. The control plane owns the
//! `plan` and `plan-checksum` keys; the agent writes back the checksum of
//! the plan it last applied, that plan's saved output, and a failure
//! count for the checksum it last failed on.
//!
//! A node has executed the current plan only when the applied checksum
//! equals the published one. Any other applied checksum, including an
//! older one, means the node is still working.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use trellis_common::{Error, Result};

use super::plan::NodePlan;

/// Published plan, JSON
pub const PLAN_KEY: &str = "plan";
/// Checksum of the published plan
pub const PLAN_CHECKSUM_KEY: &str = "plan-checksum";
/// Checksum of the plan the agent last applied
pub const APPLIED_CHECKSUM_KEY: &str = "applied-checksum";
/// Saved instruction output, JSON map of name to base64
pub const APPLIED_OUTPUT_KEY: &str = "applied-output";
/// Consecutive failures applying `failed-checksum`
pub const FAILURE_COUNT_KEY: &str = "failure-count";
/// Checksum of the plan the agent failed on
pub const FAILED_CHECKSUM_KEY: &str = "failed-checksum";

/// Parsed view of a plan secret
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlanRecord {
    /// Checksum of the published plan, empty before the first publish
    pub plan_checksum: String,
    /// Checksum the agent reported as applied
    pub applied_checksum: String,
    /// Raw output of instructions that save output
    pub output: BTreeMap<String, Vec<u8>>,
    /// Failures on `failed_checksum`
    pub failure_count: u32,
    /// Checksum the agent failed on
    pub failed_checksum: String,
}

fn text(data: &BTreeMap<String, ByteString>, key: &str) -> Result<String> {
    match data.get(key) {
        Some(value) => String::from_utf8(value.0.clone())
            .map(|s| s.trim().to_string())
            .map_err(|_| Error::malformed_output(format!("{} is not valid UTF-8", key))),
        None => Ok(String::new()),
    }
}

impl PlanRecord {
    /// Parse the record out of a plan secret
    ///
    /// Unparseable agent fields yield `MalformedOutput`; callers treat that
    /// as not ready rather than failed.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let empty = BTreeMap::new();
        let data = secret.data.as_ref().unwrap_or(&empty);

        let failure_count = match text(data, FAILURE_COUNT_KEY)?.as_str() {
            "" => 0,
            raw => raw
                .parse()
                .map_err(|_| Error::malformed_output(format!("failure-count {:?}", raw)))?,
        };

        let output = match data.get(APPLIED_OUTPUT_KEY) {
            Some(raw) if !raw.0.is_empty() => {
                let encoded: BTreeMap<String, String> = serde_json::from_slice(&raw.0)
                    .map_err(|e| Error::malformed_output(format!("applied-output: {}", e)))?;
                encoded
                    .into_iter()
                    .map(|(name, value)| {
                        STANDARD
                            .decode(value.trim())
                            .map(|bytes| (name.clone(), bytes))
                            .map_err(|_| {
                                Error::malformed_output(format!("output of {} is not base64", name))
                            })
                    })
                    .collect::<Result<_>>()?
            }
            _ => BTreeMap::new(),
        };

        Ok(Self {
            plan_checksum: text(data, PLAN_CHECKSUM_KEY)?,
            applied_checksum: text(data, APPLIED_CHECKSUM_KEY)?,
            output,
            failure_count,
            failed_checksum: text(data, FAILED_CHECKSUM_KEY)?,
        })
    }

    /// Whether a plan has been published
    pub fn is_published(&self) -> bool {
        !self.plan_checksum.is_empty()
    }

    /// The agent applied exactly the published plan
    pub fn is_done(&self) -> bool {
        self.is_published() && self.applied_checksum == self.plan_checksum
    }

    /// The agent keeps failing the published plan
    pub fn is_failed(&self, threshold: u32) -> bool {
        self.is_published()
            && self.failed_checksum == self.plan_checksum
            && self.failure_count >= threshold
    }

    /// Saved output of instruction `name`
    pub fn output(&self, name: &str) -> Option<&[u8]> {
        self.output.get(name).map(Vec::as_slice)
    }
}

/// Write `plan` into a plan secret if it differs from what is published
///
/// Returns whether the secret changed. Agent-owned keys are left alone.
pub fn publish(secret: &mut Secret, plan: &NodePlan) -> Result<bool> {
    let checksum = plan.checksum()?;
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    if data.get(PLAN_CHECKSUM_KEY).map(|v| v.0.as_slice()) == Some(checksum.as_bytes()) {
        return Ok(false);
    }
    data.insert(PLAN_KEY.to_string(), ByteString(plan.encode()?.into_bytes()));
    data.insert(PLAN_CHECKSUM_KEY.to_string(), ByteString(checksum.into_bytes()));
    Ok(true)
}

/// Published plan, if any
#[cfg(test)]
pub fn published_plan(secret: &Secret) -> Result<Option<NodePlan>> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(PLAN_KEY))
        .map(|raw| NodePlan::decode(&raw.0))
        .transpose()
}
