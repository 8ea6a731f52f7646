//! Node plan encoding
//!
//! A plan is the complete set of files and instructions a node agent
//! applies. File content is base64 encoded by the control plane and every
//! file carries its own absolute destination path. The checksum is a
//! SHA-256 over the plan's JSON encoding; field order is fixed by the
//! struct layout and maps are ordered, so equal plans always hash equally.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use trellis_common::naming::sha256_hex;
use trellis_common::Result;

/// A file the agent writes before running instructions
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanFile {
    /// Absolute destination path on the node
    pub path: String,
    /// Base64 encoded content
    pub content: String,
    /// SHA-256 hex of the decoded content
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// Octal file mode, agent default when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub permissions: String,
}

impl PlanFile {
    /// File with raw content, encoded and hashed
    pub fn new(path: impl Into<String>, content: impl AsRef<[u8]>) -> Self {
        let content = content.as_ref();
        Self {
            path: path.into(),
            content: STANDARD.encode(content),
            hash: sha256_hex(content),
            permissions: String::new(),
        }
    }

    /// Same file with an explicit mode
    pub fn with_permissions(mut self, mode: &str) -> Self {
        self.permissions = mode.to_string();
        self
    }
}

/// A command the agent runs, in order
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    /// Instruction name; also the key its output is saved under
    pub name: String,
    /// Image whose content is extracted and run, when set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    /// Command to execute
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    /// Command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment as `KEY=value`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Report stdout back in the plan record
    #[serde(default)]
    pub save_output: bool,
}

/// Files and instructions for one node
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodePlan {
    /// Files written before any instruction runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PlanFile>,
    /// Instructions run in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instructions: Vec<Instruction>,
}

impl NodePlan {
    /// Canonical JSON encoding
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a published plan
    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Stable checksum over the canonical encoding
    pub fn checksum(&self) -> Result<String> {
        Ok(sha256_hex(self.encode()?.as_bytes()))
    }

    /// File at `path`, if planned
    pub fn file(&self, path: &str) -> Option<&PlanFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> NodePlan {
        NodePlan {
            files: vec![PlanFile::new("/etc/rancher/rke2/config.yaml.d/50-trellis.yaml", "token: x\n")],
            instructions: vec![Instruction {
                name: "install".into(),
                image: "trellis/system-agent-installer-rke2:v1.30.4-rke2r1".into(),
                command: "sh".into(),
                args: vec!["-c".into(), "run.sh".into()],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_file_content_is_base64_with_hash() {
        let file = PlanFile::new("/tmp/a", "hello");
        assert_eq!(file.content, "aGVsbG8=");
        assert_eq!(file.hash.len(), 64);
    }

    #[test]
    fn test_checksum_is_stable_and_content_sensitive() {
        assert_eq!(plan().checksum().unwrap(), plan().checksum().unwrap());

        let mut changed = plan();
        changed.files[0] = PlanFile::new("/etc/rancher/rke2/config.yaml.d/50-trellis.yaml", "token: y\n");
        assert_ne!(plan().checksum().unwrap(), changed.checksum().unwrap());
    }

    #[test]
    fn test_encoding_uses_wire_names() {
        let encoded = plan().encode().unwrap();
        assert!(encoded.contains("\"saveOutput\":false"));
        assert!(encoded.contains("\"path\":\"/etc/rancher/rke2/config.yaml.d/50-trellis.yaml\""));
        assert_eq!(NodePlan::decode(encoded.as_bytes()).unwrap(), plan());
    }
}
