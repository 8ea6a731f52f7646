//! Node install script
//!
//! The script a fresh machine runs once at boot. It carries everything the
//! node agent needs to reach the control plane: the server URL, the bearer
//! derived from the machine's bootstrap service account token, and the
//! checksum of the CA bundle the agent should trust.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use trellis_common::crd::{EnvVar, Taint};

/// Roles a machine was created for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeRoles {
    /// Runs etcd
    pub etcd: bool,
    /// Runs the control plane
    pub control_plane: bool,
    /// Runs workloads
    pub worker: bool,
}

/// Inputs for rendering an install script
#[derive(Clone, Debug, Default)]
pub struct InstallScript<'a> {
    /// Control plane URL agents connect to
    pub server_url: &'a str,
    /// Bearer value the agent presents
    pub token: &'a str,
    /// SHA-256 of the CA bundle, empty for publicly trusted servers
    pub ca_checksum: &'a str,
    /// Where the agent installer is downloaded from
    pub install_url: &'a str,
    /// Node roles
    pub roles: NodeRoles,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Node taints
    pub taints: Vec<Taint>,
    /// Extra environment for the agent
    pub env: &'a [EnvVar],
}

/// Single-quote a value for POSIX sh
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl InstallScript<'_> {
    /// Render the script
    pub fn render(&self) -> String {
        let mut out = String::from("#!/bin/sh\nset -eu\n\n");

        for var in self.env.iter().filter(|v| is_env_name(&v.name)) {
            let _ = writeln!(out, "export {}={}", var.name, quote(&var.value));
        }
        let _ = writeln!(out, "CATTLE_SERVER={}", quote(self.server_url));
        let _ = writeln!(out, "CATTLE_TOKEN={}", quote(self.token));
        let _ = writeln!(out, "CATTLE_CA_CHECKSUM={}", quote(self.ca_checksum));
        let _ = writeln!(out, "CATTLE_ROLE_ETCD={}", self.roles.etcd);
        let _ = writeln!(out, "CATTLE_ROLE_CONTROLPLANE={}", self.roles.control_plane);
        let _ = writeln!(out, "CATTLE_ROLE_WORKER={}", self.roles.worker);

        let mut args = vec![
            "--server \"$CATTLE_SERVER\"".to_string(),
            "--token \"$CATTLE_TOKEN\"".to_string(),
        ];
        if !self.ca_checksum.is_empty() {
            args.push("--ca-checksum \"$CATTLE_CA_CHECKSUM\"".to_string());
        }
        for (enabled, flag) in [
            (self.roles.etcd, "--etcd"),
            (self.roles.control_plane, "--controlplane"),
            (self.roles.worker, "--worker"),
        ] {
            if enabled {
                args.push(flag.to_string());
            }
        }
        for (key, value) in &self.labels {
            args.push(format!("--label {}", quote(&format!("{}={}", key, value))));
        }
        for taint in &self.taints {
            args.push(format!("--taint {}", quote(&taint.to_arg())));
        }

        let _ = write!(
            out,
            "\ncurl -fsSL {} | sh -s - \\\n  {}\n",
            quote(self.install_url),
            args.join(" \\\n  ")
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(env: &[EnvVar]) -> InstallScript<'_> {
        InstallScript {
            server_url: "https://trellis.example.com",
            token: "bearer-value",
            ca_checksum: "abc123",
            install_url: "https://trellis.example.com/system-agent-install.sh",
            roles: NodeRoles {
                etcd: true,
                control_plane: true,
                worker: false,
            },
            labels: BTreeMap::from([("tier".to_string(), "db".to_string())]),
            taints: vec![Taint {
                key: "dedicated".into(),
                value: "db".into(),
                effect: "NoSchedule".into(),
            }],
            env,
        }
    }

    #[test]
    fn test_script_carries_connection_settings() {
        let rendered = script(&[]).render();
        assert!(rendered.starts_with("#!/bin/sh\n"));
        assert!(rendered.contains("CATTLE_SERVER='https://trellis.example.com'\n"));
        assert!(rendered.contains("CATTLE_TOKEN='bearer-value'\n"));
        assert!(rendered.contains("CATTLE_CA_CHECKSUM='abc123'\n"));
        assert!(rendered.contains("CATTLE_ROLE_ETCD=true\n"));
        assert!(rendered.contains("CATTLE_ROLE_WORKER=false\n"));
        assert!(rendered.contains("--etcd"));
        assert!(rendered.contains("--controlplane"));
        assert!(!rendered.contains("--worker"));
        assert!(rendered.contains("--label 'tier=db'"));
        assert!(rendered.contains("--taint 'dedicated=db:NoSchedule'"));
    }

    #[test]
    fn test_env_values_are_quoted_and_names_checked() {
        let env = [
            EnvVar {
                name: "HTTP_PROXY".into(),
                value: "http://it's-a-proxy:3128".into(),
            },
            EnvVar {
                name: "BAD; rm -rf /".into(),
                value: "x".into(),
            },
        ];
        let rendered = script(&env).render();
        assert!(rendered.contains(r"export HTTP_PROXY='http://it'\''s-a-proxy:3128'"));
        assert!(!rendered.contains("rm -rf"));
    }

    #[test]
    fn test_checksum_flag_omitted_without_ca() {
        let mut s = script(&[]);
        s.ca_checksum = "";
        assert!(!s.render().contains("--ca-checksum"));
    }
}
