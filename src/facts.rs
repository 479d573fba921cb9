//! Host facts - gathered once per run, available to templates
//!
//! Facts cover the local host (hostname, user, OS release) and, when the
//! host is an EC2 instance, the instance metadata service. Metadata
//! lookups use IMDSv2 with a short timeout so runs on non-cloud hosts
//! don't hang.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

const METADATA_BASE: &str = "http://169.254.169.254/latest";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Facts about the host being converged
#[derive(Debug, Clone, Serialize, Default)]
pub struct Facts {
    pub hostname: String,
    pub user: String,
    /// `ID` from /etc/os-release, e.g. "ubuntu"
    pub os_id: String,
    /// `PRETTY_NAME` from /etc/os-release
    pub os_name: String,
    /// EC2 instance metadata, absent on non-cloud hosts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceFacts>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceFacts {
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ipv4: Option<String>,
}

impl Facts {
    /// Gather all facts for this host
    pub fn gather() -> Result<Self> {
        let os = OsRelease::load().unwrap_or_default();

        Ok(Self {
            hostname: hostname()?,
            user: current_user(),
            os_id: os.id,
            os_name: os.pretty_name,
            instance: instance_facts(METADATA_BASE),
        })
    }

    /// Gather local facts only, skipping the metadata service
    pub fn gather_local() -> Result<Self> {
        let os = OsRelease::load().unwrap_or_default();

        Ok(Self {
            hostname: hostname()?,
            user: current_user(),
            os_id: os.id,
            os_name: os.pretty_name,
            instance: None,
        })
    }

    /// Flatten facts into template variables
    ///
    /// Manifest `[host.vars]` entries are merged on top and win on conflict.
    pub fn template_vars(&self, extra: &HashMap<String, String>) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("hostname".to_string(), self.hostname.clone());
        vars.insert("user".to_string(), self.user.clone());
        vars.insert("os_id".to_string(), self.os_id.clone());
        vars.insert("os_name".to_string(), self.os_name.clone());

        if let Some(instance) = &self.instance {
            vars.insert("instance_id".to_string(), instance.instance_id.clone());
            if let Some(ip) = &instance.public_ipv4 {
                vars.insert("public_ipv4".to_string(), ip.clone());
            }
        }

        for (key, value) in extra {
            vars.insert(key.clone(), value.clone());
        }

        vars
    }
}

fn hostname() -> Result<String> {
    let output = std::process::Command::new("hostname")
        .output()
        .context("could not run hostname")?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Parsed subset of /etc/os-release
#[derive(Debug, Default)]
struct OsRelease {
    id: String,
    pretty_name: String,
}

impl OsRelease {
    fn load() -> Option<Self> {
        let content = std::fs::read_to_string("/etc/os-release").ok()?;
        Some(Self::parse(&content))
    }

    fn parse(content: &str) -> Self {
        let mut release = Self::default();
        for line in content.lines() {
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim_matches('"').to_string();
                match key {
                    "ID" => release.id = value,
                    "PRETTY_NAME" => release.pretty_name = value,
                    _ => {}
                }
            }
        }
        release
    }
}

/// Query the EC2 instance metadata service (IMDSv2)
///
/// Returns None when the service is unreachable, which is the normal case
/// off-cloud. Failures are logged at debug, not surfaced.
fn instance_facts(base: &str) -> Option<InstanceFacts> {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(METADATA_TIMEOUT))
        .build()
        .into();

    let token = agent
        .put(format!("{base}/api/token"))
        .header("X-aws-ec2-metadata-token-ttl-seconds", "60")
        .send_empty()
        .and_then(|mut r| Ok(r.body_mut().read_to_string()?));

    let token = match token {
        Ok(token) => token,
        Err(e) => {
            log::debug!("instance metadata unavailable: {e}");
            return None;
        }
    };

    let get = |path: &str| -> Option<String> {
        agent
            .get(format!("{base}/meta-data/{path}"))
            .header("X-aws-ec2-metadata-token", &token)
            .call()
            .ok()
            .and_then(|mut r| r.body_mut().read_to_string().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let instance_id = get("instance-id")?;
    Some(InstanceFacts {
        instance_id,
        public_ipv4: get("public-ipv4"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_parses_quoted_values() {
        let release = OsRelease::parse(
            "ID=ubuntu\nPRETTY_NAME=\"Ubuntu 24.04.1 LTS\"\nVERSION_ID=\"24.04\"\n",
        );
        assert_eq!(release.id, "ubuntu");
        assert_eq!(release.pretty_name, "Ubuntu 24.04.1 LTS");
    }

    #[test]
    fn os_release_tolerates_garbage() {
        let release = OsRelease::parse("not-a-kv-line\n\nID=debian\n");
        assert_eq!(release.id, "debian");
        assert_eq!(release.pretty_name, "");
    }

    #[test]
    fn local_facts_have_a_user() {
        let facts = Facts::gather_local().unwrap();
        assert!(!facts.user.is_empty());
        assert!(facts.instance.is_none());
    }

    #[test]
    fn template_vars_include_facts_and_extras() {
        let facts = Facts {
            hostname: "web-1".into(),
            user: "ubuntu".into(),
            os_id: "ubuntu".into(),
            os_name: "Ubuntu 24.04".into(),
            instance: Some(InstanceFacts {
                instance_id: "i-abc123".into(),
                public_ipv4: Some("203.0.113.7".into()),
            }),
        };

        let mut extra = HashMap::new();
        extra.insert("listen_port".to_string(), "8000".to_string());
        // manifest vars win over facts
        extra.insert("hostname".to_string(), "override".to_string());

        let vars = facts.template_vars(&extra);
        assert_eq!(vars["instance_id"], "i-abc123");
        assert_eq!(vars["public_ipv4"], "203.0.113.7");
        assert_eq!(vars["listen_port"], "8000");
        assert_eq!(vars["hostname"], "override");
    }

    #[test]
    fn facts_serialize_without_instance_key_when_absent() {
        let facts = Facts {
            hostname: "h".into(),
            user: "u".into(),
            os_id: "ubuntu".into(),
            os_name: "Ubuntu".into(),
            instance: None,
        };
        let json = serde_json::to_string(&facts).unwrap();
        assert!(!json.contains("instance"));
    }
}
