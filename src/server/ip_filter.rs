//! IP-based access control
//!
//! Rules map address prefixes to the set of app ids they may reach (empty
//! set = all apps). When any rules are configured the policy is
//! deny-by-default: the longest matching prefix decides, and no match at all
//! is an implicit deny.

use crate::error::{EdgeError, Result};
use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;

#[derive(Debug, Clone)]
struct IpRule {
    prefix: IpNet,
    /// Empty means all apps are allowed
    allowed_app_ids: Vec<String>,
}

impl IpRule {
    fn allows_app(&self, app_id: &str) -> bool {
        self.allowed_app_ids.is_empty() || self.allowed_app_ids.iter().any(|id| id == app_id)
    }
}

/// Compiled rule set. Empty = IP filtering not in use.
#[derive(Debug, Clone, Default)]
pub struct IpRules {
    rules: Vec<IpRule>,
}

/// JSON rules file format
#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    allow_all: Vec<AllowAll>,
    #[serde(default)]
    allow_specified: Vec<AllowSpecified>,
}

#[derive(Debug, Deserialize)]
struct AllowAll {
    prefix: String,
}

#[derive(Debug, Deserialize)]
struct AllowSpecified {
    prefix: String,
    apps: Vec<String>,
}

impl IpRules {
    /// No filtering
    pub fn none() -> Self {
        Self::default()
    }

    /// Load rules from a JSON file; a missing file just means no rules
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::none());
        }

        let raw = std::fs::read(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let file: RulesFile = serde_json::from_slice(raw)?;

        let mut rules = Vec::new();

        for allow in &file.allow_all {
            rules.push(IpRule {
                prefix: parse_prefix(&allow.prefix)?,
                allowed_app_ids: Vec::new(),
            });
        }

        for allow in &file.allow_specified {
            if allow.apps.is_empty() {
                return Err(EdgeError::Validation(format!(
                    "allow_specified {} has no apps",
                    allow.prefix
                )));
            }
            rules.push(IpRule {
                prefix: parse_prefix(&allow.prefix)?,
                allowed_app_ids: allow.apps.clone(),
            });
        }

        if rules.is_empty() {
            // a present-but-empty file is more likely a mistake than intent
            return Err(EdgeError::Validation("empty IP rules file".to_string()));
        }

        Ok(Self { rules })
    }

    /// Pure predicate: may `ip` access `app_id`? `Err` carries the denial
    /// reason for the 403 body.
    pub fn check(&self, ip: IpAddr, app_id: &str) -> std::result::Result<(), String> {
        if self.rules.is_empty() {
            return Ok(());
        }

        // longest matching prefix decides
        let matched = self
            .rules
            .iter()
            .filter(|rule| rule.prefix.contains(&ip))
            .max_by_key(|rule| rule.prefix.prefix_len());

        match matched {
            Some(rule) if rule.allows_app(app_id) => Ok(()),
            Some(_) => Err(format!("your IP ({}) is not allowed (explicit deny)", ip)),
            None => Err(format!("your IP ({}) is not allowed (implicit deny)", ip)),
        }
    }
}

/// Accept CIDR notation or a bare address (/32 or /128)
fn parse_prefix(raw: &str) -> Result<IpNet> {
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(net);
    }

    raw.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| EdgeError::Validation(format!("invalid IP prefix: {}", raw)))
}
