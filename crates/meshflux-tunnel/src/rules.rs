//! Dynamic routing rules
//!
//! The host application drops a rule list into the shared data directory
//! (`routing_rules.json` or `routing_rules.txt`). Matching traffic is sent
//! to the `proxy` outbound; the rules are spliced into the engine
//! configuration right after its `sniff` rule.

use crate::error::{Result, TunnelError};
use ipnetwork::IpNetwork;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use tracing::{debug, info, warn};

/// Outbound tag matching traffic is routed to
pub const PROXY_OUTBOUND: &str = "proxy";

/// File names the host application writes rules to
pub const RULES_JSON_FILE: &str = "routing_rules.json";
pub const RULES_TEXT_FILE: &str = "routing_rules.txt";

/// Encoding of a rule list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulesFormat {
    Json,
    Text,
}

impl RulesFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "text" | "txt" => Some(Self::Text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    IpCidr,
    Domain,
    DomainSuffix,
    DomainRegex,
}

impl RuleKind {
    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ip" | "cidr" | "ip_cidr" | "ip-cidr" => Some(Self::IpCidr),
            "domain" => Some(Self::Domain),
            "suffix" | "domain_suffix" | "domain-suffix" => Some(Self::DomainSuffix),
            "regex" | "domain_regex" | "domain-regex" => Some(Self::DomainRegex),
            _ => None,
        }
    }
}

/// Destinations routed through the proxy outbound
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingRules {
    pub ip_cidr: Vec<String>,
    pub domain: Vec<String>,
    pub domain_suffix: Vec<String>,
    pub domain_regex: Vec<String>,
}

impl RoutingRules {
    pub fn is_empty(&self) -> bool {
        self.ip_cidr.is_empty()
            && self.domain.is_empty()
            && self.domain_suffix.is_empty()
            && self.domain_regex.is_empty()
    }

    /// Parse and normalize a rule list in the given format
    pub fn parse(format: RulesFormat, content: &str) -> Result<Self> {
        let mut rules = match format {
            RulesFormat::Json => Self::parse_json(content)?,
            RulesFormat::Text => Self::parse_text(content)?,
        };
        rules.normalize();
        Ok(rules)
    }

    /// Parse a JSON rule list.
    ///
    /// Accepted shapes: `{"ip_cidr":[..],"domain":[..],..}`, the same object
    /// wrapped as `{"proxy":{..}}`, or `{"rules":[{"domain_suffix":[..]},..]}`.
    /// Every list may also be a single string.
    pub fn parse_json(content: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| TunnelError::ConfigInvalid(format!("routing rules: {}", e)))?;
        let Value::Object(mut object) = value else {
            return Err(TunnelError::ConfigInvalid(
                "routing rules must be a JSON object".to_string(),
            ));
        };

        if let Some(Value::Object(proxy)) = object.remove("proxy") {
            object = proxy;
        }

        let mut rules = Self::default();
        match object.get("rules") {
            Some(Value::Array(entries)) => {
                for entry in entries.iter().filter_map(Value::as_object) {
                    rules.extend_from_object(entry);
                }
            }
            _ => rules.extend_from_object(&object),
        }
        Ok(rules)
    }

    /// Parse a line-oriented rule list.
    ///
    /// Lines are `type:value`, `type value`, or a bare value. Bare values
    /// take the type of the current `[section]`, otherwise IPs and CIDRs
    /// become `ip_cidr` and anything else `domain`. `#` and `//` start
    /// comment lines.
    pub fn parse_text(content: &str) -> Result<Self> {
        let mut rules = Self::default();
        let mut section = None;

        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let kind = RuleKind::parse(name).ok_or_else(|| {
                    TunnelError::ConfigInvalid(format!("unknown rules section [{}]", name.trim()))
                })?;
                section = Some(kind);
                continue;
            }

            if let Some((kind, value)) = parse_typed_line(line) {
                rules.push(kind, value);
            } else if let Some(kind) = section {
                rules.push(kind, line);
            } else if is_ip_or_cidr(line) {
                rules.push(RuleKind::IpCidr, line);
            } else {
                rules.push(RuleKind::Domain, line);
            }
        }
        Ok(rules)
    }

    /// Drop duplicates, keeping the first occurrence
    pub fn normalize(&mut self) {
        for list in [
            &mut self.ip_cidr,
            &mut self.domain,
            &mut self.domain_suffix,
            &mut self.domain_regex,
        ] {
            let mut seen = HashSet::new();
            list.retain(|value| seen.insert(value.clone()));
        }
    }

    /// Engine route rules sending every match to `outbound`.
    ///
    /// Suffixes get a leading dot so subdomains match; suffixes given
    /// without one also match the bare domain through an extra `domain` rule.
    pub fn to_route_rules(&self, outbound: &str) -> Vec<Value> {
        let mut rules = Vec::new();
        if !self.ip_cidr.is_empty() {
            rules.push(json!({ "ip_cidr": self.ip_cidr, "outbound": outbound }));
        }
        if !self.domain.is_empty() {
            rules.push(json!({ "domain": self.domain, "outbound": outbound }));
        }
        if !self.domain_suffix.is_empty() {
            let bare: Vec<&String> = self
                .domain_suffix
                .iter()
                .filter(|s| !s.starts_with('.'))
                .collect();
            if !bare.is_empty() {
                rules.push(json!({ "domain": bare, "outbound": outbound }));
            }

            let dotted: Vec<String> = self
                .domain_suffix
                .iter()
                .map(|s| {
                    if s.starts_with('.') {
                        s.clone()
                    } else {
                        format!(".{}", s)
                    }
                })
                .collect();
            rules.push(json!({ "domain_suffix": dotted, "outbound": outbound }));
        }
        if !self.domain_regex.is_empty() {
            rules.push(json!({ "domain_regex": self.domain_regex, "outbound": outbound }));
        }
        rules
    }

    /// Splice the rules into an engine configuration.
    ///
    /// The rules go right after the first `sniff` rule, which is added at
    /// the front when missing. Returns `false` and leaves the configuration
    /// alone when there is nothing to add or no `proxy` outbound to route to.
    pub fn merge_into(&self, config: &mut Value) -> bool {
        if self.is_empty() {
            return false;
        }
        if !has_outbound(config, PROXY_OUTBOUND) {
            warn!(
                "Configuration has no \"{}\" outbound, ignoring routing rules",
                PROXY_OUTBOUND
            );
            return false;
        }
        let Some(root) = config.as_object_mut() else {
            return false;
        };

        let route = root
            .entry("route")
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(route) = route.as_object_mut() else {
            warn!("Configuration route is not an object, ignoring routing rules");
            return false;
        };
        route
            .entry("final")
            .or_insert_with(|| Value::String(PROXY_OUTBOUND.to_string()));

        let rules = route
            .entry("rules")
            .or_insert_with(|| Value::Array(Vec::new()));
        if !rules.is_array() {
            *rules = Value::Array(Vec::new());
        }
        let Some(rules) = rules.as_array_mut() else {
            return false;
        };

        let sniff = match rules.iter().position(|r| r["action"] == "sniff") {
            Some(index) => index,
            None => {
                rules.insert(0, json!({ "action": "sniff" }));
                0
            }
        };

        let added = self.to_route_rules(PROXY_OUTBOUND);
        debug!("Inserting {} routing rules after sniff", added.len());
        let tail = rules.split_off(sniff + 1);
        rules.extend(added);
        rules.extend(tail);
        true
    }

    fn push(&mut self, kind: RuleKind, value: &str) {
        let value = value.trim();
        if value.is_empty() {
            return;
        }
        let list = match kind {
            RuleKind::IpCidr => &mut self.ip_cidr,
            RuleKind::Domain => &mut self.domain,
            RuleKind::DomainSuffix => &mut self.domain_suffix,
            RuleKind::DomainRegex => &mut self.domain_regex,
        };
        list.push(value.to_string());
    }

    fn extend_from_object(&mut self, object: &Map<String, Value>) {
        self.ip_cidr.extend(string_list(object.get("ip_cidr")));
        self.domain.extend(string_list(object.get("domain")));
        self.domain_suffix
            .extend(string_list(object.get("domain_suffix")));
        self.domain_regex
            .extend(string_list(object.get("domain_regex")));
    }
}

/// Load the rule file from the shared data directory.
///
/// `routing_rules.json` wins over `routing_rules.txt`. `None` when neither
/// exists.
pub fn load_rules_file(shared_data_dir: &Path) -> Result<Option<RoutingRules>> {
    for (name, format) in [
        (RULES_JSON_FILE, RulesFormat::Json),
        (RULES_TEXT_FILE, RulesFormat::Text),
    ] {
        let path = shared_data_dir.join(name);
        if !path.exists() {
            continue;
        }
        let content = fs::read_to_string(&path).map_err(|e| {
            TunnelError::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        let rules = RoutingRules::parse(format, &content)?;
        info!("Loaded routing rules from {:?}", path);
        return Ok(Some(rules));
    }
    Ok(None)
}

/// Validate `content` and store it as the rule file for `format`.
///
/// The file of the other format is removed so the new rules take effect.
/// The write goes through a temporary file and a rename.
pub fn store_rules_file(shared_data_dir: &Path, format: RulesFormat, content: &str) -> Result<()> {
    RoutingRules::parse(format, content)?;

    let (name, other) = match format {
        RulesFormat::Json => (RULES_JSON_FILE, RULES_TEXT_FILE),
        RulesFormat::Text => (RULES_TEXT_FILE, RULES_JSON_FILE),
    };

    let path = shared_data_dir.join(name);
    let staging = shared_data_dir.join(format!(".{}.tmp", name));
    fs::write(&staging, content)?;
    fs::rename(&staging, &path)?;

    let other = shared_data_dir.join(other);
    if other.exists() {
        fs::remove_file(&other)?;
    }
    info!("Stored routing rules in {:?}", path);
    Ok(())
}

fn parse_typed_line(line: &str) -> Option<(RuleKind, &str)> {
    // Split on the first separator only so regexes stay intact
    let (kind, value) = match line.split_once(':') {
        Some(split) => split,
        None => line.split_once(char::is_whitespace)?,
    };
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    RuleKind::parse(kind).map(|kind| (kind, value))
}

fn is_ip_or_cidr(value: &str) -> bool {
    value.parse::<IpAddr>().is_ok() || value.parse::<IpNetwork>().is_ok()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn has_outbound(config: &Value, tag: &str) -> bool {
    config["outbounds"]
        .as_array()
        .map(|outbounds| outbounds.iter().any(|o| o["tag"] == tag))
        .unwrap_or(false)
}
