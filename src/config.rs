//! YAML configuration schema and validation.
//!
//! Mirrors the `#[serde(default)]` / `Option<T>` idiom
//! `kftray-commons::models::config_model::Config` uses, generalized to the
//! nested `contexts[].namespaces[].forwards[]` document shape.

use std::collections::HashSet;
use std::time::Duration;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(D::Error::custom)
}

fn deserialize_duration_opt<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| parse_duration(&s).map_err(D::Error::custom))
        .transpose()
}

/// Parses a duration like `"3s"`, `"90m"`, `"2h"`. Bare integers are seconds.
fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => (&raw[..idx], &raw[idx..]),
        None => (raw, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {raw:?}"))?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => return Err(format!("unknown duration unit {other:?} in {raw:?}")),
    };
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthCheckMethod {
    TcpDial,
    DataTransfer,
}

impl Default for HealthCheckMethod {
    fn default() -> Self {
        Self::DataTransfer
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthCheckConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    pub method: HealthCheckMethod,
    #[serde(
        rename = "maxConnectionAge",
        deserialize_with = "deserialize_duration"
    )]
    pub max_connection_age: Duration,
    #[serde(rename = "maxIdleTime", deserialize_with = "deserialize_duration")]
    pub max_idle_time: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(2),
            method: HealthCheckMethod::DataTransfer,
            max_connection_age: Duration::from_secs(25 * 60),
            max_idle_time: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReliabilityConfig {
    #[serde(rename = "tcpKeepalive", deserialize_with = "deserialize_duration")]
    pub tcp_keepalive: Duration,
    #[serde(rename = "dialTimeout", deserialize_with = "deserialize_duration")]
    pub dial_timeout: Duration,
    #[serde(rename = "retryOnStale")]
    pub retry_on_stale: bool,
    #[serde(rename = "watchdogPeriod", deserialize_with = "deserialize_duration")]
    pub watchdog_period: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            tcp_keepalive: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(30),
            retry_on_stale: true,
            watchdog_period: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardConfig {
    pub resource: String,
    #[serde(default)]
    pub selector: Option<String>,
    pub protocol: Protocol,
    pub port: u32,
    #[serde(rename = "localPort")]
    pub local_port: u32,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default, rename = "httpLog")]
    pub http_log: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextConfig {
    pub name: String,
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RootConfig {
    pub contexts: Vec<ContextConfig>,
    pub health_check: HealthCheckConfig,
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub mdns: Option<serde_yaml::Value>,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            contexts: Vec::new(),
            health_check: HealthCheckConfig::default(),
            reliability: ReliabilityConfig::default(),
            mdns: None,
        }
    }
}

/// One forward with its declaring context/namespace resolved into a flat,
/// identity-bearing record. This is what the Manager diffs across reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardId(String);

impl ForwardId {
    /// Builds an identifier from a raw string, e.g. one the CLI's
    /// `--enable`/`--disable` flags took from the user. Does not validate
    /// that a matching forward exists — the Manager's lookup does that.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl std::fmt::Display for ForwardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct DeclaredForward {
    pub id: ForwardId,
    pub context: String,
    pub namespace: String,
    pub resource: String,
    pub selector: Option<String>,
    pub protocol: Protocol,
    pub remote_port: u16,
    pub local_port: u16,
    pub alias: Option<String>,
    pub http_log: bool,
}

impl PartialEq for DeclaredForward {
    /// Used by the Manager's reload diff to decide "same identifier, fields
    /// changed" (an update) vs. "identical" (a no-op).
    fn eq(&self, other: &Self) -> bool {
        self.context == other.context
            && self.namespace == other.namespace
            && self.resource == other.resource
            && self.selector == other.selector
            && self.protocol == other.protocol
            && self.remote_port == other.remote_port
            && self.local_port == other.local_port
            && self.alias == other.alias
            && self.http_log == other.http_log
    }
}

fn is_rfc1123_label(s: &str) -> bool {
    if s.is_empty() || s.len() > 63 {
        return false;
    }
    let bytes = s.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes
            .iter()
            .all(|&b| alnum(b) || b == b'-')
}

/// Parses, flattens, and validates a configuration document. All violations
/// found are returned together rather than failing on the first, so a
/// `--check-only` run can report everything in one pass.
pub fn parse(yaml: &str) -> Result<RootConfig> {
    let root: RootConfig = serde_yaml::from_str(yaml)?;
    Ok(root)
}

pub fn flatten(root: &RootConfig) -> std::result::Result<Vec<DeclaredForward>, Vec<String>> {
    let mut forwards = Vec::new();
    let mut problems = Vec::new();

    if root.contexts.is_empty() {
        problems.push("contexts must not be empty".to_string());
    }

    for ctx in &root.contexts {
        for ns in &ctx.namespaces {
            for fwd in &ns.forwards {
                match flatten_one(ctx, ns, fwd) {
                    Ok(declared) => forwards.push(declared),
                    Err(e) => problems.push(e),
                }
            }
        }
    }

    check_port_range(&root.contexts, &mut problems);
    check_duplicate_local_ports(&forwards, &mut problems);
    check_alias_uniqueness(&forwards, &mut problems);

    if problems.is_empty() {
        Ok(forwards)
    } else {
        Err(problems)
    }
}

fn flatten_one(
    ctx: &ContextConfig,
    ns: &NamespaceConfig,
    fwd: &ForwardConfig,
) -> std::result::Result<DeclaredForward, String> {
    let (kind, name) = split_resource(&fwd.resource)
        .ok_or_else(|| format!("malformed resource {:?}", fwd.resource))?;

    match kind {
        "pod" => {
            if name.is_empty() && fwd.selector.as_deref().unwrap_or("").is_empty() {
                return Err(format!(
                    "pod resource {:?} requires either a /<name> prefix or a selector",
                    fwd.resource
                ));
            }
            if !name.is_empty() && fwd.selector.is_some() {
                return Err(format!(
                    "pod resource {:?} must not declare both a name and a selector",
                    fwd.resource
                ));
            }
        }
        "service" => {
            if name.is_empty() {
                return Err(format!("service resource {:?} has no name", fwd.resource));
            }
            if fwd.selector.is_some() {
                return Err(format!(
                    "service resource {:?} must not declare a selector",
                    fwd.resource
                ));
            }
        }
        other => return Err(format!("unsupported resource kind {other:?}")),
    }

    if let Some(alias) = &fwd.alias
        && !is_rfc1123_label(alias)
    {
        return Err(format!("alias {alias:?} is not RFC-1123 compatible"));
    }

    let id = match &fwd.alias {
        Some(alias) => ForwardId(format!("{alias}:{}", fwd.local_port)),
        None => ForwardId(format!(
            "{}/{}/{}:{}",
            ctx.name, ns.name, fwd.resource, fwd.local_port
        )),
    };

    Ok(DeclaredForward {
        id,
        context: ctx.name.clone(),
        namespace: ns.name.clone(),
        resource: fwd.resource.clone(),
        selector: fwd.selector.clone(),
        protocol: fwd.protocol,
        remote_port: fwd.port as u16,
        local_port: fwd.local_port as u16,
        alias: fwd.alias.clone(),
        http_log: fwd.http_log.unwrap_or(false),
    })
}

fn split_resource(resource: &str) -> Option<(&str, &str)> {
    match resource.split_once('/') {
        Some((kind, name)) => Some((kind, name)),
        None => Some((resource, "")),
    }
}

fn check_port_range(contexts: &[ContextConfig], problems: &mut Vec<String>) {
    for ctx in contexts {
        for ns in &ctx.namespaces {
            for fwd in &ns.forwards {
                for (label, port) in [("port", fwd.port), ("localPort", fwd.local_port)] {
                    if port == 0 || port > 65535 {
                        problems.push(format!(
                            "{label} {port} out of range [1, 65535] for resource {:?}",
                            fwd.resource
                        ));
                    }
                }
            }
        }
    }
}

fn check_duplicate_local_ports(forwards: &[DeclaredForward], problems: &mut Vec<String>) {
    let mut seen: std::collections::HashMap<u16, Vec<&DeclaredForward>> =
        std::collections::HashMap::new();
    for fwd in forwards {
        seen.entry(fwd.local_port).or_default().push(fwd);
    }
    for (port, group) in seen {
        if group.len() > 1 {
            let descriptors: Vec<String> = group
                .iter()
                .map(|f| format!("{}/{}/{}", f.context, f.namespace, f.resource))
                .collect();
            problems.push(format!(
                "Duplicate local port {port} listing both full forward descriptors: [{}]",
                descriptors.join(", ")
            ));
        }
    }
}

fn check_alias_uniqueness(forwards: &[DeclaredForward], problems: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for fwd in forwards {
        if let Some(alias) = &fwd.alias
            && !seen.insert(alias.clone())
        {
            problems.push(format!("duplicate alias {alias:?} across configuration"));
        }
    }
}

/// Convenience: parse and flatten in one call, converting validation
/// problems into a single fatal [`Error::Config`].
pub fn load(yaml: &str) -> Result<Vec<DeclaredForward>> {
    let root = parse(yaml)?;
    flatten(&root).map_err(|problems| Error::config(problems.join("; ")))
}
