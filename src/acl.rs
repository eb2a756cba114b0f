//! Access control: maps destination hosts to a routing action
// (c) 2024 Ross Younger
//!
//! Rules are evaluated in file order; the first match wins. Each line reads
//!
//! ```text
//! action matcher value [arg]
//! ```
//!
//! where `action` is one of `direct`, `proxy`, `block`, `hijack` (hijack
//! takes the substitute host as its argument), and `matcher` is one of:
//!
//! * `domain <name>` — exact hostname, or a wildcard pattern (`*.ads.example`)
//! * `domain-suffix <name>` — the name and any subdomain of it
//! * `ip <address>` — a literal v4/v6 address
//! * `cidr <network>` — e.g. `10.0.0.0/8`
//! * `all` — matches everything (useful as a final default)
//!
//! Blank lines and `#` comments are ignored. A missing ACL means everything
//! is proxied.
//!
//! `ip` and `cidr` rules need an address to compare against, so the engine
//! resolves the destination host up front. Resolution failure does not stop
//! matching (domain rules still apply); the error is reported alongside the
//! result for the caller to honour when the action needs a local dial.

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use ipnet::IpNet;
use wildmatch::WildMatch;

/// What to do with traffic to a matched destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Action {
    /// Dial the destination from this machine
    Direct,
    /// Tunnel through the remote server
    Proxy,
    /// Refuse the request
    Block,
    /// Dial a substitute host (the rule argument) instead, from this machine
    Hijack,
}

#[derive(Debug, Clone)]
enum Matcher {
    Domain(String),
    DomainPattern(WildMatch),
    DomainSuffix(String),
    Ip(IpAddr),
    Cidr(IpNet),
    All,
}

impl Matcher {
    fn matches(&self, host: &str, ip: Option<IpAddr>) -> bool {
        match self {
            Self::Domain(d) => host == d,
            Self::DomainPattern(p) => p.matches(host),
            Self::DomainSuffix(suffix) => {
                host == suffix || host.ends_with(&format!(".{suffix}"))
            }
            Self::Ip(rule_ip) => ip == Some(*rule_ip),
            Self::Cidr(net) => ip.is_some_and(|ip| net.contains(&ip)),
            Self::All => true,
        }
    }

}

#[derive(Debug, Clone)]
struct Rule {
    action: Action,
    arg: Option<String>,
    matcher: Matcher,
}

/// The result of matching one destination host
#[derive(Debug)]
pub struct AclResult {
    /// The action to take
    pub action: Action,
    /// Action argument (the hijack target)
    pub arg: Option<String>,
    /// The host's address, if resolution succeeded
    pub resolved: Option<IpAddr>,
    /// Why resolution failed, if it did
    pub resolve_err: Option<anyhow::Error>,
}

/// A loaded rule set. Read-only after parse; shareable without locks.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    rules: Vec<Rule>,
}

impl Engine {
    /// Loads a rule file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read ACL file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("unable to parse ACL file {}", path.display()))
    }

    /// Parses rule text
    pub fn parse(text: &str) -> Result<Self> {
        let mut rules = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            rules.push(
                Self::parse_rule(line).with_context(|| format!("ACL line {}", lineno + 1))?,
            );
        }
        Ok(Self { rules })
    }

    fn parse_rule(line: &str) -> Result<Rule> {
        let mut words = line.split_whitespace();
        let action = match words.next() {
            Some("direct") => Action::Direct,
            Some("proxy") => Action::Proxy,
            Some("block") => Action::Block,
            Some("hijack") => Action::Hijack,
            other => anyhow::bail!("unknown action {other:?}"),
        };
        let matcher = match words.next() {
            Some("all") => Matcher::All,
            Some(kind) => {
                let value = words
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("matcher '{kind}' needs a value"))?
                    .to_ascii_lowercase();
                match kind {
                    "domain" if value.contains('*') => {
                        Matcher::DomainPattern(WildMatch::new(&value))
                    }
                    "domain" => Matcher::Domain(value),
                    "domain-suffix" => Matcher::DomainSuffix(value),
                    "ip" => Matcher::Ip(
                        IpAddr::from_str(&value)
                            .with_context(|| format!("bad IP address '{value}'"))?,
                    ),
                    "cidr" => Matcher::Cidr(
                        IpNet::from_str(&value)
                            .with_context(|| format!("bad CIDR network '{value}'"))?,
                    ),
                    _ => anyhow::bail!("unknown matcher '{kind}'"),
                }
            }
            None => anyhow::bail!("missing matcher"),
        };
        let arg = words.next().map(str::to_string);
        if action == Action::Hijack && arg.is_none() {
            anyhow::bail!("hijack needs a target argument");
        }
        if let Some(trailing) = words.next() {
            anyhow::bail!("unexpected trailing word '{trailing}'");
        }
        Ok(Rule {
            action,
            arg,
            matcher,
        })
    }

    /// Resolves a destination host and walks the rules.
    /// No matching rule means [`Action::Proxy`].
    #[must_use]
    pub fn resolve_and_match(&self, host: &str) -> AclResult {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let (resolved, resolve_err) = match IpAddr::from_str(&host) {
            Ok(ip) => (Some(ip), None),
            Err(_) => match crate::util::resolve(&host) {
                Ok(ip) => (Some(ip), None),
                Err(e) => (None, Some(e)),
            },
        };
        for rule in &self.rules {
            if rule.matcher.matches(&host, resolved) {
                return AclResult {
                    action: rule.action,
                    arg: rule.arg.clone(),
                    resolved,
                    resolve_err,
                };
            }
        }
        AclResult {
            action: Action::Proxy,
            arg: None,
            resolved,
            resolve_err,
        }
    }
}
