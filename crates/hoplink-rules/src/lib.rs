//! Ordered routing rules: who may go where, and through which hop.
//!
//! Rules come from configuration, are matched first-match-wins, and are
//! never mutated after startup, so matching is pure and lock-free.

pub mod router;

pub use router::{Router, DIRECT_PROVIDER};

use serde::Deserialize;

/// A next-hop bridge identity. The URL doubles as the provider registry
/// key; the key is a 32-byte pre-shared secret as 64 hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExitNode {
    pub url: String,
    #[serde(default)]
    pub key: String,
}

/// One routing criterion. Empty fields match anything; a rule matches
/// only when every non-empty criterion is satisfied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Rule {
    /// Hostname suffixes, matched on label boundaries: `example.com`
    /// matches itself and any subdomain, never `notexample.com`.
    pub target: Vec<String>,
    /// Exact caller address.
    pub source: String,
    /// Exact target port.
    #[serde(rename = "targetport", alias = "targetPort")]
    pub target_port: String,
    /// Refuse matching requests outright.
    pub block: bool,
    /// Forward matching requests through this bridge instead of directly.
    pub exit: Option<ExitNode>,
}

impl Rule {
    fn matches(&self, target_host: &str, target_port: &str, source: &str) -> bool {
        (self.target.is_empty()
            || self
                .target
                .iter()
                .any(|s| host_matches_suffix(target_host, s)))
            && (self.source.is_empty() || self.source == source)
            && (self.target_port.is_empty() || self.target_port == target_port)
    }
}

/// Suffixes bind to whole labels. A leading dot restricts the suffix to
/// subdomains.
fn host_matches_suffix(host: &str, suffix: &str) -> bool {
    if suffix.starts_with('.') {
        return host.ends_with(suffix);
    }
    host == suffix
        || (host.len() > suffix.len()
            && host.ends_with(suffix)
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
}

/// The immutable ordered rule set plus the implicit default rule
/// (allow, forward directly).
#[derive(Debug, Default)]
pub struct RulesEngine {
    rules: Vec<Rule>,
    default_rule: Rule,
}

impl RulesEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            default_rule: Rule::default(),
        }
    }

    /// First rule whose every specified criterion matches; the default
    /// rule when none does. Configuration order is the tie-break, so the
    /// most specific rules belong first.
    pub fn find_match(&self, target_host: &str, target_port: Option<u16>, source: &str) -> &Rule {
        let port = target_port.map(|p| p.to_string()).unwrap_or_default();
        self.rules
            .iter()
            .find(|rule| rule.matches(target_host, &port, source))
            .unwrap_or(&self.default_rule)
    }

    /// Every distinct exit node, deduplicated by URL in first-seen order.
    pub fn exit_nodes(&self) -> Vec<&ExitNode> {
        let mut seen = std::collections::HashSet::new();
        self.rules
            .iter()
            .filter_map(|rule| rule.exit.as_ref())
            .filter(|exit| seen.insert(exit.url.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(suffixes: &[&str], source: &str, port: &str) -> Rule {
        Rule {
            target: suffixes.iter().map(|s| s.to_string()).collect(),
            source: source.to_string(),
            target_port: port.to_string(),
            ..Rule::default()
        }
    }

    fn exit(url: &str) -> Option<ExitNode> {
        Some(ExitNode {
            url: url.to_string(),
            key: String::new(),
        })
    }

    #[test]
    fn first_full_match_wins_in_order() {
        let engine = RulesEngine::new(vec![
            Rule {
                exit: exit("ws://hop-a"),
                ..rule(&["example.com"], "", "443")
            },
            Rule {
                exit: exit("ws://hop-b"),
                ..rule(&["example.com"], "", "")
            },
        ]);

        let matched = engine.find_match("api.example.com", Some(443), "10.0.0.1:1");
        assert_eq!(matched.exit.as_ref().unwrap().url, "ws://hop-a");

        // Port mismatch skips the first rule entirely, not partially.
        let matched = engine.find_match("api.example.com", Some(80), "10.0.0.1:1");
        assert_eq!(matched.exit.as_ref().unwrap().url, "ws://hop-b");
    }

    #[test]
    fn suffix_matching_stops_at_label_boundaries() {
        let engine = RulesEngine::new(vec![Rule {
            block: true,
            ..rule(&["example.com"], "", "")
        }]);
        assert!(engine.find_match("example.com", None, "s").block);
        assert!(engine.find_match("api.example.com", None, "s").block);
        assert!(engine.find_match("deep.api.example.com", None, "s").block);
        assert!(!engine.find_match("notexample.org", None, "s").block);
        // Ends with the suffix bytes but not on a label boundary.
        assert!(!engine.find_match("notexample.com", None, "s").block);
    }

    #[test]
    fn dotted_suffixes_match_subdomains_only() {
        let engine = RulesEngine::new(vec![Rule {
            block: true,
            ..rule(&[".example.com"], "", "")
        }]);
        assert!(engine.find_match("api.example.com", None, "s").block);
        assert!(!engine.find_match("example.com", None, "s").block);
        assert!(!engine.find_match("notexample.com", None, "s").block);
    }

    #[test]
    fn empty_criteria_match_anything() {
        let engine = RulesEngine::new(vec![Rule {
            block: true,
            ..Rule::default()
        }]);
        assert!(engine.find_match("anything.at.all", Some(1), "anyone").block);
    }

    #[test]
    fn source_and_port_are_exact_matches() {
        let engine = RulesEngine::new(vec![Rule {
            block: true,
            ..rule(&[], "10.0.0.7:555", "8080")
        }]);
        assert!(engine.find_match("h", Some(8080), "10.0.0.7:555").block);
        assert!(!engine.find_match("h", Some(8080), "10.0.0.8:555").block);
        assert!(!engine.find_match("h", None, "10.0.0.7:555").block);
    }

    #[test]
    fn unmatched_falls_to_default_allow_direct() {
        let engine = RulesEngine::new(vec![Rule {
            block: true,
            ..rule(&["blocked.example"], "", "")
        }]);
        let rule = engine.find_match("fine.example", None, "s");
        assert!(!rule.block);
        assert!(rule.exit.is_none());
    }

    #[test]
    fn exit_nodes_dedup_by_url_first_seen_order() {
        let engine = RulesEngine::new(vec![
            Rule {
                exit: exit("ws://hop-b"),
                ..Rule::default()
            },
            Rule {
                exit: exit("ws://hop-a"),
                ..Rule::default()
            },
            Rule {
                exit: exit("ws://hop-b"),
                ..Rule::default()
            },
            Rule::default(),
        ]);
        let urls: Vec<_> = engine.exit_nodes().iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, ["ws://hop-b", "ws://hop-a"]);
    }

    #[test]
    fn rules_deserialize_from_yaml() {
        let yaml = r#"
- target: ["internal.example.com"]
  block: true
- target: ["example.com", "example.org"]
  targetport: "443"
  exit:
    url: "ws://exit.example.net:8080"
    key: "aa"
- source: "192.168.1.50:0"
"#;
        let rules: Vec<Rule> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules[0].block);
        assert_eq!(rules[1].target_port, "443");
        assert_eq!(
            rules[1].exit.as_ref().unwrap().url,
            "ws://exit.example.net:8080"
        );
        assert_eq!(rules[2].source, "192.168.1.50:0");
    }
}
