//! Host suffix rules
//!
//! Rules are stored in a trie keyed by domain label, walked from the top
//! level label down, so `example.com` matches itself and every subdomain
//! but not `badexample.com`.

use super::HostMatch;
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
struct Node {
    next: HashMap<String, usize>,
    decision: Option<HostMatch>,
}

/// Label trie of host suffix rules
#[derive(Debug, Clone)]
pub struct HostRules {
    nodes: Vec<Node>,
    len: usize,
}

impl Default for HostRules {
    fn default() -> Self {
        Self {
            nodes: vec![Node::default()],
            len: 0,
        }
    }
}

fn labels(host: &str) -> impl Iterator<Item = String> + '_ {
    host.trim_end_matches('.')
        .rsplit('.')
        .filter(|l| !l.is_empty())
        .map(|l| l.to_ascii_lowercase())
}

impl HostRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a suffix rule; a leading `.` or `*.` is ignored
    pub fn insert(&mut self, suffix: &str, decision: HostMatch) {
        let suffix = suffix.trim().trim_start_matches("*.").trim_start_matches('.');
        let mut cur = 0usize;
        for label in labels(suffix) {
            cur = match self.nodes[cur].next.get(&label) {
                Some(&id) => id,
                None => {
                    let id = self.nodes.len();
                    self.nodes.push(Node::default());
                    self.nodes[cur].next.insert(label, id);
                    id
                }
            };
        }
        if cur == 0 {
            return;
        }
        if self.nodes[cur].decision.replace(decision).is_none() {
            self.len += 1;
        }
    }

    /// Decision of the longest matching suffix
    pub fn query(&self, host: &str) -> Option<HostMatch> {
        let mut best = None;
        let mut cur = 0usize;
        for label in labels(host) {
            match self.nodes[cur].next.get(&label) {
                Some(&id) => cur = id,
                None => break,
            }
            if let Some(d) = self.nodes[cur].decision {
                best = Some(d);
            }
        }
        best
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Verdict;

    #[test]
    fn test_suffix_matching() {
        let mut rules = HostRules::new();
        rules.insert("example.com", HostMatch::Verdict(Verdict::Direct));
        rules.insert("ads.example.com", HostMatch::Verdict(Verdict::Reject));
        rules.insert(".google.com", HostMatch::Public);

        assert_eq!(
            rules.query("example.com"),
            Some(HostMatch::Verdict(Verdict::Direct))
        );
        assert_eq!(
            rules.query("www.Example.com."),
            Some(HostMatch::Verdict(Verdict::Direct))
        );
        assert_eq!(
            rules.query("x.ads.example.com"),
            Some(HostMatch::Verdict(Verdict::Reject))
        );
        assert_eq!(rules.query("mail.google.com"), Some(HostMatch::Public));
        assert_eq!(rules.query("badexample.com"), None);
        assert_eq!(rules.query("com"), None);
        assert_eq!(rules.len(), 3);
    }

    #[test]
    fn test_empty_suffix_ignored() {
        let mut rules = HostRules::new();
        rules.insert("", HostMatch::Public);
        rules.insert("*.", HostMatch::Public);
        assert!(rules.is_empty());
        assert_eq!(rules.query("anything.net"), None);
    }
}
