//! Proxy rule table: request path patterns mapped to target paths.
//!
//! Patterns use `{param}` placeholders per path segment. Matching is
//! first-match-wins in insertion order; extracted parameters are handed
//! to the dispatcher (e.g. `{model_id}`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRule {
    /// Request pattern, e.g. `/api/v1/models/{model_id}/chat`.
    pub path_pattern: String,
    /// Upstream path the request is rewritten to.
    pub target_path: String,
    /// Accepted HTTP methods, uppercase.
    pub methods: Vec<String>,
}

impl ProxyRule {
    /// Match a request path + method, extracting `{param}` values.
    fn matches(&self, path: &str, method: &str) -> Option<HashMap<String, String>> {
        if !self
            .methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
        {
            return None;
        }

        let pattern_segments: Vec<&str> =
            self.path_pattern.trim_matches('/').split('/').collect();
        let path_segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        if pattern_segments.len() != path_segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (pattern, actual) in pattern_segments.iter().zip(path_segments.iter()) {
            if let Some(name) = pattern
                .strip_prefix('{')
                .and_then(|p| p.strip_suffix('}'))
            {
                params.insert(name.to_string(), (*actual).to_string());
            } else if pattern != actual {
                return None;
            }
        }
        Some(params)
    }
}

/// Ordered rule table.
pub struct RuleSet {
    rules: parking_lot::RwLock<Vec<ProxyRule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            rules: parking_lot::RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, rule: ProxyRule) {
        self.rules.write().push(rule);
    }

    /// Remove all rules with the given pattern.
    pub fn remove(&self, path_pattern: &str) {
        self.rules.write().retain(|r| r.path_pattern != path_pattern);
    }

    /// First rule matching path + method, with extracted parameters.
    pub fn match_rule(&self, path: &str, method: &str) -> Option<(ProxyRule, HashMap<String, String>)> {
        let rules = self.rules.read();
        for rule in rules.iter() {
            if let Some(params) = rule.matches(path, method) {
                return Some((rule.clone(), params));
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    pub fn all(&self) -> Vec<ProxyRule> {
        self.rules.read().clone()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_rule() -> ProxyRule {
        ProxyRule {
            path_pattern: "/api/v1/models/{model_id}/chat".to_string(),
            target_path: "/v1/chat/completions".to_string(),
            methods: vec!["POST".to_string()],
        }
    }

    #[test]
    fn test_add_and_remove() {
        let rules = RuleSet::new();
        rules.add(chat_rule());
        assert_eq!(rules.len(), 1);
        rules.remove("/api/v1/models/{model_id}/chat");
        assert!(rules.is_empty());
    }

    #[test]
    fn test_match_extracts_params() {
        let rules = RuleSet::new();
        rules.add(chat_rule());

        let (rule, params) = rules
            .match_rule("/api/v1/models/test-model/chat", "POST")
            .unwrap();
        assert_eq!(rule.target_path, "/v1/chat/completions");
        assert_eq!(params["model_id"], "test-model");
    }

    #[test]
    fn test_no_match_on_path_or_method() {
        let rules = RuleSet::new();
        rules.add(chat_rule());

        assert!(rules.match_rule("/api/v1/other", "POST").is_none());
        assert!(rules
            .match_rule("/api/v1/models/test-model/chat", "GET")
            .is_none());
        assert!(rules
            .match_rule("/api/v1/models/test-model/chat/extra", "POST")
            .is_none());
    }

    #[test]
    fn test_first_match_wins() {
        let rules = RuleSet::new();
        rules.add(ProxyRule {
            path_pattern: "/api/{anything}".to_string(),
            target_path: "/first".to_string(),
            methods: vec!["GET".to_string()],
        });
        rules.add(ProxyRule {
            path_pattern: "/api/specific".to_string(),
            target_path: "/second".to_string(),
            methods: vec!["GET".to_string()],
        });

        let (rule, _) = rules.match_rule("/api/specific", "GET").unwrap();
        assert_eq!(rule.target_path, "/first");
    }

    #[test]
    fn test_method_case_insensitive() {
        let rules = RuleSet::new();
        rules.add(chat_rule());
        assert!(rules
            .match_rule("/api/v1/models/m/chat", "post")
            .is_some());
    }
}
