//! Rule-based page classification.
//!
//! URL and title rules narrow extraction down to the field groups a page
//! can plausibly feed. Fully deterministic; an LLM-assisted method can
//! slot in behind the same result type later.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Method that produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationMethod {
    Rule,
}

impl ClassificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub page_type: String,
    /// Field group names to extract. Empty means "extract all groups".
    pub relevant_groups: Vec<String>,
    pub skip_extraction: bool,
    pub confidence: f64,
    pub method: ClassificationMethod,
    pub reasoning: Option<String>,
}

/// URL regex mapped to the groups it implies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRule {
    pub pattern: String,
    pub groups: Vec<String>,
    #[serde(default)]
    pub page_type: Option<String>,
}

/// Title keyword mapped to the groups it implies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleRule {
    pub keyword: String,
    pub groups: Vec<String>,
}

/// Per-project classification rules, deserialized from
/// `Project.classification_config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationConfig {
    #[serde(default)]
    pub skip_patterns: Vec<String>,
    #[serde(default)]
    pub url_patterns: Vec<UrlRule>,
    #[serde(default)]
    pub title_keywords: Vec<TitleRule>,
}

pub struct PageClassifier {
    skip_patterns: Vec<Regex>,
    url_rules: Vec<(Regex, UrlRule)>,
    title_rules: Vec<TitleRule>,
    /// Known group names; matches outside this set are dropped.
    available_groups: Option<BTreeSet<String>>,
}

impl PageClassifier {
    pub fn new(config: &ClassificationConfig, available_groups: Option<&[String]>) -> Self {
        let skip_patterns = config
            .skip_patterns
            .iter()
            .filter_map(|p| compile(p))
            .collect();
        let url_rules = config
            .url_patterns
            .iter()
            .filter_map(|rule| compile(&rule.pattern).map(|re| (re, rule.clone())))
            .collect();

        Self {
            skip_patterns,
            url_rules,
            title_rules: config.title_keywords.clone(),
            available_groups: available_groups.map(|groups| groups.iter().cloned().collect()),
        }
    }

    /// Classify a page from its URL and title.
    pub fn classify(&self, url: &str, title: Option<&str>) -> ClassificationResult {
        let url_lower = url.to_lowercase();

        for pattern in &self.skip_patterns {
            if pattern.is_match(&url_lower) {
                return ClassificationResult {
                    page_type: "skip".to_string(),
                    relevant_groups: Vec::new(),
                    skip_extraction: true,
                    confidence: 0.9,
                    method: ClassificationMethod::Rule,
                    reasoning: Some(format!("URL matches skip pattern: {}", pattern.as_str())),
                };
            }
        }

        let mut matched: BTreeSet<String> = BTreeSet::new();
        let mut confidence: f64 = 0.0;
        let mut page_type = "general".to_string();
        let mut reasons: Vec<String> = Vec::new();

        for (pattern, rule) in &self.url_rules {
            if pattern.is_match(&url_lower) {
                matched.extend(rule.groups.iter().cloned());
                confidence = confidence.max(0.8);
                if let Some(pt) = &rule.page_type {
                    page_type = pt.clone();
                }
                reasons.push(format!("URL matches: {}", rule.pattern));
            }
        }

        if let Some(title) = title {
            let title_lower = title.to_lowercase();
            for rule in &self.title_rules {
                if title_lower.contains(&rule.keyword.to_lowercase()) {
                    matched.extend(rule.groups.iter().cloned());
                    confidence = confidence.max(0.7);
                    reasons.push(format!("Title contains: {}", rule.keyword));
                }
            }
        }

        if let Some(available) = &self.available_groups {
            matched.retain(|g| available.contains(g));
        }

        if matched.is_empty() {
            // No signal: extract all groups rather than miss content.
            return ClassificationResult {
                page_type: "general".to_string(),
                relevant_groups: Vec::new(),
                skip_extraction: false,
                confidence: 0.3,
                method: ClassificationMethod::Rule,
                reasoning: Some("No patterns matched, using all groups".to_string()),
            };
        }

        ClassificationResult {
            page_type,
            relevant_groups: matched.into_iter().collect(),
            skip_extraction: false,
            confidence,
            method: ClassificationMethod::Rule,
            reasoning: Some(reasons.join("; ")),
        }
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            log::warn!("Ignoring invalid classification pattern {:?}: {}", pattern, err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClassificationConfig {
        ClassificationConfig {
            skip_patterns: vec![
                r"/career|/job|/vacanc".to_string(),
                r"/privacy|/terms|/cookie".to_string(),
            ],
            url_patterns: vec![
                UrlRule {
                    pattern: r"/products?($|/)".to_string(),
                    groups: vec!["products_list".to_string()],
                    page_type: Some("product".to_string()),
                },
                UrlRule {
                    pattern: r"/about|/company".to_string(),
                    groups: vec!["company_info".to_string()],
                    page_type: Some("about".to_string()),
                },
            ],
            title_keywords: vec![
                TitleRule {
                    keyword: "gearbox".to_string(),
                    groups: vec!["products_list".to_string()],
                },
                TitleRule {
                    keyword: "contact".to_string(),
                    groups: vec!["company_info".to_string()],
                },
            ],
        }
    }

    #[test]
    fn skip_pattern_wins_with_high_confidence() {
        let classifier = PageClassifier::new(&config(), None);
        let result = classifier.classify("https://example.com/careers/open-roles", None);

        assert!(result.skip_extraction);
        assert_eq!(result.page_type, "skip");
        assert_eq!(result.confidence, 0.9);
        assert!(result.relevant_groups.is_empty());
    }

    #[test]
    fn url_match_scores_point_eight() {
        let classifier = PageClassifier::new(&config(), None);
        let result = classifier.classify("https://example.com/products/x200", None);

        assert!(!result.skip_extraction);
        assert_eq!(result.confidence, 0.8);
        assert_eq!(result.relevant_groups, vec!["products_list"]);
        assert_eq!(result.page_type, "product");
    }

    #[test]
    fn title_only_match_scores_point_seven() {
        let classifier = PageClassifier::new(&config(), None);
        let result = classifier.classify(
            "https://example.com/x200",
            Some("X200 Planetary Gearbox Series"),
        );

        assert_eq!(result.confidence, 0.7);
        assert_eq!(result.relevant_groups, vec!["products_list"]);
    }

    #[test]
    fn no_match_returns_empty_set_low_confidence() {
        let classifier = PageClassifier::new(&config(), None);
        let result = classifier.classify("https://example.com/misc", Some("Untitled"));

        assert!(!result.skip_extraction);
        assert_eq!(result.confidence, 0.3);
        assert!(result.relevant_groups.is_empty());
    }

    #[test]
    fn matching_is_case_insensitive() {
        let classifier = PageClassifier::new(&config(), None);
        let by_url = classifier.classify("https://example.com/PRODUCTS/", None);
        assert_eq!(by_url.relevant_groups, vec!["products_list"]);

        let by_title = classifier.classify("https://example.com/x", Some("GEARBOX catalogue"));
        assert_eq!(by_title.relevant_groups, vec!["products_list"]);
    }

    #[test]
    fn url_and_title_combine_groups() {
        let classifier = PageClassifier::new(&config(), None);
        let result = classifier.classify(
            "https://example.com/about",
            Some("About us — gearbox specialists"),
        );

        assert_eq!(result.confidence, 0.8);
        assert_eq!(
            result.relevant_groups,
            vec!["company_info".to_string(), "products_list".to_string()]
        );
    }

    #[test]
    fn unknown_groups_are_filtered() {
        let available = vec!["company_info".to_string()];
        let classifier = PageClassifier::new(&config(), Some(&available));
        let result = classifier.classify("https://example.com/products/", None);

        // products_list is not an available group; with nothing left the
        // classifier falls back to "all groups".
        assert!(result.relevant_groups.is_empty());
        assert_eq!(result.confidence, 0.3);
    }

    #[test]
    fn invalid_patterns_are_ignored_not_fatal() {
        let bad = ClassificationConfig {
            skip_patterns: vec!["([unclosed".to_string()],
            url_patterns: vec![],
            title_keywords: vec![],
        };
        let classifier = PageClassifier::new(&bad, None);
        let result = classifier.classify("https://example.com/x", None);
        assert!(!result.skip_extraction);
    }
}
