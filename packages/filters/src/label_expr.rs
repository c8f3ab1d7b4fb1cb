//! A minimal label-selector expression: comma-separated `key=value`,
//! `key!=value`, or bare `key` (existence) terms, all ANDed together —
//! the subset of Kubernetes label selector syntax spec §6's
//! `node-label-expr` flag actually needs.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
	Equals(String, String),
	NotEquals(String, String),
	Exists(String),
}

#[derive(Debug, Clone, Default)]
pub struct LabelExpr {
	terms: Vec<Term>,
}

impl LabelExpr {
	pub fn parse(raw: &str) -> Self {
		let raw = raw.trim();
		if raw.is_empty() {
			return LabelExpr::default();
		}
		let terms = raw
			.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(|term| {
				if let Some((k, v)) = term.split_once("!=") {
					Term::NotEquals(k.trim().to_string(), v.trim().to_string())
				} else if let Some((k, v)) = term.split_once('=') {
					Term::Equals(k.trim().to_string(), v.trim().to_string())
				} else {
					Term::Exists(term.to_string())
				}
			})
			.collect();
		LabelExpr { terms }
	}

	pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
		self.terms.iter().all(|term| match term {
			Term::Equals(k, v) => labels.get(k) == Some(v),
			Term::NotEquals(k, v) => labels.get(k) != Some(v),
			Term::Exists(k) => labels.contains_key(k),
		})
	}
}
