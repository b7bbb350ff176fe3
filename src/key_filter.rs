use std::collections::HashSet;

use regex::Regex;
use thiserror::Error;

/// Suppresses upsc fields by exact name or by regular expression.
#[derive(Debug, Default)]
pub struct KeyFilter {
	exact: HashSet<String>,
	patterns: Vec<Regex>,
}

#[derive(Error, Debug)]
#[error("invalid exclusion regex \"{pattern}\": {source}")]
pub struct InvalidPattern {
	pattern: String,
	#[source]
	source: regex::Error,
}

impl KeyFilter {
	pub fn new<E, P>(exact: E, patterns: P) -> Result<Self, InvalidPattern>
	where
		E: IntoIterator<Item = String>,
		P: IntoIterator<Item = String>,
	{
		let patterns = patterns
			.into_iter()
			.map(|pattern| Regex::new(&pattern).map_err(|source| InvalidPattern { pattern, source }))
			.collect::<Result<_, _>>()?;
		Ok(Self {
			exact: exact.into_iter().collect(),
			patterns,
		})
	}

	pub fn is_excluded(&self, field: &str) -> bool {
		self.exact.contains(field) || self.patterns.iter().any(|p| p.is_match(field))
	}

	pub fn exact(&self) -> impl Iterator<Item = &str> {
		self.exact.iter().map(String::as_str)
	}

	pub fn patterns(&self) -> impl Iterator<Item = &str> {
		self.patterns.iter().map(Regex::as_str)
	}
}
