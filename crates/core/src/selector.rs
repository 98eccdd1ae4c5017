//! Label selectors in the Kubernetes string syntax:
//! `app=web,tier!=db,env in (prod,stage),!canary,owner`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use crate::error::WeirError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals { key: String, value: String },
    NotEquals { key: String, value: String },
    In { key: String, values: SmallVec<[String; 4]> },
    NotIn { key: String, values: SmallVec<[String; 4]> },
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals { key, value } => labels.get(key) == Some(value),
            // absent keys satisfy inequality
            Requirement::NotEquals { key, value } => labels.get(key) != Some(value),
            Requirement::In { key, values } => labels.get(key).is_some_and(|v| values.contains(v)),
            Requirement::NotIn { key, values } => labels.get(key).map_or(true, |v| !values.contains(v)),
            Requirement::Exists(key) => labels.contains_key(key),
            Requirement::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals { key, value } => write!(f, "{key}={value}"),
            Requirement::NotEquals { key, value } => write!(f, "{key}!={value}"),
            Requirement::In { key, values } => write!(f, "{key} in ({})", values.join(",")),
            Requirement::NotIn { key, values } => write!(f, "{key} notin ({})", values.join(",")),
            Requirement::Exists(key) => f.write_str(key),
            Requirement::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

/// Conjunction of requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.requirements.is_empty() }

    pub fn requirements(&self) -> &[Requirement] { &self.requirements }

    pub fn with(mut self, req: Requirement) -> Self {
        self.requirements.push(req);
        self
    }

    pub fn parse(s: &str) -> Result<Self, WeirError> {
        let mut requirements = Vec::new();
        for term in split_top_level(s)? {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_term(term)?);
        }
        Ok(Self { requirements })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Match against any kube resource's labels.
    pub fn matches_object<K: kube::Resource>(&self, obj: &K) -> bool {
        match obj.meta().labels.as_ref() {
            Some(labels) => self.matches(labels),
            None => self.matches(&BTreeMap::new()),
        }
    }
}

impl FromStr for LabelSelector {
    type Err = WeirError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

// Commas inside `in (...)` sets do not separate terms.
fn split_top_level(s: &str) -> Result<Vec<&str>, WeirError> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| WeirError::Invalid(format!("unbalanced ')' in selector: {s}")))?;
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(WeirError::Invalid(format!("unbalanced '(' in selector: {s}")));
    }
    out.push(&s[start..]);
    Ok(out)
}

fn parse_term(term: &str) -> Result<Requirement, WeirError> {
    if let Some(rest) = term.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(valid_key(rest.trim(), term)?));
    }
    if let Some(open) = term.find('(') {
        let set = term[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| WeirError::Invalid(format!("expected ')' at end of: {term}")))?;
        let values: SmallVec<[String; 4]> = set
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        let head: Vec<&str> = term[..open].split_whitespace().collect();
        return match head.as_slice() {
            [key, "in"] => Ok(Requirement::In { key: valid_key(key, term)?, values }),
            [key, "notin"] => Ok(Requirement::NotIn { key: valid_key(key, term)?, values }),
            _ => Err(WeirError::Invalid(format!("expected `key in (..)` or `key notin (..)`: {term}"))),
        };
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals { key: valid_key(key.trim(), term)?, value: value.trim().to_string() });
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Ok(Requirement::Equals { key: valid_key(key.trim(), term)?, value: value.trim().to_string() });
    }
    Ok(Requirement::Exists(valid_key(term, term)?))
}

fn valid_key(key: &str, term: &str) -> Result<String, WeirError> {
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(WeirError::Invalid(format!("invalid label key in: {term}")));
    }
    Ok(key.to_string())
}
