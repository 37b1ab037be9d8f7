use std::collections::HashMap;
use std::str::FromStr;

/// A parsed label selector: comma-separated requirements, all of which must
/// hold (`key=value`, `key==value`, `key!=value`, `key in (v1,v2)`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, PartialEq)]
enum Requirement {
    Eq(String, String),
    NotEq(String, String),
    In(String, Vec<String>),
}

impl Selector {
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Eq(k, v) => labels.get(k).is_some_and(|have| have == v),
            Requirement::NotEq(k, v) => labels.get(k).is_none_or(|have| have != v),
            Requirement::In(k, vs) => labels.get(k).is_some_and(|have| vs.contains(have)),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

impl FromStr for Selector {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        for clause in split_clauses(s)? {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            requirements.push(parse_clause(clause)?);
        }
        Ok(Selector { requirements })
    }
}

/// Split on commas that are not inside an `in (...)` value set.
fn split_clauses(s: &str) -> anyhow::Result<Vec<&str>> {
    let mut clauses = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| anyhow::anyhow!("unbalanced parentheses in selector"))?;
            }
            ',' if depth == 0 => {
                clauses.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        anyhow::bail!("unbalanced parentheses in selector");
    }
    clauses.push(&s[start..]);
    Ok(clauses)
}

fn parse_clause(clause: &str) -> anyhow::Result<Requirement> {
    if let Some(idx) = clause.find("!=") {
        let key = clause[..idx].trim();
        let value = clause[idx + 2..].trim();
        validate_key_value(key, value)?;
        return Ok(Requirement::NotEq(key.to_string(), value.to_string()));
    }
    if let Some(idx) = clause.find("==") {
        let key = clause[..idx].trim();
        let value = clause[idx + 2..].trim();
        validate_key_value(key, value)?;
        return Ok(Requirement::Eq(key.to_string(), value.to_string()));
    }
    if let Some(idx) = clause.find('=') {
        let key = clause[..idx].trim();
        let value = clause[idx + 1..].trim();
        validate_key_value(key, value)?;
        return Ok(Requirement::Eq(key.to_string(), value.to_string()));
    }
    // `key in (v1,v2)`
    if let Some((key, rest)) = clause.split_once(char::is_whitespace) {
        let rest = rest.trim();
        if let Some(set) = rest.strip_prefix("in") {
            let set = set.trim();
            let inner = set
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| anyhow::anyhow!("expected parenthesised value set: {clause}"))?;
            let values: Vec<String> = inner
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            let key = key.trim();
            if key.is_empty() || values.is_empty() {
                anyhow::bail!("invalid `in` clause: {clause}");
            }
            return Ok(Requirement::In(key.to_string(), values));
        }
    }
    anyhow::bail!("unrecognised selector clause: {clause}")
}

fn validate_key_value(key: &str, value: &str) -> anyhow::Result<()> {
    if key.is_empty() {
        anyhow::bail!("selector key must not be empty");
    }
    if value.contains(['(', ')', ',']) {
        anyhow::bail!("selector value contains reserved characters: {value}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn equality_match() {
        let sel: Selector = "team=a".parse().unwrap();
        assert!(sel.matches(&labels(&[("team", "a")])));
        assert!(!sel.matches(&labels(&[("team", "b")])));
        assert!(!sel.matches(&labels(&[])));
    }

    #[test]
    fn double_equals_is_equality() {
        let sel: Selector = "team==a".parse().unwrap();
        assert!(sel.matches(&labels(&[("team", "a")])));
    }

    #[test]
    fn inequality_matches_missing_key() {
        let sel: Selector = "team!=a".parse().unwrap();
        assert!(sel.matches(&labels(&[("team", "b")])));
        assert!(sel.matches(&labels(&[])));
        assert!(!sel.matches(&labels(&[("team", "a")])));
    }

    #[test]
    fn in_clause() {
        let sel: Selector = "team in (a, b)".parse().unwrap();
        assert!(sel.matches(&labels(&[("team", "a")])));
        assert!(sel.matches(&labels(&[("team", "b")])));
        assert!(!sel.matches(&labels(&[("team", "c")])));
        assert!(!sel.matches(&labels(&[])));
    }

    #[test]
    fn comma_is_conjunction() {
        let sel: Selector = "team=a,env=prod".parse().unwrap();
        assert!(sel.matches(&labels(&[("team", "a"), ("env", "prod")])));
        assert!(!sel.matches(&labels(&[("team", "a")])));
    }

    #[test]
    fn in_clause_commas_do_not_split_conjunction() {
        let sel: Selector = "team in (a,b),env=prod".parse().unwrap();
        assert!(sel.matches(&labels(&[("team", "b"), ("env", "prod")])));
        assert!(!sel.matches(&labels(&[("team", "b"), ("env", "dev")])));
    }

    #[test]
    fn garbage_fails_to_parse() {
        assert!("team >< a".parse::<Selector>().is_err());
        assert!("team in (a".parse::<Selector>().is_err());
        assert!("=value".parse::<Selector>().is_err());
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel: Selector = "".parse().unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&labels(&[("anything", "at-all")])));
    }
}
