//! A minimal Kubernetes label selector: the equality- and existence-based forms
//! (`k=v`, `k!=v`, `k`, `!k`), comma-joined. Set-based `in`/`notin` selectors are
//! not needed here -- the export selector configured on a `Link` is always one of
//! the simple forms. A selector that fails to parse is a startup-time
//! configuration error, not a per-event filter failure (§3 Link Construction).

use std::collections::BTreeMap;

use eyre::{bail, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(Vec<Requirement>);

impl Selector {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }

        let requirements = raw
            .split(',')
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(parse_requirement)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self(requirements))
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|req| match req {
            Requirement::Equals(k, v) => labels.get(k).is_some_and(|got| got == v),
            Requirement::NotEquals(k, v) => labels.get(k).is_none_or(|got| got != v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        })
    }
}

fn parse_requirement(term: &str) -> Result<Requirement> {
    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() || key.contains(['=', '!']) {
            bail!("malformed selector term: {term:?}");
        }
        return Ok(Requirement::NotExists(key.to_string()));
    }

    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement::NotEquals(
            key.trim().to_string(),
            value.trim().to_string(),
        ));
    }

    if let Some((key, value)) = term.split_once('=') {
        return Ok(Requirement::Equals(
            key.trim().to_string(),
            value.trim().to_string(),
        ));
    }

    if term.contains(char::is_whitespace) || term.is_empty() {
        bail!("malformed selector term: {term:?}");
    }

    Ok(Requirement::Exists(term.to_string()))
}
