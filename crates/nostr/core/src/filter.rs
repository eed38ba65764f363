//! NIP-01 subscription filters, usable both as relay queries and as local
//! predicates.

use crate::nip01::{Address, Event};
use crate::tag_parsing::has_tag_value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DAY_SECONDS: u64 = 60 * 60 * 24;

/// A relay query. Tag constraints are kept under their wire key (`"#e"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    #[must_use]
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Constrain a single-letter tag, e.g. `tag("e", [id])` for `"#e"`.
    #[must_use]
    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.insert(
            format!("#{name}"),
            values.into_iter().map(Into::into).collect(),
        );
        self
    }

    #[must_use]
    pub fn tag_constraint(&self, name: &str) -> Option<&[String]> {
        self.tags.get(&format!("#{name}")).map(Vec::as_slice)
    }

    #[must_use]
    pub fn has_tag_constraints(&self) -> bool {
        !self.tags.is_empty()
    }

    /// Whether `event` satisfies every constraint of this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.contains(&event.id)
        {
            return false;
        }
        if let Some(authors) = &self.authors
            && !authors.contains(&event.pubkey)
        {
            return false;
        }
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let name = key.trim_start_matches('#');
            values
                .iter()
                .any(|value| has_tag_value(&event.tags, name, value))
        })
    }

    /// How broad the filter is, from 0 (targets specific events) to 1
    /// (the whole network).
    #[must_use]
    pub fn generality(&self) -> f64 {
        if self.ids.is_some()
            || self.tag_constraint("e").is_some()
            || self.tag_constraint("a").is_some()
        {
            return 0.0;
        }

        match &self.authors {
            Some(_) if self.has_tag_constraints() => 0.2,
            Some(authors) => (authors.len() as f64 / 300.0).min(1.0),
            None => 1.0,
        }
    }
}

/// Estimate the time span, in seconds, a set of filters is expected to
/// cover. Filters that all carry `since` cover their explicit window;
/// otherwise narrow filters are assumed to reach further back than broad
/// ones, up to a day.
#[must_use]
pub fn guess_filter_delta(filters: &[Filter], now: u64) -> u64 {
    if !filters.is_empty() && filters.iter().all(|filter| filter.since.is_some()) {
        return filters
            .iter()
            .filter_map(|filter| {
                let since = filter.since?;
                Some(filter.until.unwrap_or(now).saturating_sub(since))
            })
            .max()
            .unwrap_or(DAY_SECONDS);
    }

    if filters.is_empty() {
        return DAY_SECONDS;
    }

    let average =
        filters.iter().map(Filter::generality).sum::<f64>() / filters.len() as f64;

    (DAY_SECONDS as f64 * (1.0 - average).max(0.01)).round() as u64
}

/// Filters fetching the given event ids and addresses.
#[must_use]
pub fn id_filters<I, S>(values: I) -> Vec<Filter>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ids = Vec::new();
    let mut filters = Vec::new();

    for value in values {
        let value = value.as_ref();
        if Address::is_address(value) {
            if let Ok(address) = value.parse::<Address>() {
                filters.push(address.as_filter());
            }
        } else if !ids.iter().any(|id| id == value) {
            ids.push(value.to_string());
        }
    }

    if !ids.is_empty() {
        filters.insert(0, Filter::new().ids(ids));
    }

    filters
}
