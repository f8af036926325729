use crate::{Event, Kind, PubKey, Timestamp, ID};

/// a query over events; every constraint that is `None` leaves that axis open
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub ids: Option<Vec<ID>>,
    pub kinds: Option<Vec<Kind>>,
    pub authors: Option<Vec<PubKey>>,
    pub tags: Option<Vec<TagQuery>>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub limit: Option<usize>,
    pub search: Option<String>,
}

/// `#<name>` constraint: some tag called `name` must have one of these values
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TagQuery(pub String, pub Vec<String>);

impl TagQuery {
    pub fn key(&self) -> &str {
        self.0.as_str()
    }

    pub fn values(&self) -> &Vec<String> {
        &self.1
    }
}

// an empty tag query list constrains nothing and has no json form, so it equals `None`
impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.ids == other.ids
            && self.kinds == other.kinds
            && self.authors == other.authors
            && self.tag_queries() == other.tag_queries()
            && self.since == other.since
            && self.until == other.until
            && self.limit == other.limit
            && self.search == other.search
    }
}

impl Eq for Filter {}

impl serde::Serialize for Filter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut len = [
            self.ids.is_some(),
            self.authors.is_some(),
            self.kinds.is_some(),
            self.since.is_some(),
            self.until.is_some(),
            self.limit.is_some(),
            self.search.is_some(),
        ]
        .iter()
        .filter(|v| **v)
        .count();
        if let Some(ref tags) = self.tags {
            len += tags.len();
        }

        let mut map = serializer.serialize_map(Some(len))?;
        if let Some(ref ids) = self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(ref authors) = self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(ref kinds) = self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        if let Some(ref tags) = self.tags {
            for tagq in tags {
                let key = format!("#{}", tagq.key());
                map.serialize_entry(&key, tagq.values())?;
            }
        }
        if let Some(s) = self.since {
            map.serialize_entry("since", &s)?;
        }
        if let Some(u) = self.until {
            map.serialize_entry("until", &u)?;
        }
        if let Some(l) = self.limit {
            map.serialize_entry("limit", &l)?;
        }
        if let Some(s) = &self.search {
            map.serialize_entry("search", s)?;
        }
        map.end()
    }
}

impl<'de> serde::Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::de::Deserializer<'de>,
    {
        struct FilterVisitor;
        impl<'v> serde::de::Visitor<'v> for FilterVisitor {
            type Value = Filter;
            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "a Nostr filter object")
            }
            fn visit_map<M>(self, mut map: M) -> Result<Filter, M::Error>
            where
                M: serde::de::MapAccess<'v>,
            {
                let mut filter = Filter::default();

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "ids" => filter.ids = Some(map.next_value()?),
                        "authors" => filter.authors = Some(map.next_value()?),
                        "kinds" => filter.kinds = Some(map.next_value()?),
                        "since" => filter.since = Some(map.next_value()?),
                        "until" => filter.until = Some(map.next_value()?),
                        "limit" => filter.limit = Some(map.next_value()?),
                        "search" => filter.search = Some(map.next_value()?),
                        k if k.starts_with('#') && k.len() > 1 => {
                            let tag = k.trim_start_matches('#').to_string();
                            let vals: Vec<String> = map.next_value()?;
                            filter
                                .tags
                                .get_or_insert_with(|| Vec::with_capacity(2))
                                .push(TagQuery(tag, vals));
                        }
                        _ => {
                            let _: serde::de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                Ok(filter)
            }
        }
        deserializer.deserialize_map(FilterVisitor)
    }
}

impl Filter {
    pub fn tag_queries(&self) -> &[TagQuery] {
        self.tags.as_deref().unwrap_or(&[])
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.matches_except_time(event) {
            return false;
        }

        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }

        true
    }

    pub fn matches_except_time(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }

        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(ref authors) = self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }

        if let Some(ref tags) = self.tags {
            for TagQuery(tag_name, tag_values) in tags {
                if !event.tags.contains_any(tag_name, tag_values) {
                    return false;
                }
            }
        }

        true
    }

    /// same filter with a new lower time bound
    pub fn with_since(&self, since: Timestamp) -> Filter {
        Filter {
            since: Some(since),
            ..self.clone()
        }
    }

    /// true if the two filters only differ in their `since`
    pub fn same_except_since(&self, other: &Filter) -> bool {
        Filter {
            since: None,
            ..self.clone()
        } == Filter {
            since: None,
            ..other.clone()
        }
    }

    /// a single filter matching exactly what `self` or `other` match, when one exists.
    ///
    /// that is the case when both are equal on every axis except one set-valued axis
    /// (`ids`, `authors`, `kinds` or the values of one tag query). filters carrying a
    /// `limit` are never merged since the limit wouldn't apply to each side anymore.
    pub fn merge(&self, other: &Filter) -> Option<Filter> {
        if self == other {
            return Some(self.clone());
        }

        if self.limit.is_some()
            || other.limit.is_some()
            || self.since != other.since
            || self.until != other.until
            || self.search != other.search
        {
            return None;
        }

        let differing = [
            self.ids != other.ids,
            self.authors != other.authors,
            self.kinds != other.kinds,
            self.tag_queries() != other.tag_queries(),
        ];
        if differing.iter().filter(|d| **d).count() != 1 {
            return None;
        }

        let mut merged = self.clone();
        if differing[0] {
            merged.ids = union_axis(&self.ids, &other.ids);
        } else if differing[1] {
            merged.authors = union_axis(&self.authors, &other.authors);
        } else if differing[2] {
            merged.kinds = union_axis(&self.kinds, &other.kinds);
        } else {
            let (a, b) = (self.tag_queries(), other.tag_queries());
            merged.tags = if a.is_empty() || b.is_empty() {
                None
            } else {
                Some(merge_tag_queries(a, b)?)
            };
        }

        Some(merged)
    }
}

/// an open axis on either side stays open
fn union_axis<T: PartialEq + Clone>(a: &Option<Vec<T>>, b: &Option<Vec<T>>) -> Option<Vec<T>> {
    let (a, b) = (a.as_ref()?, b.as_ref()?);
    let mut union = a.clone();
    for item in b {
        if !union.contains(item) {
            union.push(item.clone());
        }
    }
    Some(union)
}

/// tag query lists with the same names in the same order, differing in exactly one value set
fn merge_tag_queries(a: &[TagQuery], b: &[TagQuery]) -> Option<Vec<TagQuery>> {
    if a.len() != b.len() || a.iter().zip(b).any(|(x, y)| x.0 != y.0) {
        return None;
    }

    let mut differing = a.iter().zip(b).enumerate().filter(|(_, (x, y))| x.1 != y.1);
    let (index, _) = differing.next()?;
    if differing.next().is_some() {
        return None;
    }

    let mut merged = a.to_vec();
    let values = union_axis(&Some(a[index].1.clone()), &Some(b[index].1.clone()))?;
    merged[index].1 = values;
    Some(merged)
}

/// collapse a list of filters into an equivalent (same matches, as a REQ) and usually
/// shorter one
pub fn union(filters: &[Filter]) -> Vec<Filter> {
    let mut result: Vec<Filter> = Vec::with_capacity(filters.len());

    'next: for filter in filters {
        for existing in result.iter_mut() {
            if let Some(merged) = existing.merge(filter) {
                *existing = merged;
                continue 'next;
            }
        }
        result.push(filter.clone());
    }

    result
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(_) => write!(f, "Filter"),
        }
    }
}
