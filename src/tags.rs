/// a single tag, element 0 is its name
pub type Tag = Vec<String>;

/// ordered collection of tags
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Tags(pub Vec<Tag>);

impl Tags {
    /// find the first tag with the given name that has at least one value
    pub fn find(&self, name: &str) -> Option<&Tag> {
        self.0.iter().find(|tag| tag.len() >= 2 && tag[0] == name)
    }

    /// find all tags with the given name that have at least one value
    pub fn find_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> {
        self.0
            .iter()
            .filter(move |tag| tag.len() >= 2 && tag[0] == name)
    }

    /// check if any tag named `tag_name` has its first value in `values`
    pub fn contains_any(&self, tag_name: &str, values: &[String]) -> bool {
        self.find_all(tag_name).any(|tag| values.contains(&tag[1]))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.0.iter()
    }
}

impl std::fmt::Display for Tags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{json}"),
            Err(err) => write!(f, "Tags({err})"),
        }
    }
}

impl From<Vec<Tag>> for Tags {
    fn from(tags: Vec<Tag>) -> Self {
        Self(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Tags {
        Tags(vec![
            vec!["p".into(), "abcd".into()],
            vec!["e".into()],
            vec!["p".into(), "ef01".into(), "wss://relay".into()],
            vec!["t".into(), "nostr".into()],
        ])
    }

    #[test]
    fn test_find() {
        let tags = tags();
        assert_eq!(tags.find("p").unwrap()[1], "abcd");
        assert_eq!(tags.find_all("p").count(), 2);

        // a bare ["e"] has no value, so it is never found
        assert!(tags.find("e").is_none());
    }

    #[test]
    fn test_contains_any() {
        let tags = tags();
        assert!(tags.contains_any("p", &["ef01".to_string()]));
        assert!(tags.contains_any("t", &["x".to_string(), "nostr".to_string()]));
        assert!(!tags.contains_any("p", &["wss://relay".to_string()]));
        assert!(!tags.contains_any("q", &["abcd".to_string()]));
        assert!(!tags.contains_any("p", &[]));
    }

    #[test]
    fn test_json_shape() {
        let tags = Tags(vec![vec!["p".into(), "abcd".into()]]);
        assert_eq!(tags.to_string(), r#"[["p","abcd"]]"#);
        assert_eq!(serde_json::from_str::<Tags>("[]").unwrap(), Tags::default());
    }
}
