//! Helpers over raw `[name, value, ...]` tag arrays.

pub fn tag_name(tag: &[String]) -> Option<&str> {
    tag.first().map(String::as_str)
}

pub fn tag_field(tag: &[String], index: usize) -> Option<&str> {
    tag.get(index).map(String::as_str)
}

pub fn tag_value(tag: &[String]) -> Option<&str> {
    tag_field(tag, 1).filter(|value| !value.is_empty())
}

pub fn is_tag(tag: &[String], name: &str) -> bool {
    matches!(tag_name(tag), Some(tag_name) if tag_name == name)
}

pub fn find_tag<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a [String]> {
    tags.iter()
        .find(|tag| is_tag(tag, name) && tag_field(tag, 1).is_some())
        .map(Vec::as_slice)
}

pub fn find_tag_value<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a str> {
    find_tag(tags, name).and_then(|tag| tag_field(tag, 1))
}

pub fn collect_tag_values(tags: &[Vec<String>], name: &str) -> Vec<String> {
    tags.iter()
        .filter(|tag| is_tag(tag, name))
        .filter_map(|tag| tag_value(tag).map(str::to_owned))
        .collect()
}

/// Values of every tag whose name is one of `names`, in tag order.
pub fn collect_tag_values_any(tags: &[Vec<String>], names: &[&str]) -> Vec<String> {
    tags.iter()
        .filter(|tag| tag_name(tag).is_some_and(|name| names.contains(&name)))
        .filter_map(|tag| tag_value(tag).map(str::to_owned))
        .collect()
}

pub fn has_tag_value(tags: &[Vec<String>], name: &str, value: &str) -> bool {
    tags.iter()
        .any(|tag| is_tag(tag, name) && tag_field(tag, 1) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Vec<Vec<String>> {
        vec![
            vec!["e".to_string(), "aa".to_string()],
            vec!["p".to_string(), "bb".to_string(), "wss://relay".to_string()],
            vec!["e".to_string(), String::new()],
            vec!["a".to_string(), "30023:bb:slug".to_string()],
            vec!["d".to_string()],
        ]
    }

    #[test]
    fn finds_first_valued_tag() {
        let tags = tags();
        assert_eq!(find_tag_value(&tags, "p"), Some("bb"));
        assert_eq!(find_tag_value(&tags, "d"), None);
        assert_eq!(
            find_tag(&tags, "p").and_then(|tag| tag_field(tag, 2)),
            Some("wss://relay")
        );
    }

    #[test]
    fn collects_non_empty_values() {
        let tags = tags();
        assert_eq!(collect_tag_values(&tags, "e"), vec!["aa".to_string()]);
        assert_eq!(
            collect_tag_values_any(&tags, &["e", "a"]),
            vec!["aa".to_string(), "30023:bb:slug".to_string()]
        );
        assert!(has_tag_value(&tags, "a", "30023:bb:slug"));
        assert!(!has_tag_value(&tags, "a", "30023:bb"));
    }
}
