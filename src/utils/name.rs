/// Split a display name into (first, last) on the first whitespace run.
/// A single-word name yields no last name.
pub fn split_name(name: &str) -> (String, Option<String>) {
    let trimmed = name.trim();
    match trimmed.split_once(char::is_whitespace) {
        Some((first, rest)) => (first.to_string(), Some(rest.trim().to_string())),
        None => (trimmed.to_string(), None),
    }
}

/// Join first/last parts back into a display name.
pub fn join_name(first: &str, last: Option<&str>) -> String {
    match last {
        Some(last) if !last.is_empty() => format!("{} {}", first, last),
        _ => first.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_two_part_names() {
        assert_eq!(
            split_name("Taro Yamada"),
            ("Taro".to_string(), Some("Yamada".to_string()))
        );
    }

    #[test]
    fn single_word_name_has_no_last() {
        assert_eq!(split_name("Madonna"), ("Madonna".to_string(), None));
    }

    #[test]
    fn extra_whitespace_is_absorbed_into_last() {
        assert_eq!(
            split_name("  Ada   Lovelace  "),
            ("Ada".to_string(), Some("Lovelace".to_string()))
        );
    }

    #[test]
    fn split_join_round_trips_when_first_has_no_whitespace() {
        for (first, last) in [("Ada", Some("Lovelace")), ("Madonna", None)] {
            let joined = join_name(first, last);
            let (f, l) = split_name(&joined);
            assert_eq!(f, first);
            assert_eq!(l.as_deref(), last);
        }
    }
}
