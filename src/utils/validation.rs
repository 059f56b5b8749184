use regex::Regex;

pub fn validate_email(email: &str) -> bool {
    let email_regex = Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap();
    email_regex.is_match(email)
}

/// Validate a wall-clock time in "HH:MM" form (00:00 .. 23:59).
pub fn validate_hhmm(time: &str) -> bool {
    parse_hhmm(time).is_some()
}

/// Parse "HH:MM" into (hour, minute). Returns None on any malformed input.
pub fn parse_hhmm(time: &str) -> Option<(u32, u32)> {
    let (hh, mm) = time.split_once(':')?;
    if hh.len() != 2 || mm.len() != 2 {
        return None;
    }
    let hour: u32 = hh.parse().ok()?;
    let minute: u32 = mm.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_addresses() {
        assert!(validate_email("user@example.com"));
        assert!(validate_email("first.last+tag@sub.example.co.jp"));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(!validate_email("not-an-email"));
        assert!(!validate_email("missing@tld"));
        assert!(!validate_email("@example.com"));
    }

    #[test]
    fn parses_valid_times() {
        assert_eq!(parse_hhmm("00:00"), Some((0, 0)));
        assert_eq!(parse_hhmm("23:59"), Some((23, 59)));
        assert_eq!(parse_hhmm("09:30"), Some((9, 30)));
    }

    #[test]
    fn rejects_invalid_times() {
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("12:60"), None);
        assert_eq!(parse_hhmm("9:30"), None);
        assert_eq!(parse_hhmm("nope"), None);
        assert_eq!(parse_hhmm("12:3a"), None);
    }
}
