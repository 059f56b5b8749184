use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

/// Length of unsubscribe/confirmation tokens. Long enough that enumeration
/// is infeasible on the unauthenticated token paths.
const TOKEN_LEN: usize = 32;

/// Length of short-link codes.
const SHORT_CODE_LEN: usize = 8;

/// Opaque unguessable token for unsubscribe and confirmation links.
pub fn generate_token() -> String {
    random_alphanumeric(TOKEN_LEN)
}

/// 8-character alphanumeric short-link code.
pub fn generate_short_code() -> String {
    random_alphanumeric(SHORT_CODE_LEN)
}

fn random_alphanumeric(len: usize) -> String {
    (&mut OsRng)
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_have_expected_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn short_codes_are_eight_alphanumerics() {
        let code = generate_short_code();
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn consecutive_tokens_differ() {
        assert_ne!(generate_token(), generate_token());
    }
}
