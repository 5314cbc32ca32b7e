use rand::rngs::OsRng;
use rand::Rng;

use crate::error::BrokerError;

const DEFAULT_DICTIONARY: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Draw `length` characters uniformly from the dictionary using the OS
/// CSPRNG.
pub fn generate_password(length: usize, dictionary: Option<&str>) -> Result<String, BrokerError> {
    if length == 0 {
        return Err(BrokerError::configuration(
            "password length must be non-zero",
        ));
    }
    let dictionary = dictionary.unwrap_or(DEFAULT_DICTIONARY);
    let chars: Vec<char> = dictionary.chars().collect();
    if chars.is_empty() {
        return Err(BrokerError::configuration(
            "password dictionary must be non-empty",
        ));
    }

    let mut rng = OsRng;
    let password = (0..length)
        .map(|_| chars[rng.gen_range(0..chars.len())])
        .collect();
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_requested_length_from_default_dictionary() {
        let password = generate_password(32, None).unwrap();
        assert_eq!(password.len(), 32);
        assert!(password.chars().all(|c| DEFAULT_DICTIONARY.contains(c)));
    }

    #[test]
    fn respects_custom_dictionary() {
        let password = generate_password(64, Some("ab")).unwrap();
        assert_eq!(password.len(), 64);
        assert!(password.chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn rejects_degenerate_inputs() {
        assert!(generate_password(0, None).is_err());
        assert!(generate_password(8, Some("")).is_err());
    }

    #[test]
    fn successive_draws_differ() {
        // Astronomically unlikely to collide at this length.
        let a = generate_password(48, None).unwrap();
        let b = generate_password(48, None).unwrap();
        assert_ne!(a, b);
    }
}
