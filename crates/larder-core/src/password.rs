//! Password complexity policy for administrator-set passwords.

use thiserror::Error;

/// Minimum number of characters in a password
pub const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PasswordPolicyError {
    #[error("Password must be at least {MIN_PASSWORD_LENGTH} characters long")]
    TooShort,
    #[error("Password must contain at least one uppercase letter")]
    MissingUppercase,
    #[error("Password must contain at least one lowercase letter")]
    MissingLowercase,
    #[error("Password must contain at least one digit")]
    MissingDigit,
}

/// Check `password` against the complexity rules, reporting the first failure.
pub fn validate_password(password: &str) -> Result<(), PasswordPolicyError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(PasswordPolicyError::TooShort);
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(PasswordPolicyError::MissingUppercase);
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(PasswordPolicyError::MissingLowercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(PasswordPolicyError::MissingDigit);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_mixed_case_with_digit() {
        assert!(validate_password("Abcdefg1").is_ok());
    }

    #[test]
    fn rejects_missing_uppercase() {
        assert_eq!(
            validate_password("abcdefg1"),
            Err(PasswordPolicyError::MissingUppercase)
        );
    }

    #[test]
    fn rejects_each_missing_class() {
        assert_eq!(validate_password("Abc1"), Err(PasswordPolicyError::TooShort));
        assert_eq!(
            validate_password("ABCDEFG1"),
            Err(PasswordPolicyError::MissingLowercase)
        );
        assert_eq!(
            validate_password("Abcdefgh"),
            Err(PasswordPolicyError::MissingDigit)
        );
    }

    #[test]
    fn length_counts_characters_not_bytes() {
        // 7 characters, more than 8 bytes
        assert_eq!(
            validate_password("Äbcdé1x"),
            Err(PasswordPolicyError::TooShort)
        );
    }

    #[test]
    fn messages_share_prefix() {
        for error in [
            PasswordPolicyError::TooShort,
            PasswordPolicyError::MissingUppercase,
            PasswordPolicyError::MissingLowercase,
            PasswordPolicyError::MissingDigit,
        ] {
            assert!(error.to_string().starts_with("Password must"));
        }
    }
}
