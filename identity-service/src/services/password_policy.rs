//! Password strength validation applied at registration.

/// Minimum password length.
pub const PASSWORD_MIN_LENGTH: usize = 8;

/// Shortest email local part or name part that is matched inside a password.
const MIN_PERSONAL_FRAGMENT: usize = 3;

/// Password strength violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordPolicyError {
    PasswordTooShort { min_length: usize, actual_length: usize },
    PasswordMissingUppercase,
    PasswordMissingLowercase,
    PasswordMissingNumber,
    PasswordMissingSpecial,
    /// Password contains the email, its local part, the name or a name part.
    PasswordContainsPersonalInfo,
}

impl std::fmt::Display for PasswordPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PasswordPolicyError::PasswordTooShort {
                min_length,
                actual_length,
            } => {
                write!(
                    f,
                    "Password must be at least {} characters (got {})",
                    min_length, actual_length
                )
            }
            PasswordPolicyError::PasswordMissingUppercase => {
                write!(f, "Password must contain at least one uppercase letter")
            }
            PasswordPolicyError::PasswordMissingLowercase => {
                write!(f, "Password must contain at least one lowercase letter")
            }
            PasswordPolicyError::PasswordMissingNumber => {
                write!(f, "Password must contain at least one number")
            }
            PasswordPolicyError::PasswordMissingSpecial => {
                write!(f, "Password must contain at least one special character")
            }
            PasswordPolicyError::PasswordContainsPersonalInfo => {
                write!(f, "Password must not contain your email or name")
            }
        }
    }
}

impl std::error::Error for PasswordPolicyError {}

#[derive(Debug, Clone)]
pub struct PasswordPolicy;

impl PasswordPolicy {
    /// Validate a password for the given account.
    ///
    /// Returns the first violation found.
    pub fn validate(password: &str, email: &str, full_name: &str) -> Result<(), PasswordPolicyError> {
        match Self::validate_all(password, email, full_name).into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Validate a password and return every violation.
    pub fn validate_all(password: &str, email: &str, full_name: &str) -> Vec<PasswordPolicyError> {
        let mut errors = Vec::new();

        let length = password.chars().count();
        if length < PASSWORD_MIN_LENGTH {
            errors.push(PasswordPolicyError::PasswordTooShort {
                min_length: PASSWORD_MIN_LENGTH,
                actual_length: length,
            });
        }

        if !password.chars().any(|c| c.is_uppercase()) {
            errors.push(PasswordPolicyError::PasswordMissingUppercase);
        }

        if !password.chars().any(|c| c.is_lowercase()) {
            errors.push(PasswordPolicyError::PasswordMissingLowercase);
        }

        if !password.chars().any(|c| c.is_ascii_digit()) {
            errors.push(PasswordPolicyError::PasswordMissingNumber);
        }

        if !password.chars().any(|c| c.is_ascii_punctuation() || c == ' ') {
            errors.push(PasswordPolicyError::PasswordMissingSpecial);
        }

        if contains_personal_info(password, email, full_name) {
            errors.push(PasswordPolicyError::PasswordContainsPersonalInfo);
        }

        errors
    }
}

fn contains_personal_info(password: &str, email: &str, full_name: &str) -> bool {
    let password = password.to_lowercase();
    let email = email.trim().to_lowercase();
    let full_name = full_name.trim().to_lowercase();

    let mut fragments: Vec<&str> = Vec::new();
    if !email.is_empty() {
        fragments.push(&email);
    }
    if let Some((local, _)) = email.split_once('@') {
        if local.chars().count() >= MIN_PERSONAL_FRAGMENT {
            fragments.push(local);
        }
    }
    if !full_name.is_empty() {
        fragments.push(&full_name);
    }
    fragments.extend(
        full_name
            .split_whitespace()
            .filter(|part| part.chars().count() >= MIN_PERSONAL_FRAGMENT),
    );

    fragments.iter().any(|fragment| password.contains(fragment))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMAIL: &str = "jane.doe@example.com";
    const NAME: &str = "Jane Doe";

    #[test]
    fn test_strong_password_passes() {
        assert!(PasswordPolicy::validate("Tr4ding!Desk", EMAIL, NAME).is_ok());
    }

    #[test]
    fn test_password_too_short() {
        let result = PasswordPolicy::validate("Ab1!x", EMAIL, NAME);
        assert!(matches!(
            result,
            Err(PasswordPolicyError::PasswordTooShort { min_length: 8, actual_length: 5 })
        ));
    }

    #[test]
    fn test_character_classes() {
        assert_eq!(
            PasswordPolicy::validate("lowercase1!", EMAIL, NAME),
            Err(PasswordPolicyError::PasswordMissingUppercase)
        );
        assert_eq!(
            PasswordPolicy::validate("UPPERCASE1!", EMAIL, NAME),
            Err(PasswordPolicyError::PasswordMissingLowercase)
        );
        assert_eq!(
            PasswordPolicy::validate("NoNumbers!!", EMAIL, NAME),
            Err(PasswordPolicyError::PasswordMissingNumber)
        );
        assert_eq!(
            PasswordPolicy::validate("NoSpecial12", EMAIL, NAME),
            Err(PasswordPolicyError::PasswordMissingSpecial)
        );
    }

    #[test]
    fn test_rejects_email_local_part_case_insensitively() {
        assert_eq!(
            PasswordPolicy::validate("X1!JANE.DOEx", EMAIL, NAME),
            Err(PasswordPolicyError::PasswordContainsPersonalInfo)
        );
    }

    #[test]
    fn test_rejects_name_parts() {
        assert_eq!(
            PasswordPolicy::validate("Secret!1jane", EMAIL, NAME),
            Err(PasswordPolicyError::PasswordContainsPersonalInfo)
        );
        // "Doe" is three characters and counts as a name part.
        assert_eq!(
            PasswordPolicy::validate("Secret!1doe", EMAIL, NAME),
            Err(PasswordPolicyError::PasswordContainsPersonalInfo)
        );
    }

    #[test]
    fn test_short_fragments_are_ignored() {
        assert!(PasswordPolicy::validate("Al!ceWonder9", "al@example.com", "Al Bo").is_ok());
    }

    #[test]
    fn test_validate_all_collects_everything() {
        let errors = PasswordPolicy::validate_all("jane", EMAIL, NAME);
        assert!(errors.contains(&PasswordPolicyError::PasswordMissingUppercase));
        assert!(errors.contains(&PasswordPolicyError::PasswordMissingNumber));
        assert!(errors.contains(&PasswordPolicyError::PasswordContainsPersonalInfo));
        assert!(matches!(errors[0], PasswordPolicyError::PasswordTooShort { .. }));
    }
}
