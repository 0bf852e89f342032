//! Form validation for the login and signup screens.
//!
//! Everything here is pure: no storage, no network. The session controller
//! runs these checks before it submits anything to the backend.
//!
//! Login only checks that the password is present and at least 6 characters
//! long, while signup requires the full strength rules. The two thresholds
//! differ on purpose and are covered by tests.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Minimum password length for a new account.
const MIN_PASSWORD_LENGTH: usize = 8;

/// Minimum password length accepted by the login form.
const MIN_LOGIN_PASSWORD_LENGTH: usize = 6;

/// Characters that satisfy the "special character" rule.
pub const SPECIAL_CHARACTERS: &str = "!@#$%^&*(),.?\":{}|<>";

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid"));

/// A form field that can carry a validation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub enum Field {
    Email,
    Password,
    ConfirmPassword,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Email => "email",
            Field::Password => "password",
            Field::ConfirmPassword => "confirmPassword",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field errors for a submitted form. A field without an entry is valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ValidationResult {
    pub errors: BTreeMap<Field, String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&self, field: Field) -> Option<&str> {
        self.errors.get(&field).map(String::as_str)
    }

    fn insert(&mut self, field: Field, message: impl Into<String>) {
        self.errors.insert(field, message.into());
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .errors
            .iter()
            .map(|(field, message)| format!("{}: {}", field, message))
            .collect();
        f.write_str(&parts.join("; "))
    }
}

/// One of the five password strength rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PasswordRule {
    Length,
    Uppercase,
    Lowercase,
    Digit,
    Special,
}

impl PasswordRule {
    const ALL: [PasswordRule; 5] = [
        PasswordRule::Length,
        PasswordRule::Uppercase,
        PasswordRule::Lowercase,
        PasswordRule::Digit,
        PasswordRule::Special,
    ];

    fn is_met(&self, password: &str) -> bool {
        match self {
            PasswordRule::Length => password.chars().count() >= MIN_PASSWORD_LENGTH,
            PasswordRule::Uppercase => password.chars().any(|c| c.is_ascii_uppercase()),
            PasswordRule::Lowercase => password.chars().any(|c| c.is_ascii_lowercase()),
            PasswordRule::Digit => password.chars().any(|c| c.is_ascii_digit()),
            PasswordRule::Special => password.chars().any(|c| SPECIAL_CHARACTERS.contains(c)),
        }
    }

    fn description(&self) -> &'static str {
        match self {
            PasswordRule::Length => "At least 8 characters",
            PasswordRule::Uppercase => "1 uppercase letter",
            PasswordRule::Lowercase => "1 lowercase letter",
            PasswordRule::Digit => "1 number",
            PasswordRule::Special => "1 special character",
        }
    }
}

/// Check for a `local@domain.tld` shape.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_PATTERN.is_match(email)
}

/// True when the password meets all five strength rules.
pub fn is_valid_password(password: &str) -> bool {
    PasswordRule::ALL.iter().all(|rule| rule.is_met(password))
}

/// Descriptions of the unmet strength rules, in rule order.
pub fn password_feedback(password: &str) -> Vec<&'static str> {
    PasswordRule::ALL
        .iter()
        .filter(|rule| !rule.is_met(password))
        .map(PasswordRule::description)
        .collect()
}

/// Number of strength rules the password satisfies (0..=5), for strength meters.
pub fn password_strength(password: &str) -> usize {
    PasswordRule::ALL
        .iter()
        .filter(|rule| rule.is_met(password))
        .count()
}

pub fn passwords_match(password: &str, confirm: &str) -> bool {
    !password.is_empty() && password == confirm
}

fn check_email(result: &mut ValidationResult, email: &str) {
    if email.trim().is_empty() {
        result.insert(Field::Email, "Email is required");
    } else if !is_valid_email(email) {
        result.insert(Field::Email, "Please enter a valid email");
    }
}

/// Validate the login form.
pub fn validate_login_form(email: &str, password: &str) -> ValidationResult {
    let mut result = ValidationResult::default();
    check_email(&mut result, email);

    if password.trim().is_empty() {
        result.insert(Field::Password, "Password is required");
    } else if password.chars().count() < MIN_LOGIN_PASSWORD_LENGTH {
        result.insert(Field::Password, "Password must be at least 6 characters");
    }

    result
}

/// Validate email and password strength for a new account, without the
/// confirmation field.
pub fn validate_signup_fields(email: &str, password: &str) -> ValidationResult {
    let mut result = ValidationResult::default();
    check_email(&mut result, email);

    if password.trim().is_empty() {
        result.insert(Field::Password, "Password is required");
    } else if !is_valid_password(password) {
        let feedback = password_feedback(password);
        result.insert(
            Field::Password,
            format!("Password needs: {}", feedback.join(", ")),
        );
    }

    result
}

/// Validate the full signup form, including the confirmation field.
pub fn validate_signup_form(email: &str, password: &str, confirm: &str) -> ValidationResult {
    let mut result = validate_signup_fields(email, password);

    if confirm.trim().is_empty() {
        result.insert(Field::ConfirmPassword, "Please confirm your password");
    } else if !passwords_match(password, confirm) {
        result.insert(Field::ConfirmPassword, "Passwords do not match");
    }

    result
}
