// =============================================================================
// SHIPPING FORM
// =============================================================================
// Field rules for receiver data. Input is trimmed and checked field by field;
// the first failing field is reported. Accepted text is HTML-escaped before
// it is stored.
// =============================================================================

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

pub const DEFAULT_PHONE_CODE: &str = "+86";
pub const DEFAULT_COUNTRY: &str = "CN";

static PHONE_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\+\d{1,4}$").expect("phone code pattern"));
static PHONE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\d\s+\-()]+$").expect("phone pattern"));
static COUNTRY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z]{2,3}$").expect("country pattern"));
static POSTCODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-\s]+$").expect("postcode pattern"));
static EMAIL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self { field, message: message.into() }
    }
}

/// Raw receiver fields as submitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShippingInput {
    pub receiver_name: String,
    pub phone_code: Option<String>,
    pub receiver_phone: String,
    pub receiver_email: Option<String>,
    pub receiver_country: Option<String>,
    pub receiver_province: Option<String>,
    pub receiver_city: Option<String>,
    pub receiver_district: Option<String>,
    pub receiver_address: String,
    pub receiver_postcode: Option<String>,
}

/// Validated, sanitized receiver data stored on an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverInfo {
    pub name: String,
    pub phone_code: String,
    pub phone: String,
    pub email: Option<String>,
    pub country: String,
    pub province: Option<String>,
    pub city: Option<String>,
    pub district: Option<String>,
    pub address: String,
    pub postcode: Option<String>,
}

/// Body of a shipping form submission.
#[derive(Debug, Deserialize)]
pub struct ShippingForm {
    #[serde(flatten)]
    pub shipping: ShippingInput,
    #[serde(default)]
    pub privacy_protected: bool,
    /// Chosen password for a newly created account.
    pub password: Option<SecretString>,
    pub remark: Option<String>,
}

#[derive(Debug)]
pub struct ValidForm {
    pub receiver: ReceiverInfo,
    pub privacy_protected: bool,
    pub password: Option<SecretString>,
    pub remark: Option<String>,
}

impl ShippingInput {
    pub fn validate(&self) -> Result<ReceiverInfo, FieldError> {
        let name = required(&self.receiver_name, "receiver_name", 100)?;

        let phone_code = match optional(&self.phone_code, "phone_code", 5)? {
            Some(code) if !PHONE_CODE.is_match(&code) => {
                return Err(FieldError::new("phone_code", "must look like +86"));
            }
            Some(code) => code,
            None => DEFAULT_PHONE_CODE.to_string(),
        };

        let phone = required(&self.receiver_phone, "receiver_phone", 50)?;
        if !PHONE.is_match(&phone) {
            return Err(FieldError::new("receiver_phone", "may only contain digits, spaces, +, -, ( and )"));
        }

        let email = optional(&self.receiver_email, "receiver_email", 255)?;
        if let Some(email) = &email {
            if !EMAIL.is_match(email) {
                return Err(FieldError::new("receiver_email", "is not a valid email address"));
            }
        }

        let country = match optional(&self.receiver_country, "receiver_country", 3)? {
            Some(country) => {
                let upper = country.to_uppercase();
                if !COUNTRY.is_match(&upper) {
                    return Err(FieldError::new("receiver_country", "must be a 2-3 letter country code"));
                }
                upper
            }
            None => DEFAULT_COUNTRY.to_string(),
        };

        let province = optional(&self.receiver_province, "receiver_province", 50)?;
        let city = optional(&self.receiver_city, "receiver_city", 50)?;
        let district = optional(&self.receiver_district, "receiver_district", 50)?;
        let address = required(&self.receiver_address, "receiver_address", 500)?;

        let postcode = optional(&self.receiver_postcode, "receiver_postcode", 20)?;
        if let Some(postcode) = &postcode {
            if !POSTCODE.is_match(postcode) {
                return Err(FieldError::new("receiver_postcode", "may only contain letters, digits, - and spaces"));
            }
        }

        Ok(ReceiverInfo {
            name: escape_html(&name),
            phone_code,
            phone,
            email: email.map(|e| e.to_lowercase()),
            country,
            province: province.as_deref().map(escape_html),
            city: city.as_deref().map(escape_html),
            district: district.as_deref().map(escape_html),
            address: escape_html(&address),
            postcode,
        })
    }
}

impl ShippingForm {
    pub fn validate(self) -> Result<ValidForm, FieldError> {
        let receiver = self.shipping.validate()?;

        if let Some(password) = &self.password {
            let len = password.expose_secret().chars().count();
            if !(6..=100).contains(&len) {
                return Err(FieldError::new("password", "must be 6-100 characters"));
            }
        }

        let remark = optional(&self.remark, "remark", 1000)?.map(|r| escape_html(&r));

        Ok(ValidForm {
            receiver,
            privacy_protected: self.privacy_protected,
            password: self.password,
            remark,
        })
    }
}

fn required(value: &str, field: &'static str, max: usize) -> Result<String, FieldError> {
    let trimmed = value.trim();
    let len = trimmed.chars().count();
    if len == 0 {
        return Err(FieldError::new(field, "is required"));
    }
    if len > max {
        return Err(FieldError::new(field, format!("must be at most {max} characters")));
    }
    Ok(trimmed.to_string())
}

/// Blank counts as absent.
fn optional(value: &Option<String>, field: &'static str, max: usize) -> Result<Option<String>, FieldError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(trimmed) if trimmed.chars().count() > max => {
            Err(FieldError::new(field, format!("must be at most {max} characters")))
        }
        Some(trimmed) => Ok(Some(trimmed.to_string())),
    }
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Email addresses are compared lower-cased.
pub fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    (!email.is_empty() && email.len() <= 255 && EMAIL.is_match(&email)).then_some(email)
}
