use std::fmt;

use serde::{Deserialize, Serialize};

use super::SecureStoreError;

/// Fixed identifier of an application's storage region.
///
/// Used as the keychain service name and as the preferences file stem, so it
/// must be non-empty and free of path separators and control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    pub fn new(value: impl Into<String>) -> Result<Self, SecureStoreError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(SecureStoreError::invalid_argument(
                "Namespace must not be empty",
            ));
        }
        if value
            .chars()
            .any(|c| c.is_control() || c == '/' || c == '\\')
        {
            return Err(SecureStoreError::invalid_argument(format!(
                "Namespace contains invalid characters: {value:?}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Namespace {
    type Error = SecureStoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Namespace::new(value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.0
    }
}
