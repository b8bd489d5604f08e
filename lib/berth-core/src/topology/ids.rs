use std::{
    borrow::{Borrow, Cow},
    fmt,
    ops::Deref,
};

use serde::{Serialize, Serializer};

const INVALID_SERVICE_NAME: &str =
    "service names must start with an alphanumeric (a-z, A-Z, or 0-9) and may only contain alphanumerics, underscores, periods, and hyphens";

/// A service name.
///
/// Service names double as container hostnames and as the suffix of container names, so they are restricted to the
/// character set the container runtime accepts for both.
#[derive(Clone, Debug, Hash, Eq, Ord, PartialEq, PartialOrd)]
pub struct ServiceName(Cow<'static, str>);

impl ServiceName {
    /// Creates a `ServiceName` from a static string.
    ///
    /// # Errors
    ///
    /// If the name contains invalid characters, an error is returned.
    pub fn from_static(name: &'static str) -> Result<Self, &'static str> {
        if validate_service_name(name) {
            Ok(Self(Cow::Borrowed(name)))
        } else {
            Err(INVALID_SERVICE_NAME)
        }
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for ServiceName {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if !validate_service_name(value) {
            Err(INVALID_SERVICE_NAME)
        } else {
            Ok(Self(value.to_string().into()))
        }
    }
}

impl TryFrom<String> for ServiceName {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if !validate_service_name(&value) {
            Err(INVALID_SERVICE_NAME)
        } else {
            Ok(Self(value.into()))
        }
    }
}

impl Deref for ServiceName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Borrow<str> for ServiceName {
    fn borrow(&self) -> &str {
        self.0.as_ref()
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for ServiceName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

const fn validate_service_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || !bytes[0].is_ascii_alphanumeric() {
        return false;
    }

    let mut idx = 1;
    while idx < bytes.len() {
        let b = bytes[idx];
        if !(b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.') {
            return false;
        }
        idx += 1;
    }

    true
}
