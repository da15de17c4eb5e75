use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use url::Url;

/// A value that must never appear in logs or `Debug`/`Display` output.
///
/// `Serialize` is intentionally NOT masked: the config layer needs the real
/// value to round-trip through TOML/env. Masking only applies to anything a
/// human or a log line would read.
#[derive(Clone, Eq, PartialEq, Deserialize)]
pub struct Secret<S>(S)
where
    S: fmt::Debug + AsRef<str>;

impl<S> Secret<S>
where
    S: fmt::Debug + AsRef<str>,
{
    pub fn new(value: S) -> Secret<S> {
        Secret(value)
    }

    pub fn expose(&self) -> &str {
        self.0.as_ref()
    }
}

impl<S> fmt::Debug for Secret<S>
where
    S: fmt::Debug + AsRef<str>,
{
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("**********")
    }
}

impl<S> fmt::Display for Secret<S>
where
    S: fmt::Debug + AsRef<str>,
{
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("**********")
    }
}

impl<S> Serialize for Secret<S>
where
    S: fmt::Debug + AsRef<str>,
{
    fn serialize<Ser: serde::Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        serializer.serialize_str(self.0.as_ref())
    }
}

impl FromStr for Secret<Url> {
    type Err = <Url as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::from_str(s).map(Secret::new)
    }
}

impl FromStr for Secret<String> {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Secret::new(s.to_string()))
    }
}

/// A URL carrying a credential (database DSN, signer API secret, RPC URL with
/// an embedded API key) that should never be logged.
pub type SecretUrl = Secret<Url>;

/// A bare secret string (API key, private key hex) that should never be
/// logged.
pub type SecretString = Secret<String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expose() {
        let secret = Secret(String::from("password@something!"));
        assert_eq!(secret.expose(), "password@something!");
    }

    #[test]
    fn test_debug() {
        let secret = Secret(String::from("password@something!"));
        assert_eq!(format!("{secret:?}"), "**********");
    }

    #[test]
    fn test_serialize_exposes_real_value() {
        let secret: SecretString = "s3cr3t".parse().unwrap();
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"s3cr3t\"");
    }
}
