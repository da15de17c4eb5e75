//! Wire-format helpers.
//!
//! The Request schema (§3) pins `value`/`gas`/`user-nonce`/`amount`/`token-id`
//! to decimal-string encoding and 20-byte account identifiers to lower-case
//! hex, independent of whatever an underlying `alloy_primitives` type's own
//! `serde` impl happens to choose. These modules are meant to be used with
//! `#[serde(with = "...")]` on individual struct fields.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use alloy_primitives::{Address, U256};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A `T` that is carried as a JSON string rather than a native TOML/env
/// value, so map- and list-valued config fields can be set from a single
/// environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct JsonStrWrapper<T>(pub T);

impl<T> FromStr for JsonStrWrapper<T>
where
    T: DeserializeOwned,
{
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).map(JsonStrWrapper)
    }
}

impl<T> fmt::Display for JsonStrWrapper<T>
where
    T: Serialize,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = serde_json::to_string(&self.0).map_err(|_| fmt::Error)?;

        s.fmt(f)
    }
}

impl<T> Serialize for JsonStrWrapper<T>
where
    T: Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_json::to_string(&self.0)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for JsonStrWrapper<T>
where
    T: DeserializeOwned,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = Cow::<'static, str>::deserialize(deserializer)?;

        serde_json::from_str(&s)
            .map(JsonStrWrapper)
            .map_err(serde::de::Error::custom)
    }
}

impl<T> From<T> for JsonStrWrapper<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

/// `U256` as a decimal string, per §3's wire invariant.
pub mod u256_decimal {
    use super::{Deserialize, Deserializer, Serializer, U256};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str_radix(&s, 10).map_err(serde::de::Error::custom)
    }
}

/// `Option<U256>` as a decimal string (or absent), for optional token fields.
pub mod opt_u256_decimal {
    use super::{Deserialize, Deserializer, Serializer, U256};

    pub fn serialize<S: Serializer>(
        value: &Option<U256>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.serialize_some(&v.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<U256>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| U256::from_str_radix(&s, 10).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// `Address` canonicalised to lower-case hex, per §3's wire invariant.
///
/// `alloy_primitives::Address`'s own `Display`/`serde` impl emits an EIP-55
/// checksummed mixed-case string; the wire schema here wants plain
/// lower-case hex, so account identifiers round-trip byte-identically
/// regardless of the checksum casing a caller happens to send.
pub mod address_lower_hex {
    use super::{Address, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Address, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:#x}").to_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Address, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// `Option<Address>` canonicalised to lower-case hex (or absent), for the
/// optional `token_address` field.
pub mod opt_address_lower_hex {
    use super::{Address, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Address>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(address) => {
                serializer.serialize_some(&format!("{address:#x}").to_lowercase())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Address>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Wrapper(#[serde(with = "u256_decimal")] U256);

    #[test]
    fn u256_round_trips_as_decimal() {
        let value = Wrapper(U256::from(1_000_000_000_000_000_000u128));
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, "\"1000000000000000000\"");

        let parsed: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.0, value.0);
    }

    #[test]
    fn json_str_wrapper_round_trips() {
        let wrapper = JsonStrWrapper(vec![1, 2, 3]);
        let s = serde_json::to_string(&wrapper).unwrap();
        assert_eq!(s, "\"[1,2,3]\"");
        let wrapper: JsonStrWrapper<Vec<u32>> = serde_json::from_str(&s).unwrap();
        assert_eq!(wrapper.0, vec![1, 2, 3]);
    }
}
