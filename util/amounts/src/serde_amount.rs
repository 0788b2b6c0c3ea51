// Copyright (c) 2024 Botho Foundation

//! Serde adapter for amounts written either as a decimal string (`"0.05"`)
//! or as a raw scaled integer (`5000000`).
//!
//! ```ignore
//! #[derive(Deserialize)]
//! struct Bin {
//!     #[serde(with = "stk_util_amounts::serde_amount")]
//!     share: i64,
//! }
//! ```
//!
//! Serialization always produces the decimal string form.

use crate::{parse_amount, pretty_amount};
use serde::{de, Deserializer, Serializer};
use std::fmt;

/// Serialize a scaled amount as an eight-decimal string.
pub fn serialize<S: Serializer>(amount: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&pretty_amount(*amount))
}

/// Deserialize a scaled amount from a decimal string or a raw integer.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    deserializer.deserialize_any(AmountVisitor)
}

struct AmountVisitor;

impl<'de> de::Visitor<'de> for AmountVisitor {
    type Value = i64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a decimal amount string or a scaled integer")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
        Ok(v)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
        i64::try_from(v).map_err(|_| E::custom(format!("amount out of range: {v}")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
        parse_amount(v).map_err(E::custom)
    }
}
