//! Hex-string serialization for address-valued fields.

use std::fmt;

use serde::{Serialize, Serializer};

/// A u64 that serializes (and displays) as `0x<lowercase hex>`, so
/// addresses in reports are never mistaken for decimal counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HexValue(pub u64);

impl fmt::Display for HexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Serialize for HexValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// `#[serde(serialize_with)]` helper for bare `u64` address fields.
pub fn serialize_hex<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
    HexValue(*value).serialize(serializer)
}

/// Same, for optional addresses.
pub fn serialize_opt_hex<S: Serializer>(
    value: &Option<u64>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    value.map(HexValue).serialize(serializer)
}
