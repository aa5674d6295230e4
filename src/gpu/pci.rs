use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::GpuError;

/// PCI address in canonical `dddd:bb:dd.f` form (lowercase hex).
///
/// Ordering is lexical on the canonical string, which matches bus order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress(String);

impl PciAddress {
    /// Parse `dddd:bb:dd.f` or the short lspci form `bb:dd.f` (domain 0000).
    pub fn parse(raw: &str) -> Result<Self, GpuError> {
        let invalid = || GpuError::InvalidAddress(raw.to_string());
        let trimmed = raw.trim();

        let parts: Vec<&str> = trimmed.split(':').collect();
        let (domain, bus, slot_fn) = match parts.as_slice() {
            [domain, bus, slot_fn] => (*domain, *bus, *slot_fn),
            [bus, slot_fn] => ("0000", *bus, *slot_fn),
            _ => return Err(invalid()),
        };
        let (device, function) = slot_fn.split_once('.').ok_or_else(invalid)?;

        let hex = |s: &str, width: usize| {
            s.len() == width && s.chars().all(|c| c.is_ascii_hexdigit())
        };
        if !hex(domain, 4) || !hex(bus, 2) || !hex(device, 2) || !hex(function, 1) {
            return Err(invalid());
        }

        // device is 5 bits, function 3 bits
        let device_num = u8::from_str_radix(device, 16).map_err(|_| invalid())?;
        let function_num = u8::from_str_radix(function, 16).map_err(|_| invalid())?;
        if device_num > 0x1f || function_num > 7 {
            return Err(invalid());
        }

        Ok(Self(
            format!("{domain}:{bus}:{device}.{function}").to_ascii_lowercase(),
        ))
    }

    /// Pull the address out of a GPU label such as
    /// `0000:01:00.0 (10de:2204) NVIDIA RTX A6000`.
    pub fn extract(label: &str) -> Option<Self> {
        label
            .split_whitespace()
            .next()
            .and_then(|token| Self::parse(token).ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PciAddress {
    type Err = GpuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PciAddress {
    type Error = GpuError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PciAddress> for String {
    fn from(address: PciAddress) -> Self {
        address.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_form() {
        let addr = PciAddress::parse("0000:01:00.0").unwrap();
        assert_eq!(addr.as_str(), "0000:01:00.0");
    }

    #[test]
    fn canonicalises_case_and_short_form() {
        assert_eq!(PciAddress::parse("0000:AF:1F.7").unwrap().as_str(), "0000:af:1f.7");
        assert_eq!(PciAddress::parse("41:00.1").unwrap().as_str(), "0000:41:00.1");
    }

    #[test]
    fn rejects_malformed_addresses() {
        for raw in ["", "0000:01:00", "000:01:00.0", "0000:01:20.0", "0000:01:00.8", "gpu0", "0000:0g:00.0"] {
            assert!(PciAddress::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn extracts_address_from_label() {
        let addr = PciAddress::extract("0000:01:00.0 (10de:2204) NVIDIA RTX A6000");
        assert_eq!(addr.unwrap().as_str(), "0000:01:00.0");
        assert!(PciAddress::extract("NVIDIA RTX A6000").is_none());
        assert!(PciAddress::extract("invalid-string").is_none());
    }

    #[test]
    fn deserialize_validates() {
        let ok: PciAddress = serde_json::from_str("\"0000:02:00.0\"").unwrap();
        assert_eq!(ok.to_string(), "0000:02:00.0");
        assert!(serde_json::from_str::<PciAddress>("\"nope\"").is_err());
    }
}
