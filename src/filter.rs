use crate::store::Advertisement;
use crate::{Error, Result};

/// Immutable snapshot of the active filter criteria.
///
/// All present criteria are ANDed; an absent criterion always matches.
/// Filtering is pure and applied to store snapshots, so changing the
/// filter never requires a re-scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    name_contains: Option<String>,
    address_contains: Option<String>,
    min_rssi: Option<i16>,
    payload_pattern: Option<Vec<u8>>,
}

impl FilterSpec {
    /// A spec with no criteria, which matches every device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match devices whose name contains the given substring,
    /// case-insensitively.
    pub fn name_contains(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains = Some(fragment.into().to_lowercase());
        self
    }

    /// Match devices whose address contains the given substring,
    /// case-insensitively.
    pub fn address_contains(mut self, fragment: impl Into<String>) -> Self {
        self.address_contains = Some(fragment.into().to_lowercase());
        self
    }

    /// Match devices with `rssi >= minimum`. Devices with unknown RSSI
    /// do not match.
    pub fn min_rssi(mut self, minimum: i16) -> Self {
        self.min_rssi = Some(minimum);
        self
    }

    /// Match devices whose raw payload contains the given byte
    /// subsequence, written as hex. Case-insensitive; spaces and `:`
    /// separators are ignored.
    pub fn payload_pattern_hex(mut self, pattern: &str) -> Result<Self> {
        self.payload_pattern = Some(parse_hex_pattern(pattern)?);
        Ok(self)
    }

    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        if let Some(fragment) = &self.name_contains {
            let matched = advertisement
                .name
                .as_ref()
                .map(|name| name.to_lowercase().contains(fragment))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }

        if let Some(fragment) = &self.address_contains {
            if !advertisement.address.to_lowercase().contains(fragment) {
                return false;
            }
        }

        if let Some(minimum) = self.min_rssi {
            match advertisement.rssi {
                Some(rssi) if rssi >= minimum => {}
                _ => return false,
            }
        }

        if let Some(pattern) = &self.payload_pattern {
            if !contains_subsequence(&advertisement.raw_payload, pattern) {
                return false;
            }
        }

        true
    }

    /// Filter a snapshot. Order-preserving and idempotent.
    pub fn apply(&self, advertisements: &[Advertisement]) -> Vec<Advertisement> {
        advertisements
            .iter()
            .filter(|advertisement| self.matches(advertisement))
            .cloned()
            .collect()
    }
}

fn parse_hex_pattern(pattern: &str) -> Result<Vec<u8>> {
    let digits = pattern
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect::<String>();

    if digits.len() % 2 != 0 {
        return Err(Error::InvalidFilterPattern(pattern.to_string()));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| Error::InvalidFilterPattern(pattern.to_string()))
        })
        .collect()
}

fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}
