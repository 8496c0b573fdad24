use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::error::{ReconError, ReconResult};

/// Geographic resolution of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Block,
    BlockGroup,
    Tract,
    Taz,
    County,
}

impl Resolution {
    /// Block -> block group -> tract keys are GEOID prefixes of each other.
    /// TAZ and county keys need an explicit crosswalk.
    #[inline]
    pub fn is_prefix_derived(self) -> bool {
        matches!(self, Self::Block | Self::BlockGroup | Self::Tract)
    }

    /// Stable integer tag used by the npz table layout.
    pub fn code(self) -> i32 {
        match self {
            Self::Block => 0,
            Self::BlockGroup => 1,
            Self::Tract => 2,
            Self::Taz => 3,
            Self::County => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Block),
            1 => Some(Self::BlockGroup),
            2 => Some(Self::Tract),
            3 => Some(Self::Taz),
            4 => Some(Self::County),
            _ => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Block => "block",
            Self::BlockGroup => "block group",
            Self::Tract => "tract",
            Self::Taz => "TAZ",
            Self::County => "county",
        };
        f.write_str(name)
    }
}

/// Opaque geographic identifier (GEOID, TAZ number, county name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeoKey(String);

impl GeoKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GeoKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for GeoKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for GeoKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GeoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A key tagged with its resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GeoUnit {
    pub key: GeoKey,
    pub resolution: Resolution,
}

/// Fixed GEOID widths per prefix-derived resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyWidths {
    pub block: usize,
    pub block_group: usize,
    pub tract: usize,
}

impl Default for KeyWidths {
    fn default() -> Self {
        Self {
            block: 15,
            block_group: 12,
            tract: 11,
        }
    }
}

impl KeyWidths {
    pub fn width(&self, level: Resolution) -> Option<usize> {
        match level {
            Resolution::Block => Some(self.block),
            Resolution::BlockGroup => Some(self.block_group),
            Resolution::Tract => Some(self.tract),
            Resolution::Taz | Resolution::County => None,
        }
    }

    fn all(&self) -> [usize; 3] {
        [self.block, self.block_group, self.tract]
    }
}

/// Slices parent GEOIDs out of child GEOIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeoKeyDeriver {
    widths: KeyWidths,
}

fn malformed(key: &str, level: Resolution, reason: impl Into<String>) -> ReconError {
    ReconError::MalformedKey {
        key: key.to_string(),
        level,
        reason: reason.into(),
    }
}

impl GeoKeyDeriver {
    pub fn new(widths: KeyWidths) -> Self {
        Self { widths }
    }

    pub fn widths(&self) -> &KeyWidths {
        &self.widths
    }

    fn width_of(&self, level: Resolution) -> ReconResult<usize> {
        self.widths
            .width(level)
            .ok_or(ReconError::NotPrefixDerivable(level))
    }

    /// Restores a leading zero lost to a numeric round trip.
    ///
    /// A key whose length matches a configured width is returned untouched.
    /// A key exactly one digit short of a configured width gets one `0`
    /// prepended (state FIPS 01-09 lose at most one digit). Anything else is
    /// returned as-is and left for the caller's width check.
    pub fn normalize(&self, key: &str, level: Resolution) -> ReconResult<String> {
        let key = key.trim();
        if key.is_empty() {
            return Err(malformed(key, level, "empty key"));
        }
        if !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed(key, level, "GEOIDs are digit strings"));
        }
        let widths = self.widths.all();
        if widths.contains(&key.len()) {
            return Ok(key.to_string());
        }
        if widths.contains(&(key.len() + 1)) {
            return Ok(format!("0{key}"));
        }
        Ok(key.to_string())
    }

    /// Derives the `level` key from any finer-or-equal GEOID.
    ///
    /// # Errors
    /// - `NotPrefixDerivable` for TAZ/county.
    /// - `MalformedKey` when the (normalized) key is shorter than `level`'s width.
    pub fn derive(&self, geoid: &str, level: Resolution) -> ReconResult<GeoKey> {
        let width = self.width_of(level)?;
        let key = self.normalize(geoid, level)?;
        if key.len() < width {
            return Err(malformed(
                geoid,
                level,
                format!("{} digits, need at least {width}", key.len()),
            ));
        }
        Ok(GeoKey(key[..width].to_string()))
    }

    /// Same as [`derive`](Self::derive) but with the source resolution known,
    /// so the padding decision is exact instead of inferred.
    pub fn derive_from(
        &self,
        geoid: &str,
        source: Resolution,
        level: Resolution,
    ) -> ReconResult<GeoKey> {
        let source_width = self.width_of(source)?;
        let width = self.width_of(level)?;
        if width > source_width {
            return Err(malformed(
                geoid,
                level,
                format!("cannot derive a {level} key from a {source} key"),
            ));
        }
        let key = self.canonical(geoid, source)?;
        Ok(GeoKey(key.as_str()[..width].to_string()))
    }

    /// Canonical full-width key for `source`, padding one dropped leading zero.
    pub fn canonical(&self, geoid: &str, source: Resolution) -> ReconResult<GeoKey> {
        let width = self.width_of(source)?;
        let key = geoid.trim();
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed(geoid, source, "GEOIDs are digit strings"));
        }
        match key.len() {
            n if n == width => Ok(GeoKey(key.to_string())),
            n if n + 1 == width => Ok(GeoKey(format!("0{key}"))),
            n => Err(malformed(
                geoid,
                source,
                format!("{n} digits, expected {width}"),
            )),
        }
    }

    /// Key for a GEOID that went through an integer column.
    pub fn from_numeric(&self, value: u64, source: Resolution) -> ReconResult<GeoKey> {
        match self.widths.width(source) {
            Some(width) => {
                let key = format!("{value:0width$}");
                if key.len() > width {
                    return Err(malformed(
                        &key,
                        source,
                        format!("{} digits, expected {width}", key.len()),
                    ));
                }
                Ok(GeoKey(key))
            }
            None => Ok(GeoKey(value.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_block_group_and_tract_from_block() {
        let d = GeoKeyDeriver::default();
        let block = "060010001001000";
        assert_eq!(
            d.derive(block, Resolution::BlockGroup).unwrap().as_str(),
            "060010001001"
        );
        assert_eq!(
            d.derive(block, Resolution::Tract).unwrap().as_str(),
            "06001000100"
        );
        assert_eq!(d.derive(block, Resolution::Block).unwrap().as_str(), block);
    }

    #[test]
    fn pads_single_dropped_leading_zero() {
        let d = GeoKeyDeriver::default();
        let key = d.derive("60010001001000", Resolution::BlockGroup).unwrap();
        assert_eq!(key.as_str(), "060010001001");
        let key = d
            .derive_from("60010001001", Resolution::BlockGroup, Resolution::Tract)
            .unwrap();
        assert_eq!(key.as_str(), "06001000100");
    }

    #[test]
    fn rejects_short_and_non_digit_keys() {
        let d = GeoKeyDeriver::default();
        assert!(matches!(
            d.derive("0600100", Resolution::BlockGroup),
            Err(ReconError::MalformedKey { .. })
        ));
        // exact tract width wins over a padded block group reading
        assert!(matches!(
            d.derive("06001000100", Resolution::BlockGroup),
            Err(ReconError::MalformedKey { .. })
        ));
        assert!(matches!(
            d.derive("06001A001001000", Resolution::Tract),
            Err(ReconError::MalformedKey { .. })
        ));
        assert!(matches!(
            d.derive_from("060010001", Resolution::Block, Resolution::Tract),
            Err(ReconError::MalformedKey { .. })
        ));
    }

    #[test]
    fn taz_and_county_need_a_crosswalk() {
        let d = GeoKeyDeriver::default();
        assert!(matches!(
            d.derive("060010001001000", Resolution::County),
            Err(ReconError::NotPrefixDerivable(Resolution::County))
        ));
    }

    #[test]
    fn numeric_keys_are_zero_filled() {
        let d = GeoKeyDeriver::default();
        let key = d.from_numeric(60010001001, Resolution::BlockGroup).unwrap();
        assert_eq!(key.as_str(), "060010001001");
        assert_eq!(d.from_numeric(1234, Resolution::Taz).unwrap().as_str(), "1234");
        assert!(d.from_numeric(1_000_000_000_000, Resolution::Tract).is_err());
    }
}
