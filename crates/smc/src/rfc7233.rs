//! `Range` header grammar (RFC 7233, byte ranges only).
//!
//! ```text
//! bytes=500-600,601-999,1001-
//! ```
//!
//! Either side of a range may be omitted. Only the unit `bytes` is accepted.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("range must start with 'bytes=': {0}")]
    Unit(String),

    #[error("empty range specifier")]
    Empty,

    #[error("malformed range '{0}'")]
    Malformed(String),

    #[error("invalid range bound '{0}'")]
    Bound(String),

    #[error("range end {end} before start {start}")]
    Inverted { start: u64, end: u64 },
}

/// One `<start>-<end>` pair. Both bounds are inclusive when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl ByteRange {
    /// Start offset, 0 when omitted.
    pub fn start_or_zero(&self) -> u64 {
        self.start.unwrap_or(0)
    }

    /// True when the range runs to the end of the entity.
    pub fn is_open_ended(&self) -> bool {
        self.end.is_none()
    }
}

impl FromStr for ByteRange {
    type Err = RangeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (start, end) = raw
            .split_once('-')
            .ok_or_else(|| RangeError::Malformed(raw.to_string()))?;
        if end.contains('-') {
            return Err(RangeError::Malformed(raw.to_string()));
        }

        let bound = |s: &str| -> Result<Option<u64>, RangeError> {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse().map(Some).map_err(|_| RangeError::Bound(s.to_string()))
            }
        };
        let range = ByteRange {
            start: bound(start)?,
            end: bound(end)?,
        };

        if let (Some(start), Some(end)) = (range.start, range.end) {
            if end < start {
                return Err(RangeError::Inverted { start, end });
            }
        }
        Ok(range)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(start) = self.start {
            write!(f, "{}", start)?;
        }
        write!(f, "-")?;
        if let Some(end) = self.end {
            write!(f, "{}", end)?;
        }
        Ok(())
    }
}

/// A parsed `Range` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranges {
    ranges: Vec<ByteRange>,
}

impl Ranges {
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ByteRange> {
        self.ranges.iter()
    }

    pub fn first(&self) -> Option<&ByteRange> {
        self.ranges.first()
    }

    /// Start of the first range, 0 when absent.
    pub fn first_start(&self) -> u64 {
        self.first().map(ByteRange::start_or_zero).unwrap_or(0)
    }

    /// True when the first range runs to the end of the entity.
    pub fn is_open_ended(&self) -> bool {
        self.first().is_some_and(ByteRange::is_open_ended)
    }
}

impl<'a> IntoIterator for &'a Ranges {
    type Item = &'a ByteRange;
    type IntoIter = std::slice::Iter<'a, ByteRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

/// Parse a `Range` header value.
pub fn parse(raw: &str) -> Result<Ranges, RangeError> {
    let spec = raw
        .trim()
        .strip_prefix("bytes=")
        .ok_or_else(|| RangeError::Unit(raw.to_string()))?;
    if spec.trim().is_empty() {
        return Err(RangeError::Empty);
    }

    let ranges = spec
        .split(',')
        .map(str::parse)
        .collect::<Result<Vec<ByteRange>, _>>()?;
    Ok(Ranges { ranges })
}

impl FromStr for Ranges {
    type Err = RangeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        parse(raw)
    }
}
