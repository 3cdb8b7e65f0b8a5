//! Declarative shaping configuration.
//!
//! [`Bandwidth`] parses human-friendly rates (`"10MiB/s"`, `"500KB"`, `65536`) and
//! [`ShapeConfig`] bundles everything an adapter needs. Both deserialize with serde so they can
//! sit inside a larger application config:
//!
//! ```
//! use shapeio::config::ShapeConfig;
//!
//! let json = r#"{ "rate": "1MiB/s", "chunk_size": 16384 }"#;
//! let cfg: ShapeConfig = serde_json::from_str(json).unwrap();
//! assert_eq!(cfg.rate.bytes_per_sec(), 1_048_576.0);
//! assert_eq!(cfg.limiter().rate(), 1_048_576.0);
//! ```
use std::{fmt, str::FromStr, time::Duration};

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, ShapeError},
    limiter::{DEFAULT_BURST_WINDOW, RateLimiter},
};

/// Largest number of bytes an adapter moves per admission.
///
/// Keeps each wait short so cancellation and rate changes take effect quickly.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// A transfer rate in bytes per second. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(try_from = "RawBandwidth", into = "f64")]
pub struct Bandwidth(f64);

impl Bandwidth {
    pub const UNLIMITED: Bandwidth = Bandwidth(0.0);

    /// Wrap a raw bytes-per-second figure. Anything not finite and positive becomes unlimited.
    pub fn new(bytes_per_sec: f64) -> Self {
        if bytes_per_sec.is_finite() && bytes_per_sec > 0.0 {
            Self(bytes_per_sec)
        } else {
            Self::UNLIMITED
        }
    }

    #[inline]
    pub fn bytes_per_sec(self) -> f64 {
        self.0
    }

    #[inline]
    pub fn is_unlimited(self) -> bool {
        self.0 == 0.0
    }
}

impl From<Bandwidth> for f64 {
    fn from(bw: Bandwidth) -> Self {
        bw.0
    }
}

impl FromStr for Bandwidth {
    type Err = ShapeError;

    /// Accepts plain numbers (`"1500"`, `"2.5e6"`), `bytesize` notation (`"500KB"`, `"10 MiB"`)
    /// and an optional `/s` suffix. `"0"` and `"unlimited"` disable limiting.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ShapeError::InvalidBandwidth(s.to_string());

        let trimmed = s.trim();
        let per_sec = |cut: usize| {
            trimmed.is_char_boundary(cut) && trimmed[cut..].eq_ignore_ascii_case("/s")
        };
        let body = match trimmed.len().checked_sub(2) {
            Some(cut) if per_sec(cut) => trimmed[..cut].trim_end(),
            _ => trimmed,
        };

        if body.is_empty() {
            return Err(invalid());
        }
        if body.eq_ignore_ascii_case("unlimited") {
            return Ok(Self::UNLIMITED);
        }

        if let Ok(value) = body.parse::<f64>() {
            return if value.is_finite() && value >= 0.0 {
                Ok(Self::new(value))
            } else {
                Err(invalid())
            };
        }

        let size: ByteSize = body.parse().map_err(|_| invalid())?;
        Ok(Self::new(size.as_u64() as f64))
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlimited() {
            write!(f, "unlimited")
        } else {
            write!(f, "{}/s", ByteSize::b(self.0 as u64))
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBandwidth {
    Number(f64),
    Text(String),
}

impl TryFrom<RawBandwidth> for Bandwidth {
    type Error = ShapeError;

    fn try_from(raw: RawBandwidth) -> Result<Self> {
        match raw {
            RawBandwidth::Number(n) if n.is_finite() && n >= 0.0 => Ok(Bandwidth::new(n)),
            RawBandwidth::Number(n) => Err(ShapeError::InvalidBandwidth(n.to_string())),
            RawBandwidth::Text(s) => s.parse(),
        }
    }
}

/// Everything needed to build a shaped reader or writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShapeConfig {
    /// Ceiling in bytes per second; unlimited when absent.
    pub rate: Bandwidth,
    /// How much time worth of tokens may be banked, in milliseconds.
    pub burst_window_ms: u64,
    /// Upper bound for a single admission, in bytes.
    pub chunk_size: usize,
}

impl Default for ShapeConfig {
    fn default() -> Self {
        Self {
            rate: Bandwidth::UNLIMITED,
            burst_window_ms: DEFAULT_BURST_WINDOW.as_millis() as u64,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ShapeConfig {
    pub fn with_rate(rate: Bandwidth) -> Self {
        Self {
            rate,
            ..Self::default()
        }
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    /// Chunk size with `0` mapped to one byte.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }

    /// Build a fresh limiter for one adapter.
    pub fn limiter(&self) -> RateLimiter {
        RateLimiter::builder()
            .rate(self.rate.bytes_per_sec())
            .burst_window(self.burst_window())
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bps(s: &str) -> f64 {
        s.parse::<Bandwidth>().unwrap().bytes_per_sec()
    }

    #[test]
    fn parses_plain_numbers() {
        assert_eq!(bps("65536"), 65536.0);
        assert_eq!(bps("  2.5e3 "), 2500.0);
        assert_eq!(bps("1024/s"), 1024.0);
    }

    #[test]
    fn parses_byte_units_with_optional_suffix() {
        assert_eq!(bps("10MiB/s"), 10.0 * 1024.0 * 1024.0);
        assert_eq!(bps("500KB"), 500_000.0);
        assert_eq!(bps("64 KiB/S"), 65536.0);
    }

    #[test]
    fn zero_and_keyword_mean_unlimited() {
        assert!("0".parse::<Bandwidth>().unwrap().is_unlimited());
        assert!("unlimited".parse::<Bandwidth>().unwrap().is_unlimited());
        assert_eq!(Bandwidth::UNLIMITED.to_string(), "unlimited");
    }

    #[test]
    fn rejects_garbage_and_negative_values() {
        for input in ["", "/s", "fast", "-5", "NaN", "inf", "10 parsecs"] {
            let err = input.parse::<Bandwidth>().unwrap_err();
            assert_eq!(err, ShapeError::InvalidBandwidth(input.to_string()));
        }
    }

    #[test]
    fn new_normalizes_invalid_rates() {
        assert!(Bandwidth::new(-1.0).is_unlimited());
        assert!(Bandwidth::new(f64::NAN).is_unlimited());
        assert_eq!(Bandwidth::new(12.0).bytes_per_sec(), 12.0);
    }

    #[test]
    fn config_deserializes_strings_and_numbers() {
        let cfg: ShapeConfig =
            serde_json::from_str(r#"{ "rate": "1MiB/s", "burst_window_ms": 250 }"#).unwrap();
        assert_eq!(cfg.rate.bytes_per_sec(), 1_048_576.0);
        assert_eq!(cfg.burst_window(), Duration::from_millis(250));
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);

        let cfg: ShapeConfig = serde_json::from_str(r#"{ "rate": 2048 }"#).unwrap();
        assert_eq!(cfg.rate.bytes_per_sec(), 2048.0);

        let cfg: ShapeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, ShapeConfig::default());
    }

    #[test]
    fn config_rejects_unknown_fields_and_bad_rates() {
        assert!(serde_json::from_str::<ShapeConfig>(r#"{ "speed": 1 }"#).is_err());
        assert!(serde_json::from_str::<ShapeConfig>(r#"{ "rate": -1 }"#).is_err());
        assert!(serde_json::from_str::<ShapeConfig>(r#"{ "rate": "lots" }"#).is_err());
    }

    #[test]
    fn config_builds_matching_limiter() {
        let cfg = ShapeConfig {
            rate: Bandwidth::new(4000.0),
            burst_window_ms: 500,
            chunk_size: 0,
        };
        let limiter = cfg.limiter();
        assert_eq!(limiter.rate(), 4000.0);
        assert_eq!(limiter.capacity(), 2000.0);
        assert_eq!(cfg.chunk_size(), 1);
    }
}
