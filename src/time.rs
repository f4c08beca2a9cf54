//! NTP-style time tags
//!
//! Ping messages and audio timestamps use 64-bit fixed point time:
//! the upper 32 bits count seconds since 1900-01-01, the lower 32 bits
//! are the binary fraction of a second (the OSC time tag layout).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970)
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

const FRACTION_SCALE: f64 = 4_294_967_296.0;

/// 32.32 fixed point time tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NtpTime(u64);

impl NtpTime {
    /// The OSC "immediately" time tag
    pub const IMMEDIATE: NtpTime = NtpTime(1);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Current system time
    pub fn now() -> Self {
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = since_unix.as_secs() + NTP_UNIX_OFFSET;
        let frac = (u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000;
        Self((secs << 32) | frac)
    }

    /// Build a time tag from (fractional) seconds since the NTP epoch
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs <= 0.0 {
            return Self(0);
        }
        let whole = secs.floor();
        let frac = ((secs - whole) * FRACTION_SCALE) as u64;
        Self(((whole as u64) << 32) | (frac & 0xffff_ffff))
    }

    pub fn as_secs_f64(self) -> f64 {
        self.seconds() as f64 + self.fraction() as f64 / FRACTION_SCALE
    }

    pub fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn fraction(self) -> u32 {
        self.0 as u32
    }

    /// Signed duration in seconds from `from` to `to`
    pub fn duration(from: NtpTime, to: NtpTime) -> f64 {
        if to.0 >= from.0 {
            (to.0 - from.0) as f64 / FRACTION_SCALE
        } else {
            -((from.0 - to.0) as f64 / FRACTION_SCALE)
        }
    }

    /// Offset this time tag by a (possibly negative) number of seconds
    pub fn add_secs(self, secs: f64) -> Self {
        let delta = (secs.abs() * FRACTION_SCALE) as u64;
        if secs >= 0.0 {
            Self(self.0.saturating_add(delta))
        } else {
            Self(self.0.saturating_sub(delta))
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NtpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_after_unix_epoch() {
        let now = NtpTime::now();
        assert!(u64::from(now.seconds()) > NTP_UNIX_OFFSET);
    }

    #[test]
    fn test_secs_conversion() {
        let t = NtpTime::from_secs_f64(1234.5);
        assert_eq!(t.seconds(), 1234);
        assert_eq!(t.fraction(), 0x8000_0000);
        assert!((t.as_secs_f64() - 1234.5).abs() < 1e-9);
    }

    #[test]
    fn test_duration_is_signed() {
        let a = NtpTime::from_secs_f64(100.0);
        let b = a.add_secs(0.25);
        assert!((NtpTime::duration(a, b) - 0.25).abs() < 1e-9);
        assert!((NtpTime::duration(b, a) + 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_add_negative_secs() {
        let a = NtpTime::from_secs_f64(10.0);
        let b = a.add_secs(-2.5);
        assert!((b.as_secs_f64() - 7.5).abs() < 1e-9);
    }
}
