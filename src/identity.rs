//! Monitor identification reported by the `V` command.

use core::fmt::Write;

use heapless::String;

#[allow(dead_code)]
mod build_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// SAM-BA protocol version
pub const VERSION: &str = "2.0";

/// Extended capabilities, advertising the `X`, `Y` and `Z` commands
pub const CAPABILITIES: &str = "[Arduino:XYZ]";

/// Build date and time in the `Mmm dd yyyy` / `hh:mm:ss` form of C's
/// `__DATE__` and `__TIME__`
#[derive(Clone, Debug, PartialEq)]
pub struct BuildStamp {
    pub date: String<11>,
    pub time: String<8>,
}

impl BuildStamp {
    /// Stamp of this build
    pub fn current() -> Self {
        Self::from_rfc2822(build_info::BUILT_TIME_UTC)
    }

    /// Convert an RFC 2822 timestamp (`Tue, 1 Jul 2003 10:52:37 +0000`).
    ///
    /// Unparseable fields are reported as `?`.
    pub fn from_rfc2822(stamp: &str) -> Self {
        let mut parts = stamp.split_whitespace().skip(1);

        let day = parts.next().and_then(|d| d.parse::<u8>().ok());
        let month = parts.next();
        let year = parts.next();
        let time = parts.next();

        let mut s = Self {
            date: String::new(),
            time: String::new(),
        };

        match (month, day, year) {
            (Some(m), Some(d), Some(y)) if m.len() == 3 && y.len() == 4 => {
                let _ = write!(s.date, "{} {:>2} {}", m, d, y);
            }
            _ => {
                let _ = s.date.push('?');
            }
        }

        match time {
            Some(t) if t.len() == 8 => {
                let _ = s.time.push_str(t);
            }
            _ => {
                let _ = s.time.push('?');
            }
        }

        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_rfc2822() {
        let s = BuildStamp::from_rfc2822("Tue, 1 Jul 2003 10:52:37 +0000");
        assert_eq!(s.date.as_str(), "Jul  1 2003");
        assert_eq!(s.time.as_str(), "10:52:37");

        let s = BuildStamp::from_rfc2822("Fri, 16 Oct 2026 09:05:00 +0000");
        assert_eq!(s.date.as_str(), "Oct 16 2026");
    }

    #[test]
    fn malformed_stamp() {
        let s = BuildStamp::from_rfc2822("garbage");
        assert_eq!(s.date.as_str(), "?");
        assert_eq!(s.time.as_str(), "?");
    }

    #[test]
    fn current_stamp_is_well_formed() {
        let s = BuildStamp::current();
        assert_eq!(s.date.len(), 11);
        assert_eq!(s.time.len(), 8);
    }
}
