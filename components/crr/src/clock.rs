/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Hybrid logical clock.
//!
//! Every change the triggers capture is stamped with one of these, and the
//! whole conflict-resolution story leans on two properties:
//!
//!   - a replica never produces or observes a clock and then emits a smaller
//!     one, and
//!   - the string encoding sorts exactly like the `(physical, logical)`
//!     tuple, so SQL `ORDER BY created_at` and last-writer comparisons agree.
//!
//! The encoding is `base36(physical) "-" base36(logical)` with both parts
//! zero padded to a fixed width; padding is what keeps lexicographic and
//! numeric order identical.

use crate::error::{Error, Result};
use crate::types::Timestamp;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Result as RusqliteResult;
use std::fmt;
use std::str::FromStr;

// 36^9 milliseconds is comfortably past the year 5000; 36^4 gives the
// logical counter 1.6M ticks within one millisecond.
const PHYSICAL_WIDTH: usize = 9;
const LOGICAL_WIDTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hlc {
    /// Largest physical time (unix ms) this replica has seen.
    pub pt: u64,
    /// Logical counter disambiguating events within one millisecond.
    pub lt: u64,
}

impl Hlc {
    /// A fresh clock at the current wall time.
    pub fn new() -> Hlc {
        Hlc {
            pt: Timestamp::now().as_millis() as u64,
            lt: 0,
        }
    }

    /// Advance for a local event ("send" in the HLC literature).
    pub fn send(self) -> Hlc {
        self.send_at(Timestamp::now().as_millis() as u64)
    }

    /// Merge an incoming clock ("receive"): the result strictly dominates
    /// both the local clock and the message's.
    pub fn receive(self, msg: Hlc) -> Hlc {
        self.receive_at(msg, Timestamp::now().as_millis() as u64)
    }

    fn send_at(self, now: u64) -> Hlc {
        if now > self.pt {
            Hlc { pt: now, lt: 0 }
        } else {
            Hlc {
                pt: self.pt,
                lt: self.lt + 1,
            }
        }
    }

    fn receive_at(self, msg: Hlc, now: u64) -> Hlc {
        let pt = self.pt.max(msg.pt).max(now);
        let lt = if pt == self.pt && pt == msg.pt {
            self.lt.max(msg.lt) + 1
        } else if pt == self.pt {
            self.lt + 1
        } else if pt == msg.pt {
            msg.lt + 1
        } else {
            0
        };
        Hlc { pt, lt }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}-{}",
            to_base36(self.pt, PHYSICAL_WIDTH),
            to_base36(self.lt, LOGICAL_WIDTH)
        )
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl FromStr for Hlc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Hlc> {
        let malformed = || Error::MalformedClock(s.to_string());
        let (pt, lt) = s.split_once('-').ok_or_else(malformed)?;
        Ok(Hlc {
            pt: u64::from_str_radix(pt, 36).map_err(|_| malformed())?,
            lt: u64::from_str_radix(lt, 36).map_err(|_| malformed())?,
        })
    }
}

impl ToSql for Hlc {
    fn to_sql(&self) -> RusqliteResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.encode()))
    }
}

impl FromSql for Hlc {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Hlc::from_str(s).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl serde::Serialize for Hlc {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> serde::Deserialize<'de> for Hlc {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = <String as serde::Deserialize<'de>>::deserialize(deserializer)?;
        Hlc::from_str(&s).map_err(serde::de::Error::custom)
    }
}

fn to_base36(mut n: u64, width: usize) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = vec![b'0'; width];
    let mut i = width;
    while n > 0 && i > 0 {
        i -= 1;
        out[i] = DIGITS[(n % 36) as usize];
        n /= 36;
    }
    debug_assert!(n == 0, "clock component does not fit in {} digits", width);
    // Safe: DIGITS is all ASCII.
    String::from_utf8(out).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_round_trip() {
        let clock = Hlc { pt: 1_700_000_000_123, lt: 42 };
        let encoded = clock.encode();
        assert_eq!(encoded.parse::<Hlc>().unwrap(), clock);
        // The round trip must preserve the exact string, too.
        assert_eq!(encoded.parse::<Hlc>().unwrap().encode(), encoded);
    }

    #[test]
    fn test_encoding_sorts_like_tuples() {
        let clocks = [
            Hlc { pt: 0, lt: 0 },
            Hlc { pt: 0, lt: 1 },
            Hlc { pt: 0, lt: 37 },
            Hlc { pt: 1, lt: 0 },
            Hlc { pt: 35, lt: 0 },
            Hlc { pt: 36, lt: 0 },
            Hlc { pt: 1_700_000_000_000, lt: 0 },
            Hlc { pt: 1_700_000_000_000, lt: 1 },
            Hlc { pt: 1_700_000_000_001, lt: 0 },
        ];
        for pair in clocks.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(
                pair[0].encode() < pair[1].encode(),
                "encoding broke ordering: {} vs {}",
                pair[0].encode(),
                pair[1].encode()
            );
        }
    }

    #[test]
    fn test_send_monotone() {
        let c0 = Hlc { pt: 100, lt: 0 };
        // Wall clock went backwards: logical counter takes over.
        let c1 = c0.send_at(50);
        assert_eq!(c1, Hlc { pt: 100, lt: 1 });
        // Wall clock advanced: counter resets.
        let c2 = c1.send_at(101);
        assert_eq!(c2, Hlc { pt: 101, lt: 0 });
        assert!(c0 < c1 && c1 < c2);
    }

    #[test]
    fn test_receive_dominates_both() {
        let local = Hlc { pt: 100, lt: 3 };
        let msg = Hlc { pt: 100, lt: 7 };
        let merged = local.receive_at(msg, 99);
        assert_eq!(merged, Hlc { pt: 100, lt: 8 });
        assert!(merged > local && merged > msg);

        let ahead = Hlc { pt: 200, lt: 5 };
        let merged = local.receive_at(ahead, 99);
        assert_eq!(merged, Hlc { pt: 200, lt: 6 });

        // A wall clock ahead of both resets the counter.
        let merged = local.receive_at(msg, 500);
        assert_eq!(merged, Hlc { pt: 500, lt: 0 });
    }
}
