use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;
use thiserror::Error;

static MAC_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^[0-9a-fA-F]{2}(:[0-9a-fA-F]{2}){5}$").expect("MAC format regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

#[derive(Debug, Error)]
#[error("'{}' is not a valid MAC address!", .0)]
pub struct MacParseError(String);

impl MacAddress {
    /// Random locally administered unicast address.
    pub fn generate() -> Self {
        let mut octets = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut octets);

        octets[0] = (octets[0] & 0xfc) | 0x02;

        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;

        f.write_fmt(format_args!(
            "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}"
        ))
    }
}

impl FromStr for MacAddress {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !MAC_FORMAT.is_match(s) {
            return Err(MacParseError(s.to_owned()));
        }

        let mut octets = [0u8; 6];
        for (octet, raw) in octets.iter_mut().zip(s.split(':')) {
            *octet = u8::from_str_radix(raw, 16).map_err(|_| MacParseError(s.to_owned()))?;
        }

        Ok(Self(octets))
    }
}
