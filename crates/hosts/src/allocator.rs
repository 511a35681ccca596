//! External port and service name allocation.
//!
//! Nothing is reserved ahead of time: a port is free when no stored record's
//! `public_url` mentions it. Two concurrent callers can pick the same port;
//! the orchestrator then rejects the second bind and the caller retries with
//! a fresh allocation.

use std::collections::BTreeSet;

use {
    codehost_config::PortRange,
    rand::{Rng, distr::Alphanumeric},
};

use crate::{Error, Result, record::HostRecord};

const MAX_NAME_LEN: usize = 63;
const PASSWORD_LEN: usize = 16;

/// Draws distinct free ports from a fixed range by rejection sampling.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    in_use: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(range: PortRange, in_use: BTreeSet<u16>) -> Self {
        Self { range, in_use }
    }

    /// Allocator seeded with the ports of every record in `records`.
    pub fn from_records<'a>(
        range: PortRange,
        records: impl IntoIterator<Item = &'a HostRecord>,
    ) -> Self {
        Self::new(range, ports_in_use(records))
    }

    /// Return `n` distinct ports, none already in use.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<u16>> {
        let free = self
            .range
            .len()
            .saturating_sub(self.in_use.iter().filter(|p| self.range.contains(**p)).count());
        if n > free {
            return Err(Error::PortsExhausted {
                start: self.range.start,
                end: self.range.end,
            });
        }

        let mut rng = rand::rng();
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let candidate = rng.random_range(self.range.start..=self.range.end);
            if self.in_use.insert(candidate) {
                out.push(candidate);
            }
        }
        Ok(out)
    }
}

/// Ports parsed out of the `public_url` of each record.
pub fn ports_in_use<'a>(records: impl IntoIterator<Item = &'a HostRecord>) -> BTreeSet<u16> {
    records
        .into_iter()
        .filter_map(HostRecord::public_port)
        .collect()
}

/// Service name for a username: lowercase ASCII, runs of anything else
/// collapsed to one hyphen, trimmed, at most 63 characters.
pub fn slugify(username: &str) -> Result<String> {
    let mut out = String::with_capacity(username.len());
    let mut last_dash = false;
    for ch in username.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let mut out = out.trim_matches('-').to_string();
    out.truncate(MAX_NAME_LEN);
    let out = out.trim_end_matches('-').to_string();
    if out.is_empty() {
        return Err(Error::InvalidUsername {
            username: username.to_string(),
        });
    }
    Ok(out)
}

/// Random alphanumeric credential for a new host.
pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}
