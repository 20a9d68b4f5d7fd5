use crate::transfer::{Error, Result};
use derive_more::Display;
use log::trace;
use std::net::IpAddr;

/// The access level of an ip range.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum IpAccess {
    #[display("allowed")]
    Allowed,
    #[display("blocked")]
    Blocked,
}

#[derive(Debug, Clone, PartialEq)]
struct IpRule {
    first: IpAddr,
    last: IpAddr,
    access: IpAccess,
}

impl IpRule {
    fn matches(&self, ip: &IpAddr) -> bool {
        self.first <= *ip && *ip <= self.last
    }
}

/// The session-wide ip filter which decides which peer addresses are blocked.
///
/// Rules are evaluated in order and the last matching rule wins.
/// Addresses which don't match any rule are allowed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IpFilter {
    rules: Vec<IpRule>,
}

impl IpFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new access rule for the inclusive range `first..=last`.
    ///
    /// # Returns
    ///
    /// It returns [Error::InvalidRange] when the range is reversed or mixes ipv4 with ipv6 addresses.
    pub fn add_rule(&mut self, first: IpAddr, last: IpAddr, access: IpAccess) -> Result<()> {
        if first.is_ipv4() != last.is_ipv4() || first > last {
            return Err(Error::InvalidRange(first, last));
        }

        trace!("Ip filter is adding rule {} - {} ({})", first, last, access);
        self.rules.push(IpRule {
            first,
            last,
            access,
        });
        Ok(())
    }

    /// Get the access of the given address.
    pub fn access(&self, ip: &IpAddr) -> IpAccess {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.matches(ip))
            .map(|rule| rule.access)
            .unwrap_or(IpAccess::Allowed)
    }

    /// Check if the given address is blocked.
    pub fn blocked(&self, ip: &IpAddr) -> bool {
        self.access(ip) == IpAccess::Blocked
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
