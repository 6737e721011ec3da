//! [`RouteAddr`] – a path through nested buses.
//!
//! Byte `i` is the slot to take at hop `i`. Every bus on the way consumes the
//! first byte and forwards the rest, so an empty chain means "deliver here".
//! Events travel the other way and grow a chain instead: every slot they pass
//! on the way up is prepended.

use std::fmt;
use std::ops::Deref;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RouteAddr(Vec<u8>);

impl RouteAddr {
    /// The empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a chain from individual hops.
    pub fn with(addrs: &[u8]) -> Self {
        Self(addrs.to_vec())
    }

    /// A new chain with `addrs` in front of this one.
    pub fn prefix(&self, addrs: &[u8]) -> Self {
        let mut chain = Vec::with_capacity(addrs.len() + self.0.len());
        chain.extend_from_slice(addrs);
        chain.extend_from_slice(&self.0);
        Self(chain)
    }

    /// A new chain with `addr` appended as the last hop.
    pub fn join(&self, addr: u8) -> Self {
        let mut chain = self.0.clone();
        chain.push(addr);
        Self(chain)
    }

    pub fn push_front(&mut self, addr: u8) {
        self.0.insert(0, addr);
    }

    /// Consume the first hop.
    pub fn pop_front(&mut self) -> Option<u8> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.remove(0))
        }
    }

    pub fn first(&self) -> Option<u8> {
        self.0.first().copied()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for RouteAddr {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for RouteAddr {
    fn from(addrs: Vec<u8>) -> Self {
        Self(addrs)
    }
}

impl From<&[u8]> for RouteAddr {
    fn from(addrs: &[u8]) -> Self {
        Self::with(addrs)
    }
}

impl<const N: usize> From<[u8; N]> for RouteAddr {
    fn from(addrs: [u8; N]) -> Self {
        Self(addrs.to_vec())
    }
}

impl From<&RouteAddr> for RouteAddr {
    fn from(addrs: &RouteAddr) -> Self {
        addrs.clone()
    }
}

impl fmt::Display for RouteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, addr) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{addr}")?;
        }
        write!(f, "]")
    }
}
