//! Participant registry — who has joined this coordinator, in join order.

/// Ordered, duplicate-free set of participant addresses.
///
/// Grows only through Join. There is no leave protocol, so entries are never
/// removed.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    addrs: Vec<String>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `addr` if absent. Returns true when it was newly registered.
    pub fn register(&mut self, addr: &str) -> bool {
        if self.contains(addr) {
            return false;
        }
        self.addrs.push(addr.to_string());
        true
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.addrs.iter().any(|a| a == addr)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn addresses(&self) -> &[String] {
        &self.addrs
    }
}
