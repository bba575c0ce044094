//! Capability bitset
//!
//! Every block carries a capability set authorizing classes of effects.
//! A primitive whose capability bit is absent crashes the block with
//! `"capability denied: <NAME>"`; the names here are the stable uppercase
//! strings those diagnostics use.

use bitflags::bitflags;

bitflags! {
    /// Effect authorizations for a block
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapSet: u32 {
        /// Create child blocks
        const SPAWN = 1 << 0;
        /// Enqueue messages
        const SEND = 1 << 1;
        /// Dequeue messages
        const RECEIVE = 1 << 2;
        /// Call inference primitives
        const INFER = 1 << 3;
        /// HTTP client
        const HTTP = 1 << 4;
        /// Read files
        const FILE_READ = 1 << 5;
        /// Write files
        const FILE_WRITE = 1 << 6;
        /// Database primitives
        const DB = 1 << 7;
        /// Raw memory primitives
        const MEMORY = 1 << 8;
        /// Establish links
        const LINK = 1 << 9;
        /// Shell interpreter
        const SHELL = 1 << 10;
        /// Exec a binary
        const EXEC = 1 << 11;
        /// Receive exit messages instead of dying
        const TRAP_EXIT = 1 << 12;
        /// Establish monitors
        const MONITOR = 1 << 13;
        /// Act as supervisor
        const SUPERVISE = 1 << 14;
        /// Read environment
        const ENV = 1 << 15;
        /// WebSocket I/O
        const WEBSOCKET = 1 << 16;

        /// Every defined bit plus room for extensions (bits 0..30)
        const ALL = 0x7FFF_FFFF;
    }
}

/// (bit, name) table in bit order; drives both `name` and diagnostics
const NAMES: &[(CapSet, &str)] = &[
    (CapSet::SPAWN, "SPAWN"),
    (CapSet::SEND, "SEND"),
    (CapSet::RECEIVE, "RECEIVE"),
    (CapSet::INFER, "INFER"),
    (CapSet::HTTP, "HTTP"),
    (CapSet::FILE_READ, "FILE_READ"),
    (CapSet::FILE_WRITE, "FILE_WRITE"),
    (CapSet::DB, "DB"),
    (CapSet::MEMORY, "MEMORY"),
    (CapSet::LINK, "LINK"),
    (CapSet::SHELL, "SHELL"),
    (CapSet::EXEC, "EXEC"),
    (CapSet::TRAP_EXIT, "TRAP_EXIT"),
    (CapSet::MONITOR, "MONITOR"),
    (CapSet::SUPERVISE, "SUPERVISE"),
    (CapSet::ENV, "ENV"),
    (CapSet::WEBSOCKET, "WEBSOCKET"),
];

impl CapSet {
    /// Stable textual name: `NONE` and `ALL` for the extremes, the
    /// uppercase bit name for a single capability, a `|`-joined list
    /// otherwise.
    pub fn name(self) -> String {
        if self.is_empty() {
            return "NONE".to_string();
        }
        if self == CapSet::ALL {
            return "ALL".to_string();
        }
        let parts: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|&(_, name)| name)
            .collect();
        if parts.is_empty() {
            // Extension bits with no name yet
            return format!("{:#x}", self.bits());
        }
        parts.join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_and_all_names() {
        assert_eq!(CapSet::empty().name(), "NONE");
        assert_eq!(CapSet::ALL.name(), "ALL");
    }

    #[test]
    fn test_single_names() {
        assert_eq!(CapSet::SPAWN.name(), "SPAWN");
        assert_eq!(CapSet::FILE_READ.name(), "FILE_READ");
        assert_eq!(CapSet::TRAP_EXIT.name(), "TRAP_EXIT");
    }

    #[test]
    fn test_joined_names() {
        assert_eq!((CapSet::SPAWN | CapSet::SEND).name(), "SPAWN|SEND");
    }

    #[test]
    fn test_bit_positions_are_stable() {
        assert_eq!(CapSet::SPAWN.bits(), 1);
        assert_eq!(CapSet::SEND.bits(), 1 << 1);
        assert_eq!(CapSet::TRAP_EXIT.bits(), 1 << 12);
        assert_eq!(CapSet::WEBSOCKET.bits(), 1 << 16);
    }

    #[test]
    fn test_all_contains_every_named_bit() {
        for (bit, _) in NAMES {
            assert!(CapSet::ALL.contains(*bit));
        }
    }
}
