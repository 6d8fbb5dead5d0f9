//! Handle-map bootstrap for hosts without numeric descriptor inheritance
//!
//! When the process-creation API only passes opaque handle tokens plus the
//! three standard I/O slots, the child cannot tell which inherited token is
//! channel 3, 4 or 5. The parent serializes a map `idx:0xHEX;idx:0xHEX` and
//! ships it out of band, through the `__ARIA_FD_MAP` environment variable
//! (default) or the `--aria-fd-map=<map>` command-line flag. The flag form
//! is stripped before user code sees argv.
//!
//! Channels 0..2 always travel through the platform's standard startup
//! fields and never appear in the map.

use crate::stream::{ChannelIndex, PipeSet};
use std::collections::BTreeMap;
use std::os::fd::RawFd;

/// Environment variable carrying the serialized map.
pub const HANDLE_MAP_ENV: &str = "__ARIA_FD_MAP";

/// Command-line flag prefix carrying the serialized map.
pub const HANDLE_MAP_FLAG: &str = "--aria-fd-map=";

/// Channel indices eligible for the map.
const MAPPED_CHANNELS: [u8; 3] = [3, 4, 5];

/// Serialized dictionary mapping channel indices 3..5 to opaque handle
/// tokens. An empty map is valid: the child then runs with channels 0..2
/// only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleMap {
    entries: BTreeMap<u8, u64>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the child-side tokens of channels 3..5 from a pipe set.
    pub fn from_pipe_set(pipes: &PipeSet) -> Self {
        let mut map = Self::new();
        for idx in MAPPED_CHANNELS {
            if let Some(channel) = ChannelIndex::from_index(idx) {
                if let Some(token) = pipes.child_token(channel) {
                    map.insert(idx, token);
                }
            }
        }
        map
    }

    /// Insert a token. Indices outside {3,4,5} are ignored.
    pub fn insert(&mut self, index: u8, token: u64) {
        if MAPPED_CHANNELS.contains(&index) {
            self.entries.insert(index, token);
        }
    }

    pub fn get(&self, index: u8) -> Option<u64> {
        self.entries.get(&index).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, u64)> + '_ {
        self.entries.iter().map(|(&k, &v)| (k, v))
    }

    /// Serialize as `idx:0xHEX;idx:0xHEX;...` with uppercase hex digits.
    pub fn serialize(&self) -> String {
        self.entries
            .iter()
            .map(|(idx, token)| format!("{}:0x{:X}", idx, token))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Parse a serialized map. Unknown indices and malformed entries are
    /// skipped silently; garbage input yields an empty map, not an error.
    pub fn parse(input: &str) -> Self {
        let mut map = Self::new();

        for entry in input.split(';') {
            let Some((index_str, value_str)) = entry.split_once(':') else {
                continue;
            };
            let Ok(index) = index_str.trim().parse::<u8>() else {
                continue;
            };
            if !MAPPED_CHANNELS.contains(&index) {
                continue;
            }
            let value_str = value_str.trim();
            let Some(hex) = value_str
                .strip_prefix("0x")
                .or_else(|| value_str.strip_prefix("0X"))
            else {
                continue;
            };
            let Ok(token) = u64::from_str_radix(hex, 16) else {
                continue;
            };
            map.entries.insert(index, token);
        }

        map
    }

    /// Read the map from the environment, if set.
    pub fn from_env() -> Option<Self> {
        std::env::var(HANDLE_MAP_ENV).ok().map(|v| Self::parse(&v))
    }

    /// Extract the map from an argument vector, removing the flag so user
    /// code never observes it.
    pub fn take_from_args(args: &mut Vec<String>) -> Option<Self> {
        let pos = args.iter().position(|a| a.starts_with(HANDLE_MAP_FLAG))?;
        let arg = args.remove(pos);
        Some(Self::parse(&arg[HANDLE_MAP_FLAG.len()..]))
    }

    /// Consumer entry point: environment first, then the command line. The
    /// flag is stripped from `args` whether or not the environment wins.
    pub fn discover(args: &mut Vec<String>) -> Self {
        let from_args = Self::take_from_args(args);
        if let Some(map) = Self::from_env() {
            if !map.is_empty() {
                return map;
            }
        }
        from_args.unwrap_or_default()
    }

    /// Drop entries whose token does not name a live descriptor on this
    /// host. The liveness query is `fcntl(F_GETFD)`.
    pub fn validated(&self) -> Self {
        let mut map = Self::new();
        for (idx, token) in self.iter() {
            if handle_is_live(token) {
                map.insert(idx, token);
            }
        }
        map
    }

    /// Descriptor a channel was published on, for channels 3..5.
    pub fn channel_fd(&self, channel: ChannelIndex) -> Option<RawFd> {
        self.get(channel.as_index() as u8).map(|t| t as RawFd)
    }

    /// The exact set of tokens a parent should whitelist for inheritance:
    /// the three standard slots plus every mapped token. Nothing else may
    /// leak into the child.
    pub fn inheritance_whitelist(&self, stdio_tokens: [u64; 3]) -> Vec<u64> {
        let mut list = stdio_tokens.to_vec();
        list.extend(self.entries.values().copied());
        list
    }
}

fn handle_is_live(token: u64) -> bool {
    use nix::fcntl::{fcntl, FcntlArg};
    let fd = token as RawFd;
    if fd < 0 {
        return false;
    }
    fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_well_formed() {
        let map = HandleMap::parse("3:0x1A4;4:0x1B8;5:0x2C0");
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(3), Some(0x1A4));
        assert_eq!(map.get(4), Some(0x1B8));
        assert_eq!(map.get(5), Some(0x2C0));
    }

    #[test]
    fn test_parse_garbage_yields_empty_map() {
        assert!(HandleMap::parse("garbage").is_empty());
        assert!(HandleMap::parse("").is_empty());
        assert!(HandleMap::parse(";;;").is_empty());
    }

    #[test]
    fn test_parse_skips_malformed_entries() {
        let map = HandleMap::parse("3:0x10;nonsense;4:NOTHEX;5:0x20");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(3), Some(0x10));
        assert_eq!(map.get(5), Some(0x20));
        assert_eq!(map.get(4), None);
    }

    #[test]
    fn test_parse_skips_unknown_indices() {
        let map = HandleMap::parse("1:0x10;2:0x20;6:0x30;3:0x40");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(3), Some(0x40));
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let mut map = HandleMap::new();
        map.insert(3, 0x1A4);
        map.insert(4, 0x1B8);
        map.insert(5, 0x2C0);

        let serialized = map.serialize();
        assert_eq!(serialized, "3:0x1A4;4:0x1B8;5:0x2C0");
        assert_eq!(HandleMap::parse(&serialized), map);
    }

    #[test]
    fn test_insert_ignores_standard_channels() {
        let mut map = HandleMap::new();
        map.insert(0, 0x1);
        map.insert(2, 0x2);
        map.insert(6, 0x3);
        assert!(map.is_empty());
    }

    #[test]
    fn test_take_from_args_strips_flag() {
        let mut args = vec![
            "child".to_string(),
            "--aria-fd-map=3:0x10;5:0x20".to_string(),
            "--verbose".to_string(),
        ];
        let map = HandleMap::take_from_args(&mut args).expect("map");
        assert_eq!(map.len(), 2);
        assert_eq!(args, vec!["child".to_string(), "--verbose".to_string()]);
    }

    #[test]
    fn test_take_from_args_without_flag() {
        let mut args = vec!["child".to_string()];
        assert!(HandleMap::take_from_args(&mut args).is_none());
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_validated_keeps_live_descriptors() {
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        let mut map = HandleMap::new();
        map.insert(3, std::os::fd::AsRawFd::as_raw_fd(&r) as u64);
        map.insert(4, 0xFFFF_FF00); // certainly not a live descriptor
        let live = map.validated();
        assert_eq!(live.len(), 1);
        assert!(live.get(3).is_some());
    }

    #[test]
    fn test_from_pipe_set_collects_aux_tokens() {
        let pipes = PipeSet::create().expect("pipe creation");
        let map = HandleMap::from_pipe_set(&pipes);
        assert_eq!(map.len(), 3);
        // The tokens name live descriptors while the set is open
        assert_eq!(map.validated(), map);
    }

    #[test]
    fn test_inheritance_whitelist() {
        let mut map = HandleMap::new();
        map.insert(3, 0x30);
        map.insert(5, 0x50);
        let list = map.inheritance_whitelist([0x1, 0x2, 0x3]);
        assert_eq!(list.len(), 5);
        assert!(list.contains(&0x30));
        assert!(list.contains(&0x50));
    }
}
