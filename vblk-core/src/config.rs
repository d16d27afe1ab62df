// Copyright (c) 2024 The vblk Authors.
//
// vblk is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the
// Mulan PSL v2. You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! The configuration record `Context::open` consumes (spec.md §4.8, §6).
//!
//! The full option grammar is an external collaborator's job in a real
//! device model (spec.md §1); `from_option_string` below implements just
//! the grammar spec.md §6 documents, as a convenience for callers who do
//! have a plain option string, not as the general config subsystem.

use crate::error::BlockError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    ThreadPool,
    Ring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteZeroesMode {
    Off,
    On,
    Unmap,
}

#[derive(Debug, Clone, Copy)]
pub struct DiscardLimits {
    pub max_sectors: u64,
    pub max_segments: usize,
    pub alignment_sectors: u64,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub path: String,
    /// `false` means write-through: every successful write is followed by
    /// a data-sync (spec.md §4.4, §4.5).
    pub write_cache: bool,
    pub read_only: bool,
    pub bypass_host_cache: bool,
    pub ordering_gate: bool,
    pub discard: Option<DiscardLimits>,
    pub logical_sector_size: Option<u32>,
    pub physical_sector_size: Option<u32>,
    pub sub_range_sectors: Option<(u64, u64)>,
    pub engine: EngineKind,
    pub queues: usize,
    pub workers_per_queue: usize,
    pub write_zeroes: WriteZeroesMode,
    /// Guest-visible throttling knobs a frontend may apply above the core;
    /// the core itself never reads these (see SPEC_FULL.md §2).
    pub iops_limit: Option<u64>,
    pub bps_limit: Option<u64>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            path: String::new(),
            write_cache: true,
            read_only: false,
            bypass_host_cache: false,
            ordering_gate: true,
            discard: None,
            logical_sector_size: None,
            physical_sector_size: None,
            sub_range_sectors: None,
            engine: EngineKind::ThreadPool,
            queues: 1,
            workers_per_queue: 8,
            write_zeroes: WriteZeroesMode::Off,
            iops_limit: None,
            bps_limit: None,
        }
    }
}

impl BackendConfig {
    /// Parse the comma-separated option string of spec.md §6. The first
    /// token is the path; unknown tokens fail the parse.
    pub fn from_option_string(s: &str) -> Result<Self, BlockError> {
        let mut tokens = s.split(',');
        let path = tokens
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| BlockError::InvalidArg("missing backing path".into()))?;

        let mut cfg = BackendConfig {
            path: path.to_string(),
            ..Default::default()
        };
        // Gate defaults to enabled only for the thread-pool engine
        // (spec.md §4.2); flip it off if a later token selects the ring
        // engine.
        for tok in tokens {
            if tok.is_empty() {
                continue;
            }
            match tok {
                "writeback" => cfg.write_cache = true,
                "writethru" => cfg.write_cache = false,
                "ro" => cfg.read_only = true,
                "nocache" => cfg.bypass_host_cache = true,
                "no_bst_block" => cfg.ordering_gate = false,
                _ if tok.starts_with("discard=") => {
                    cfg.discard = Some(parse_discard(&tok["discard=".len()..])?);
                }
                _ if tok.starts_with("sectorsize=") => {
                    let (l, p) = parse_sector_size(&tok["sectorsize=".len()..])?;
                    cfg.logical_sector_size = Some(l);
                    cfg.physical_sector_size = p.or(Some(l));
                }
                _ if tok.starts_with("range=") => {
                    cfg.sub_range_sectors = Some(parse_range(&tok["range=".len()..])?);
                }
                _ if tok.starts_with("aio=") => {
                    cfg.engine = match &tok["aio=".len()..] {
                        s if *s == "threads" => EngineKind::ThreadPool,
                        s if *s == "io_uring" => EngineKind::Ring,
                        other => {
                            return Err(BlockError::InvalidArg(format!(
                                "unknown aio engine '{other}'"
                            )))
                        }
                    };
                }
                other => {
                    return Err(BlockError::InvalidArg(format!(
                        "unrecognised option '{other}'"
                    )))
                }
            }
        }
        if cfg.engine == EngineKind::Ring {
            cfg.ordering_gate = false;
        }
        Ok(cfg)
    }
}

fn parse_discard(spec: &str) -> Result<DiscardLimits, BlockError> {
    let mut parts = spec.split(':');
    let bad = || BlockError::InvalidArg(format!("malformed discard option '{spec}'"));
    let max_sectors: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let max_segments: usize = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let alignment_sectors: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok(DiscardLimits {
        max_sectors,
        max_segments,
        alignment_sectors,
    })
}

fn parse_sector_size(spec: &str) -> Result<(u32, Option<u32>), BlockError> {
    let bad = || BlockError::InvalidArg(format!("malformed sectorsize option '{spec}'"));
    let mut parts = spec.split('/');
    let logical: u32 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let physical = match parts.next() {
        Some(p) => Some(p.parse().map_err(|_| bad())?),
        None => None,
    };
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok((logical, physical))
}

fn parse_range(spec: &str) -> Result<(u64, u64), BlockError> {
    let bad = || BlockError::InvalidArg(format!("malformed range option '{spec}'"));
    let mut parts = spec.split('/');
    let start: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let len: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok((start, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_path_only() {
        let cfg = BackendConfig::from_option_string("/tmp/disk.img").unwrap();
        assert_eq!(cfg.path, "/tmp/disk.img");
        assert!(cfg.write_cache);
        assert!(!cfg.read_only);
    }

    #[test]
    fn parses_full_option_set() {
        let cfg = BackendConfig::from_option_string(
            "/tmp/disk.img,ro,nocache,discard=1024:16:8,sectorsize=512/4096,range=2048/4096,aio=io_uring",
        )
        .unwrap();
        assert!(cfg.read_only);
        assert!(cfg.bypass_host_cache);
        assert_eq!(cfg.engine, EngineKind::Ring);
        assert!(!cfg.ordering_gate);
        let d = cfg.discard.unwrap();
        assert_eq!(d.max_sectors, 1024);
        assert_eq!(d.max_segments, 16);
        assert_eq!(d.alignment_sectors, 8);
        assert_eq!(cfg.logical_sector_size, Some(512));
        assert_eq!(cfg.physical_sector_size, Some(4096));
        assert_eq!(cfg.sub_range_sectors, Some((2048, 4096)));
    }

    #[test]
    fn rejects_unknown_token() {
        assert!(BackendConfig::from_option_string("/tmp/disk.img,bogus").is_err());
    }

    #[test]
    fn missing_path_is_rejected() {
        assert!(BackendConfig::from_option_string("").is_err());
    }
}
