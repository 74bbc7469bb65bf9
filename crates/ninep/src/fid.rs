//! Per-session FID bookkeeping.
//!
//! This module owns only the bookkeeping a 9P server must do for every FID
//! regardless of backing store (existence, uniqueness, the open-once rule);
//! the actual host operations live behind the `Filesystem` trait in `srv`.

use std::collections::HashMap;

use crate::error::Error;
use crate::fcall::QId;
use crate::utils::Result;

/// State attached to one client-visible FID.
///
/// `aux` is a handler-owned slot (typically a cached open file handle) so a
/// `Filesystem` implementation can avoid reopening the backing file on every
/// read/write.
#[derive(Debug)]
pub struct Fid<H> {
    pub fid: u32,
    pub path: String,
    pub qid: QId,
    pub open_mode: Option<u8>,
    pub aux: H,
}

impl<H: Default> Fid<H> {
    fn new(fid: u32, path: String, qid: QId) -> Self {
        Fid {
            fid,
            path,
            qid,
            open_mode: None,
            aux: H::default(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open_mode.is_some()
    }
}

/// The FID table for one session: a `HashMap` plus the existence/uniqueness
/// rules every 9P request must obey before reaching a `Filesystem` method.
#[derive(Debug, Default)]
pub struct FidTable<H> {
    fids: HashMap<u32, Fid<H>>,
}

impl<H: Default> FidTable<H> {
    pub fn new() -> Self {
        FidTable {
            fids: HashMap::new(),
        }
    }

    pub fn get(&self, fid: u32) -> Result<&Fid<H>> {
        self.fids
            .get(&fid)
            .ok_or_else(|| Error::path(format!("unknown fid {fid}")))
    }

    pub fn get_mut(&mut self, fid: u32) -> Result<&mut Fid<H>> {
        self.fids
            .get_mut(&fid)
            .ok_or_else(|| Error::path(format!("unknown fid {fid}")))
    }

    /// Insert a freshly attached/walked/created FID, refusing to clobber one
    /// already in use.
    pub fn insert(&mut self, fid: u32, path: String, qid: QId) -> Result<()> {
        if self.fids.contains_key(&fid) {
            return Err(Error::path(format!("fid {fid} already in use")));
        }
        self.fids.insert(fid, Fid::new(fid, path, qid));
        Ok(())
    }

    pub fn remove(&mut self, fid: u32) -> Result<Fid<H>> {
        self.fids
            .remove(&fid)
            .ok_or_else(|| Error::path(format!("unknown fid {fid}")))
    }

    pub fn contains(&self, fid: u32) -> bool {
        self.fids.contains_key(&fid)
    }
}
