//! 9P2000 message types and wire constants.
//!
//! This is plain 9P2000 (Plan 9's original protocol), not the Linux-specific
//! 9P2000.L extension: `open`/`create`/`stat`/`wstat` instead of
//! `lopen`/`lcreate`/`getattr`/`setattr`, and errors carry a string
//! (`Rerror.ename`) instead of a numeric `ecode`.

use std::mem::size_of;

use bitflags::bitflags;
use enum_primitive::enum_from_primitive;

use crate::serialize::Data;

/// Version string this server understands.
pub const P92000: &str = "9P2000";

/// Version string sent back when the client proposes something else.
pub const VERSION_UNKNOWN: &str = "unknown";

/// Reserved tag value meaning "no tag" (used only by `Tversion`, which
/// predates tag matching).
pub const NOTAG: u16 = !0;

/// Reserved FID value meaning "no FID" (`Tattach.afid` when no auth is used).
pub const NOFID: u32 = !0;

/// Size of the fixed fields common to `Tread`/`Rread`/`Twrite`, used to
/// compute `iounit` (`size[4] + type[1] + tag[2] + fid[4] + offset[8] + count[4]`).
pub const IOHDRSZ: u32 = 23;

/// The IANA-assigned 9P port.
pub const V9FS_PORT: u16 = 564;

/// Bits in `Topen`/`Tcreate` mode.
pub mod om {
    pub const READ: u8 = 0;
    pub const WRITE: u8 = 1;
    pub const RDWR: u8 = 2;
    pub const EXEC: u8 = 3;
    /// Mask for the READ/WRITE/RDWR/EXEC bits.
    pub const MODE_MASK: u8 = 0x03;
    pub const TRUNC: u8 = 0x10;
    pub const CEXEC: u8 = 0x20;
    pub const RCLOSE: u8 = 0x40;
    pub const APPEND: u8 = 0x80;
}

/// Bits in `Stat.mode` / `Tcreate.perm` beyond the low 9 permission bits.
pub mod dm {
    pub const DIR: u32 = 0x8000_0000;
    pub const APPEND: u32 = 0x4000_0000;
    pub const EXCL: u32 = 0x2000_0000;
    pub const MOUNT: u32 = 0x1000_0000;
    pub const AUTH: u32 = 0x0800_0000;
    pub const TMP: u32 = 0x0400_0000;
    /// 9P2000.u extension bit, reused here per the Tcreate symlink design note.
    pub const SYMLINK: u32 = 0x0200_0000;
    pub const PERM_MASK: u32 = 0o777;
}

bitflags! {
    /// Bits in `QId.typ`. Constructible from `std::fs::FileType`.
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QIdType: u8 {
        const DIR     = 0x80;
        const APPEND  = 0x40;
        const EXCL    = 0x20;
        const MOUNT   = 0x10;
        const AUTH    = 0x08;
        const TMP     = 0x04;
        const SYMLINK = 0x02;
        const LINK    = 0x01;
        const FILE    = 0x00;
    }
}

impl From<std::fs::FileType> for QIdType {
    fn from(typ: std::fs::FileType) -> Self {
        From::from(&typ)
    }
}

impl<'a> From<&'a std::fs::FileType> for QIdType {
    fn from(typ: &'a std::fs::FileType) -> Self {
        let mut qid_type = QIdType::FILE;
        if typ.is_dir() {
            qid_type.insert(QIdType::DIR);
        }
        if typ.is_symlink() {
            qid_type.insert(QIdType::SYMLINK);
        }
        qid_type
    }
}

/// The server's identity token for a file: stable across renames, equal
/// for two names resolving to the same host file.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct QId {
    pub typ: QIdType,
    pub version: u32,
    pub path: u64,
}

impl QId {
    pub fn size(&self) -> u32 {
        (size_of::<u8>() + size_of::<u32>() + size_of::<u64>()) as u32
    }
}

/// Metadata record carried on the wire by `Rstat`/`Twstat`/directory reads.
///
/// The mutable fields are `Option` so that a `Twstat`'s "don't change"
/// sentinels (all-ones integers, empty strings) round-trip as `None` rather
/// than as magic numbers; `Encodable`/`Decodable` convert at the boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    pub qid: QId,
    pub mode: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
    pub length: Option<u64>,
    pub name: Option<String>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub muid: Option<String>,
}

impl Stat {
    /// Bytes written by `Encodable`, excluding the record's own leading
    /// size field (this is the value stored in that leading field).
    pub fn body_len(&self) -> u16 {
        let strings = self.name.as_deref().unwrap_or("").len()
            + self.uid.as_deref().unwrap_or("").len()
            + self.gid.as_deref().unwrap_or("").len()
            + self.muid.as_deref().unwrap_or("").len();
        // type[2] + dev[4] + qid[13] + mode[4] + atime[4] + mtime[4] + length[8]
        // + 4 string length prefixes[2 each]
        (2 + 4 + self.qid.size() as usize + 4 + 4 + 4 + 8 + 4 * 2 + strings) as u16
    }

    /// Total bytes a self-contained `encode` call writes, leading size field
    /// included. This is the `slen`/`sizeof_stat` used for directory paging.
    pub fn packed_len(&self) -> u16 {
        self.body_len() + 2
    }
}

enum_from_primitive! {
    /// 9P2000 message type tags.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TVersion = 100,
        RVersion = 101,
        TAuth    = 102,
        RAuth    = 103,
        TAttach  = 104,
        RAttach  = 105,
        // Illegal on the wire; never sent, kept for completeness of the
        // numbering.
        TError   = 106,
        RError   = 107,
        TFlush   = 108,
        RFlush   = 109,
        TWalk    = 110,
        RWalk    = 111,
        TOpen    = 112,
        ROpen    = 113,
        TCreate  = 114,
        RCreate  = 115,
        TRead    = 116,
        RRead    = 117,
        TWrite   = 118,
        RWrite   = 119,
        TClunk   = 120,
        RClunk   = 121,
        TRemove  = 122,
        RRemove  = 123,
        TStat    = 124,
        RStat    = 125,
        TWStat   = 126,
        RWStat   = 127,
    }
}

/// Envelope for one 9P2000 message.
#[derive(Clone, Debug)]
pub struct Msg {
    pub tag: u16,
    pub body: FCall,
}

/// The various 9P2000 request/reply bodies.
#[derive(Clone, Debug)]
pub enum FCall {
    RError { ename: String },

    TVersion { msize: u32, version: String },
    RVersion { msize: u32, version: String },

    TAuth { afid: u32, uname: String, aname: String },
    RAuth { aqid: QId },

    TFlush { oldtag: u16 },
    RFlush,

    TAttach { fid: u32, afid: u32, uname: String, aname: String },
    RAttach { qid: QId },

    TWalk { fid: u32, newfid: u32, wnames: Vec<String> },
    RWalk { wqids: Vec<QId> },

    TOpen { fid: u32, mode: u8 },
    ROpen { qid: QId, iounit: u32 },

    /// `extension` carries a symlink target when `perm & dm::SYMLINK` is
    /// set (this server's one deliberate borrowing from 9P2000.u: a single
    /// extra string field, always present but empty when unused, rather
    /// than the rest of the `.u` protocol). See the symlink-creation design
    /// note for the rationale.
    TCreate { fid: u32, name: String, perm: u32, mode: u8, extension: String },
    RCreate { qid: QId, iounit: u32 },

    TRead { fid: u32, offset: u64, count: u32 },
    RRead { data: Data },

    TWrite { fid: u32, offset: u64, data: Data },
    RWrite { count: u32 },

    TClunk { fid: u32 },
    RClunk,

    TRemove { fid: u32 },
    RRemove,

    TStat { fid: u32 },
    RStat { stat: Stat },

    TWStat { fid: u32, stat: Stat },
    RWStat,
}

impl FCall {
    pub fn msg_type(&self) -> MsgType {
        match *self {
            FCall::RError { .. } => MsgType::RError,
            FCall::TVersion { .. } => MsgType::TVersion,
            FCall::RVersion { .. } => MsgType::RVersion,
            FCall::TAuth { .. } => MsgType::TAuth,
            FCall::RAuth { .. } => MsgType::RAuth,
            FCall::TFlush { .. } => MsgType::TFlush,
            FCall::RFlush => MsgType::RFlush,
            FCall::TAttach { .. } => MsgType::TAttach,
            FCall::RAttach { .. } => MsgType::RAttach,
            FCall::TWalk { .. } => MsgType::TWalk,
            FCall::RWalk { .. } => MsgType::RWalk,
            FCall::TOpen { .. } => MsgType::TOpen,
            FCall::ROpen { .. } => MsgType::ROpen,
            FCall::TCreate { .. } => MsgType::TCreate,
            FCall::RCreate { .. } => MsgType::RCreate,
            FCall::TRead { .. } => MsgType::TRead,
            FCall::RRead { .. } => MsgType::RRead,
            FCall::TWrite { .. } => MsgType::TWrite,
            FCall::RWrite { .. } => MsgType::RWrite,
            FCall::TClunk { .. } => MsgType::TClunk,
            FCall::RClunk => MsgType::RClunk,
            FCall::TRemove { .. } => MsgType::TRemove,
            FCall::RRemove => MsgType::RRemove,
            FCall::TStat { .. } => MsgType::TStat,
            FCall::RStat { .. } => MsgType::RStat,
            FCall::TWStat { .. } => MsgType::TWStat,
            FCall::RWStat => MsgType::RWStat,
        }
    }

    /// The FID a request targets, if any (used by the dispatcher to look it
    /// up generically before calling into a handler).
    pub fn fid(&self) -> Option<u32> {
        match *self {
            FCall::TAttach { fid, .. }
            | FCall::TWalk { fid, .. }
            | FCall::TOpen { fid, .. }
            | FCall::TCreate { fid, .. }
            | FCall::TRead { fid, .. }
            | FCall::TWrite { fid, .. }
            | FCall::TClunk { fid }
            | FCall::TRemove { fid }
            | FCall::TStat { fid }
            | FCall::TWStat { fid, .. } => Some(fid),
            _ => None,
        }
    }
}
