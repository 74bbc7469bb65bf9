//! Serialize/deserialize 9P2000 messages into/from binary.

use crate::fcall::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::{Shl, Shr};

use crate::{io_err, res};

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, >>, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: decoder << data
    pub fn encode<T: Encodable>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// A wrapper class of ReadBytesExt to provide operator overloads
/// for deserializing
#[derive(Clone, Debug)]
pub struct Decoder<R> {
    reader: R,
}

impl<R: ReadBytesExt> Decoder<R> {
    pub fn new(reader: R) -> Decoder<R> {
        Decoder { reader }
    }
    pub fn decode<T: Decodable>(&mut self) -> Result<T> {
        Decodable::decode(&mut self.reader)
    }
    /// Get inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for Decoder<R> {
    type Output = SResult<Decoder<R>>;
    fn shr(mut self, rhs: &'a mut T) -> Self::Output {
        match self.decode() {
            Ok(r) => {
                *rhs = r;
                SResult(Ok(self))
            }
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Decodable, R: ReadBytesExt> Shr<&'a mut T> for SResult<Decoder<R>> {
    type Output = Self;
    fn shr(self, rhs: &'a mut T) -> Self::Output {
        match self.0 {
            Ok(mut decoder) => match decoder.decode() {
                Ok(r) => {
                    *rhs = r;
                    SResult(Ok(decoder))
                }
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}
impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}
impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}
impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}
impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}
impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .map_err(|_| io_err!(Other, "Invalid UTF-8 sequence"))
    }
}

/// Sentinel-based wire form of a wstat/stat "don't touch" field: absent
/// integers encode as all-ones, absent strings as the empty string.
impl Encodable for Option<u32> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.unwrap_or(!0).encode(w)
    }
}
impl Decodable for Option<u32> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let v: u32 = Decodable::decode(r)?;
        Ok(if v == !0 { None } else { Some(v) })
    }
}

impl Encodable for Option<u64> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.unwrap_or(!0).encode(w)
    }
}
impl Decodable for Option<u64> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let v: u64 = Decodable::decode(r)?;
        Ok(if v == !0 { None } else { Some(v) })
    }
}

impl Encodable for Option<String> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        self.as_deref().unwrap_or("").to_string().encode(w)
    }
}
impl Decodable for Option<String> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let s: String = Decodable::decode(r)?;
        Ok(if s.is_empty() { None } else { Some(s) })
    }
}

impl Encodable for QId {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w) << &self.typ.bits() << &self.version << &self.path {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}
impl Decodable for QId {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(QId {
            typ: decode!(QIdType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

/// A raw byte blob carried by `Rread`/`Twrite`: a u32 length prefix followed
/// by the bytes themselves, with no further framing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Data(pub Vec<u8>);

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}
impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match self
            .iter()
            .fold(Encoder::new(w) << &(self.len() as u16), |acc, s| acc << s)
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}
impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::new();
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// `Stat`'s own leading size field (`body_len()`), followed by the fixed
/// fields and then the four variable-length strings.
impl Encodable for Stat {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        match Encoder::new(w)
            << &self.body_len()
            << &self.qid.typ.bits()
            << &0u32 // dev, always zero (see data model)
            << &self.qid
            << &self.mode
            << &self.atime
            << &self.mtime
            << &self.length
            << &self.name
            << &self.uid
            << &self.gid
            << &self.muid
        {
            SResult(Ok(enc)) => Ok(enc.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}
impl Decodable for Stat {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let _size: u16 = Decodable::decode(r)?;
        let _typ: u8 = Decodable::decode(r)?;
        let _dev: u32 = Decodable::decode(r)?;
        Ok(Stat {
            qid: Decodable::decode(r)?,
            mode: Decodable::decode(r)?,
            atime: Decodable::decode(r)?,
            mtime: Decodable::decode(r)?,
            length: Decodable::decode(r)?,
            name: Decodable::decode(r)?,
            uid: Decodable::decode(r)?,
            gid: Decodable::decode(r)?,
            muid: Decodable::decode(r)?,
        })
    }
}

impl Encodable for Msg {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        use crate::fcall::FCall::*;

        let typ = self.body.msg_type();
        let buf = Encoder::new(w) << &(typ as u8) << &self.tag;

        let buf = match self.body {
            RError { ref ename } => buf << ename,
            TVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            RVersion {
                ref msize,
                ref version,
            } => buf << msize << version,
            TAuth {
                ref afid,
                ref uname,
                ref aname,
            } => buf << afid << uname << aname,
            RAuth { ref aqid } => buf << aqid,
            TFlush { ref oldtag } => buf << oldtag,
            RFlush => buf,
            TAttach {
                ref fid,
                ref afid,
                ref uname,
                ref aname,
            } => buf << fid << afid << uname << aname,
            RAttach { ref qid } => buf << qid,
            TWalk {
                ref fid,
                ref newfid,
                ref wnames,
            } => buf << fid << newfid << wnames,
            RWalk { ref wqids } => buf << wqids,
            TOpen { ref fid, ref mode } => buf << fid << mode,
            ROpen {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TCreate {
                ref fid,
                ref name,
                ref perm,
                ref mode,
                ref extension,
            } => buf << fid << name << perm << mode << extension,
            RCreate {
                ref qid,
                ref iounit,
            } => buf << qid << iounit,
            TRead {
                ref fid,
                ref offset,
                ref count,
            } => buf << fid << offset << count,
            RRead { ref data } => buf << data,
            TWrite {
                ref fid,
                ref offset,
                ref data,
            } => buf << fid << offset << data,
            RWrite { ref count } => buf << count,
            TClunk { ref fid } => buf << fid,
            RClunk => buf,
            TRemove { ref fid } => buf << fid,
            RRemove => buf,
            TStat { ref fid } => buf << fid,
            RStat { ref stat } => buf << &stat.packed_len() << stat,
            TWStat { ref fid, ref stat } => buf << fid << &stat.packed_len() << stat,
            RWStat => buf,
        };

        match buf {
            SResult(Ok(b)) => Ok(b.bytes_written()),
            SResult(Err(e)) => Err(e),
        }
    }
}

impl Decodable for Msg {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        use crate::fcall::MsgType::*;

        let mut buf = r;

        let msg_type = MsgType::from_u8(decode!(buf));
        let tag = decode!(buf);
        let body = match msg_type {
            Some(RError) => FCall::RError {
                ename: decode!(buf),
            },
            Some(TVersion) => FCall::TVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(RVersion) => FCall::RVersion {
                msize: decode!(buf),
                version: decode!(buf),
            },
            Some(TAuth) => FCall::TAuth {
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
            Some(TFlush) => FCall::TFlush {
                oldtag: decode!(buf),
            },
            Some(RFlush) => FCall::RFlush,
            Some(TAttach) => FCall::TAttach {
                fid: decode!(buf),
                afid: decode!(buf),
                uname: decode!(buf),
                aname: decode!(buf),
            },
            Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
            Some(TWalk) => FCall::TWalk {
                fid: decode!(buf),
                newfid: decode!(buf),
                wnames: decode!(buf),
            },
            Some(RWalk) => FCall::RWalk {
                wqids: decode!(buf),
            },
            Some(TOpen) => FCall::TOpen {
                fid: decode!(buf),
                mode: decode!(buf),
            },
            Some(ROpen) => FCall::ROpen {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TCreate) => FCall::TCreate {
                fid: decode!(buf),
                name: decode!(buf),
                perm: decode!(buf),
                mode: decode!(buf),
                extension: decode!(buf),
            },
            Some(RCreate) => FCall::RCreate {
                qid: decode!(buf),
                iounit: decode!(buf),
            },
            Some(TRead) => FCall::TRead {
                fid: decode!(buf),
                offset: decode!(buf),
                count: decode!(buf),
            },
            Some(RRead) => FCall::RRead { data: decode!(buf) },
            Some(TWrite) => FCall::TWrite {
                fid: decode!(buf),
                offset: decode!(buf),
                data: decode!(buf),
            },
            Some(RWrite) => FCall::RWrite {
                count: decode!(buf),
            },
            Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
            Some(RClunk) => FCall::RClunk,
            Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
            Some(RRemove) => FCall::RRemove,
            Some(TStat) => FCall::TStat { fid: decode!(buf) },
            Some(RStat) => {
                let _nstat: u16 = decode!(buf);
                FCall::RStat { stat: decode!(buf) }
            }
            Some(TWStat) => {
                let fid = decode!(buf);
                let _nstat: u16 = decode!(buf);
                FCall::TWStat {
                    fid,
                    stat: decode!(buf),
                }
            }
            Some(RWStat) => FCall::RWStat,
            Some(TError) | None => return res!(io_err!(Other, "invalid message type")),
        };

        Ok(Msg { tag, body })
    }
}

/// Read one 9P2000 message from a byte-oriented stream.
pub fn read_msg<R: ReadBytesExt>(r: &mut R) -> Result<Msg> {
    Decodable::decode(r)
}

/// Write one 9P2000 message into a byte-oriented stream.
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg) -> Result<usize> {
    msg.encode(w)
}

#[test]
fn encoder_test1() {
    let expected: Vec<u8> = (0..10).collect();
    let mut encoder = Vec::new();
    for i in 0..10 {
        (&(i as u8)).encode(&mut encoder).unwrap();
    }
    assert_eq!(expected, encoder);
}

#[test]
fn decoder_test1() {
    use std::io::Cursor;

    let expected: Vec<u8> = (0..10).collect();
    let mut decoder = Cursor::new(expected.clone());
    let mut actual: Vec<u8> = Vec::new();
    loop {
        match Decodable::decode(&mut decoder) {
            Ok(i) => actual.push(i),
            Err(_) => break,
        }
    }
    assert_eq!(expected, actual);
}

#[test]
fn msg_encode_decode_version() {
    use std::io::Cursor;

    let expected = Msg {
        tag: NOTAG,
        body: FCall::RVersion {
            msize: 8192,
            version: P92000.to_owned(),
        },
    };
    let mut buf = Vec::new();
    let _ = expected.encode(&mut buf);

    let mut readbuf = Cursor::new(buf);
    let actual: Msg = Decodable::decode(&mut readbuf).unwrap();

    assert_eq!(expected.tag, actual.tag);
    match actual.body {
        FCall::RVersion { msize, version } => {
            assert_eq!(msize, 8192);
            assert_eq!(version, P92000);
        }
        other => panic!("unexpected body: {other:?}"),
    }
}

#[test]
fn msg_encode_decode_walk() {
    use std::io::Cursor;

    let expected = Msg {
        tag: 7,
        body: FCall::TWalk {
            fid: 1,
            newfid: 2,
            wnames: vec!["a".to_owned(), "b".to_owned()],
        },
    };
    let mut buf = Vec::new();
    let _ = expected.encode(&mut buf);
    let mut readbuf = Cursor::new(buf);
    let actual: Msg = Decodable::decode(&mut readbuf).unwrap();

    match actual.body {
        FCall::TWalk {
            fid,
            newfid,
            wnames,
        } => {
            assert_eq!(fid, 1);
            assert_eq!(newfid, 2);
            assert_eq!(wnames, vec!["a".to_owned(), "b".to_owned()]);
        }
        other => panic!("unexpected body: {other:?}"),
    }
}

#[cfg(test)]
mod stat_tests {
    use super::*;
    use std::io::Cursor;

    fn sample_qid() -> QId {
        QId {
            typ: QIdType::FILE,
            version: 42,
            path: 1001,
        }
    }

    #[test]
    fn stat_roundtrip_all_fields_present() {
        let stat = Stat {
            qid: sample_qid(),
            mode: Some(0o644),
            atime: Some(1000),
            mtime: Some(2000),
            length: Some(12345),
            name: Some("file.txt".to_owned()),
            uid: Some("glenda".to_owned()),
            gid: Some("glenda".to_owned()),
            muid: Some("glenda".to_owned()),
        };
        let mut buf = Vec::new();
        stat.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), stat.packed_len() as usize);

        let mut r = Cursor::new(buf);
        let decoded: Stat = Decodable::decode(&mut r).unwrap();
        assert_eq!(decoded, stat);
    }

    #[test]
    fn stat_roundtrip_dont_touch_sentinels() {
        let stat = Stat {
            qid: sample_qid(),
            mode: None,
            atime: None,
            mtime: None,
            length: None,
            name: None,
            uid: None,
            gid: None,
            muid: None,
        };
        let mut buf = Vec::new();
        stat.encode(&mut buf).unwrap();

        let mut r = Cursor::new(buf);
        let decoded: Stat = Decodable::decode(&mut r).unwrap();
        assert_eq!(decoded, stat);
    }

    #[test]
    fn rstat_wire_has_doubled_size_field() {
        let stat = Stat {
            qid: sample_qid(),
            mode: Some(0o755),
            atime: None,
            mtime: None,
            length: Some(0),
            name: Some("x".to_owned()),
            uid: None,
            gid: None,
            muid: None,
        };
        let msg = Msg {
            tag: 1,
            body: FCall::RStat { stat: stat.clone() },
        };
        let mut buf = Vec::new();
        msg.encode(&mut buf).unwrap();

        // type[1] + tag[2] + nstat[2] + stat.packed_len() (the outer frame
        // length is added by the transport codec, not by Msg::encode).
        assert_eq!(buf.len(), 1 + 2 + 2 + stat.packed_len() as usize);
    }
}
