//! Session engine: the FID state machine, the `Filesystem` capability
//! trait, and the per-connection dispatch loop.
//!
//! Each accepted connection is driven by exactly one task that processes
//! requests to completion one at a time before reading the next frame.
//! This is simpler than fanning each request out to its own task, and it
//! makes `Tflush` correct for free: by the time a `Tflush(oldtag)` frame can
//! possibly arrive, the request tagged `oldtag` has already been replied to,
//! so there is never a genuinely in-flight target to cancel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::buf::{Buf, BufMut};
use futures::sink::SinkExt;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::Error;
use crate::fcall::*;
use crate::fid::FidTable;
use crate::path;
use crate::utils::{self, Result};

/// Server-wide configuration, built once at startup and shared read-only
/// across every connection.
#[derive(Clone, Debug)]
pub struct Config {
    pub exported_root: PathBuf,
    pub debug: bool,
    pub user: String,
}

/// Host-filesystem operations a [`Session`] calls into once a request's
/// generic FID bookkeeping (existence, uniqueness, the open-once rule) has
/// already been resolved.
///
/// Every method receives a host path already produced by [`crate::path`];
/// implementations never see client-relative paths or need to guard against
/// traversal themselves.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// State cached on a fid once it has been opened or created, typically
    /// an open file descriptor.
    type Handle: Send + Sync + Default;

    /// The qid for an existing host path.
    async fn qid(&self, path: &Path) -> Result<QId>;

    /// Build a full `Stat` record for `path`, using `name` as the `Stat.name`
    /// field (the caller supplies it since root uses `"/"` rather than its
    /// real basename).
    async fn build_stat(&self, path: &Path, name: &str) -> Result<Stat>;

    /// Open `path` with the given `Topen` mode bits, returning the handle to
    /// cache on the fid.
    async fn open(&self, path: &Path, mode: u8) -> Result<Self::Handle>;

    /// Create `name` inside the directory `dir`, returning its host path and
    /// an already-open handle (a created file is implicitly opened).
    async fn create(
        &self,
        dir: &Path,
        name: &str,
        perm: u32,
        mode: u8,
        extension: &str,
    ) -> Result<(PathBuf, Self::Handle)>;

    /// Read up to `count` bytes at `offset` from an opened regular file or
    /// symlink.
    async fn read(
        &self,
        path: &Path,
        handle: &mut Self::Handle,
        offset: u64,
        count: u32,
    ) -> Result<Vec<u8>>;

    /// Read up to `count` bytes of concatenated stat records from an opened
    /// directory, starting at directory-entry `offset`.
    async fn read_dir(&self, path: &Path, offset: u64, count: u32, user: &str) -> Result<Vec<u8>>;

    /// Write `data` at `offset` into an opened file.
    async fn write(
        &self,
        path: &Path,
        handle: &mut Self::Handle,
        offset: u64,
        data: &[u8],
    ) -> Result<u32>;

    async fn truncate(&self, path: &Path, length: u64) -> Result<()>;
    async fn chmod(&self, path: &Path, mode: u32) -> Result<()>;
    /// Rename `path` to `new_name` within its existing parent, returning the
    /// new host path.
    async fn rename(&self, path: &Path, new_name: &str) -> Result<PathBuf>;

    async fn remove(&self, path: &Path) -> Result<()>;
}

fn qid_is_dir(qid: &QId) -> bool {
    qid.typ.contains(QIdType::DIR)
}

/// Upper bound this server will ever negotiate for `msize`, regardless of
/// what a client proposes in `Tversion`.
const MSIZE_MAX: u32 = 64 * 1024;

/// One client session: FID table plus negotiated `msize`/version.
pub struct Session<Fs: Filesystem> {
    fs: Arc<Fs>,
    config: Arc<Config>,
    fids: FidTable<Fs::Handle>,
    msize: u32,
}

impl<Fs: Filesystem> Session<Fs> {
    pub fn new(fs: Arc<Fs>, config: Arc<Config>) -> Self {
        Session {
            fs,
            config,
            fids: FidTable::new(),
            msize: 8192,
        }
    }

    fn iounit(&self) -> u32 {
        self.msize.saturating_sub(IOHDRSZ)
    }

    fn host_path(&self, client_path: &str) -> Result<PathBuf> {
        path::resolve(client_path, &self.config.exported_root)
    }

    fn stat_name(client_path: &str) -> &str {
        if client_path == "/" {
            "/"
        } else {
            client_path.rsplit('/').next().unwrap_or(client_path)
        }
    }

    async fn tversion(&mut self, msize: u32, version: &str) -> Result<FCall> {
        self.msize = msize.min(MSIZE_MAX);
        let negotiated = if version == P92000 {
            P92000.to_owned()
        } else {
            VERSION_UNKNOWN.to_owned()
        };
        Ok(FCall::RVersion {
            msize: self.msize,
            version: negotiated,
        })
    }

    async fn tattach(&mut self, fid: u32, afid: u32, uname: &str, aname: &str) -> Result<FCall> {
        if afid != NOFID {
            return Err(Error::path("authentication not required"));
        }
        let _ = (uname, aname);
        let root = self.config.exported_root.clone();
        let qid = self.fs.qid(&root).await?;
        self.fids.insert(fid, "/".to_owned(), qid)?;
        Ok(FCall::RAttach { qid })
    }

    async fn twalk(&mut self, fid: u32, newfid: u32, wnames: &[String]) -> Result<FCall> {
        let (start_path, already_open) = {
            let f = self.fids.get(fid)?;
            (f.path.clone(), f.is_open())
        };
        if newfid == fid && already_open {
            return Err(Error::fid_state("cannot walk an open fid onto itself"));
        }

        if wnames.is_empty() {
            // Walk with no names clones the fid onto newfid.
            let qid = self.fids.get(fid)?.qid;
            if newfid != fid {
                self.fids.insert(newfid, start_path, qid)?;
            }
            return Ok(FCall::RWalk { wqids: Vec::new() });
        }

        let mut cur = start_path;
        let mut wqids = Vec::with_capacity(wnames.len());
        for name in wnames {
            let candidate = if cur == "/" {
                format!("/{name}")
            } else {
                format!("{cur}/{name}")
            };
            let cleaned = path::clean(&candidate);
            let host = match self.host_path(&cleaned) {
                Ok(h) => h,
                Err(_) => break,
            };
            match self.fs.qid(&host).await {
                Ok(qid) => {
                    wqids.push(qid);
                    cur = cleaned;
                }
                Err(_) => break,
            }
        }

        if wqids.is_empty() {
            return Err(Error::path("no such file or directory"));
        }
        if wqids.len() == wnames.len() {
            let last = *wqids.last().unwrap();
            if newfid == fid {
                let f = self.fids.get_mut(fid)?;
                f.path = cur;
                f.qid = last;
            } else {
                self.fids.insert(newfid, cur, last)?;
            }
        }
        Ok(FCall::RWalk { wqids })
    }

    async fn topen(&mut self, fid: u32, mode: u8) -> Result<FCall> {
        let (host, qid, already_open) = {
            let f = self.fids.get(fid)?;
            (self.host_path(&f.path)?, f.qid, f.is_open())
        };
        if already_open {
            return Err(Error::fid_state("fid already open"));
        }
        if qid_is_dir(&qid) && (mode & om::MODE_MASK) != om::READ {
            return Err(Error::fid_state("directories may only be opened for reading"));
        }
        let handle = self.fs.open(&host, mode).await?;
        let f = self.fids.get_mut(fid)?;
        f.open_mode = Some(mode);
        f.aux = handle;
        Ok(FCall::ROpen {
            qid,
            iounit: self.iounit(),
        })
    }

    async fn tcreate(
        &mut self,
        fid: u32,
        name: &str,
        perm: u32,
        mode: u8,
        extension: &str,
    ) -> Result<FCall> {
        let (dir_host, dir_client, already_open) = {
            let f = self.fids.get(fid)?;
            (self.host_path(&f.path)?, f.path.clone(), f.is_open())
        };
        if already_open {
            return Err(Error::fid_state("fid already open"));
        }
        let (new_host, handle) = self.fs.create(&dir_host, name, perm, mode, extension).await?;
        let qid = self.fs.qid(&new_host).await?;
        let new_client = if dir_client == "/" {
            format!("/{name}")
        } else {
            format!("{dir_client}/{name}")
        };

        let f = self.fids.get_mut(fid)?;
        f.path = new_client;
        f.qid = qid;
        f.open_mode = Some(mode);
        f.aux = handle;
        Ok(FCall::RCreate {
            qid,
            iounit: self.iounit(),
        })
    }

    async fn tread(&mut self, fid: u32, offset: u64, count: u32) -> Result<FCall> {
        let count = count.min(self.iounit());
        let (host, qid, user) = {
            let f = self.fids.get(fid)?;
            if !f.is_open() {
                return Err(Error::fid_state("fid not open"));
            }
            (self.host_path(&f.path)?, f.qid, self.config.user.clone())
        };

        let data = if qid_is_dir(&qid) {
            self.fs.read_dir(&host, offset, count, &user).await?
        } else {
            let f = self.fids.get_mut(fid)?;
            self.fs.read(&host, &mut f.aux, offset, count).await?
        };
        Ok(FCall::RRead {
            data: crate::serialize::Data(data),
        })
    }

    async fn twrite(&mut self, fid: u32, offset: u64, data: &crate::serialize::Data) -> Result<FCall> {
        let host = {
            let f = self.fids.get(fid)?;
            if !f.is_open() {
                return Err(Error::fid_state("fid not open"));
            }
            match f.open_mode {
                Some(m) if (m & om::MODE_MASK) == om::READ => {
                    return Err(Error::fid_state("fid not open for writing"));
                }
                _ => {}
            }
            self.host_path(&f.path)?
        };
        let f = self.fids.get_mut(fid)?;
        let count = self.fs.write(&host, &mut f.aux, offset, &data.0).await?;
        Ok(FCall::RWrite { count })
    }

    fn tclunk(&mut self, fid: u32) -> Result<FCall> {
        self.fids.remove(fid)?;
        Ok(FCall::RClunk)
    }

    async fn tremove(&mut self, fid: u32) -> Result<FCall> {
        let removed = self.fids.remove(fid)?;
        let host = self.host_path(&removed.path)?;
        self.fs.remove(&host).await?;
        Ok(FCall::RRemove)
    }

    async fn tstat(&mut self, fid: u32) -> Result<FCall> {
        let f = self.fids.get(fid)?;
        let host = self.host_path(&f.path)?;
        let name = Self::stat_name(&f.path).to_owned();
        let stat = self.fs.build_stat(&host, &name).await?;
        Ok(FCall::RStat { stat })
    }

    async fn twstat(&mut self, fid: u32, stat: &Stat) -> Result<FCall> {
        let client_path = self.fids.get(fid)?.path.clone();
        let mut host = self.host_path(&client_path)?;

        if let Some(length) = stat.length {
            self.fs.truncate(&host, length).await?;
        }
        if let Some(mode) = stat.mode {
            self.fs.chmod(&host, mode).await?;
        }
        let mut new_client = client_path.clone();
        if let Some(ref name) = stat.name {
            if !name.is_empty() && name != Self::stat_name(&client_path) {
                if name.contains('/') || name == ".." || name == "." {
                    return Err(Error::path("wstat name must be a single path component"));
                }
                host = self.fs.rename(&host, name).await?;
                let parent = client_path.rsplitn(2, '/').nth(1).unwrap_or("");
                new_client = if parent.is_empty() {
                    format!("/{name}")
                } else {
                    format!("{parent}/{name}")
                };
            }
        }

        let qid = self.fs.qid(&host).await?;
        let f = self.fids.get_mut(fid)?;
        f.path = new_client;
        f.qid = qid;
        Ok(FCall::RWStat)
    }

    /// Dispatch one decoded message to the appropriate handler, returning
    /// the reply body. Errors other than `Error::Protocol` become `Rerror`
    /// at the caller; `Protocol` errors end the session.
    pub async fn dispatch(&mut self, body: &FCall) -> Result<FCall> {
        match body {
            FCall::TVersion { msize, version } => self.tversion(*msize, version).await,
            FCall::TAuth { .. } => Err(Error::path("authentication not required")),
            FCall::TAttach {
                fid,
                afid,
                uname,
                aname,
            } => self.tattach(*fid, *afid, uname, aname).await,
            FCall::TWalk {
                fid,
                newfid,
                wnames,
            } => self.twalk(*fid, *newfid, wnames).await,
            FCall::TOpen { fid, mode } => self.topen(*fid, *mode).await,
            FCall::TCreate {
                fid,
                name,
                perm,
                mode,
                extension,
            } => self.tcreate(*fid, name, *perm, *mode, extension).await,
            FCall::TRead { fid, offset, count } => self.tread(*fid, *offset, *count).await,
            FCall::TWrite { fid, offset, data } => self.twrite(*fid, *offset, data).await,
            FCall::TClunk { fid } => self.tclunk(*fid),
            FCall::TRemove { fid } => self.tremove(*fid).await,
            FCall::TStat { fid } => self.tstat(*fid).await,
            FCall::TWStat { fid, stat } => self.twstat(*fid, stat).await,
            FCall::TFlush { .. } => Ok(FCall::RFlush),
            _ => Err(Error::protocol("unexpected message type")),
        }
    }
}

/// Drive one accepted connection to completion: decode a frame, dispatch it
/// to completion, encode and send the reply, repeat.
async fn serve_connection<Fs, Reader, Writer>(
    fs: Arc<Fs>,
    config: Arc<Config>,
    reader: Reader,
    writer: Writer,
) -> Result<()>
where
    Fs: 'static + Filesystem,
    Reader: 'static + AsyncRead + Send + Unpin,
    Writer: 'static + AsyncWrite + Send + Unpin,
{
    let mut framed_read = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_read(reader);
    let mut framed_write = LengthDelimitedCodec::builder()
        .length_field_offset(0)
        .length_field_length(4)
        .length_adjustment(-4)
        .little_endian()
        .new_write(writer);

    let mut session = Session::new(fs, config);

    while let Some(bytes) = framed_read.next().await {
        let bytes = bytes.map_err(Error::from)?;
        let msg = crate::serialize::read_msg(&mut bytes.reader())
            .map_err(|e| Error::protocol(e.to_string()))?;
        debug!("<- {:?}", msg);

        let reply_body = match session.dispatch(&msg.body).await {
            Ok(body) => body,
            Err(e) if e.is_protocol() => {
                warn!("ending session: {}", e);
                return Err(e);
            }
            Err(e) => FCall::RError { ename: e.ename() },
        };
        let reply = Msg {
            tag: msg.tag,
            body: reply_body,
        };
        debug!("-> {:?}", reply);

        let mut out = bytes::BytesMut::with_capacity(256).writer();
        crate::serialize::write_msg(&mut out, &reply).map_err(Error::from)?;
        framed_write.send(out.into_inner().freeze()).await?;
    }

    Ok(())
}

/// Serve `addr`, which selects one of three transports:
/// - `"tcp!host!port"` — announce a `TcpListener`, spawning one session task
///   per accepted connection.
/// - `"-"` — serve a single session over the inherited stdin/stdout pair.
/// - anything else — treat `addr` as a path to an already-existing character
///   device, open it read-write, and serve a single session over it.
pub async fn serve<Fs>(fs: Fs, config: Config, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem,
{
    let fs = Arc::new(fs);
    let config = Arc::new(config);

    if addr == "-" {
        info!("serving over stdio");
        return serve_connection(fs, config, tokio::io::stdin(), tokio::io::stdout()).await;
    }

    if let Some((proto, host, port)) = utils::parse_proto(addr) {
        if proto != "tcp" {
            return Err(Error::protocol(format!("unsupported transport: {proto}")));
        }
        let host = if host == "*" { "0.0.0.0" } else { host };
        let listener = TcpListener::bind(format!("{host}:{port}")).await?;

        info!("listening on {host}:{port}");
        loop {
            let (stream, peer) = listener.accept().await?;
            info!("accepted connection from {peer}");
            let fs = fs.clone();
            let config = config.clone();
            tokio::spawn(async move {
                let (r, w) = stream.into_split();
                if let Err(e) = serve_connection(fs, config, r, w).await {
                    error!("connection from {peer} ended: {e}");
                }
            });
        }
    }

    let device = std::path::Path::new(addr);
    if !device.exists() {
        return Err(Error::protocol(format!("invalid listen address: {addr}")));
    }
    info!("serving over character device {}", device.display());
    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(device)
        .await?;
    let write_half = file.try_clone().await?;
    serve_connection(fs, config, file, write_half).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    struct MemNode {
        is_dir: bool,
        data: Vec<u8>,
        mode: u32,
        ino: u64,
        mtime: u32,
    }

    /// An in-memory tree standing in for a real host filesystem, so the
    /// session state machine can be tested without touching disk.
    struct MemFs {
        nodes: Mutex<HashMap<PathBuf, MemNode>>,
        next_ino: Mutex<u64>,
    }

    impl MemFs {
        fn new(root: &Path) -> Self {
            let mut nodes = HashMap::new();
            nodes.insert(
                root.to_path_buf(),
                MemNode {
                    is_dir: true,
                    data: Vec::new(),
                    mode: 0o755,
                    ino: 1,
                    mtime: 0,
                },
            );
            MemFs {
                nodes: Mutex::new(nodes),
                next_ino: Mutex::new(2),
            }
        }

        fn alloc_ino(&self) -> u64 {
            let mut n = self.next_ino.lock().unwrap();
            let v = *n;
            *n += 1;
            v
        }

        fn stat_of(node: &MemNode, name: &str, user: &str) -> Stat {
            Stat {
                qid: QId {
                    typ: if node.is_dir { QIdType::DIR } else { QIdType::FILE },
                    version: node.mtime,
                    path: node.ino,
                },
                mode: Some(node.mode),
                atime: Some(0),
                mtime: Some(node.mtime),
                length: Some(node.data.len() as u64),
                name: Some(name.to_owned()),
                uid: Some(user.to_owned()),
                gid: Some(user.to_owned()),
                muid: Some(user.to_owned()),
            }
        }
    }

    #[async_trait]
    impl Filesystem for MemFs {
        type Handle = ();

        async fn qid(&self, path: &Path) -> Result<QId> {
            let nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get(path)
                .ok_or_else(|| Error::path("no such file or directory"))?;
            Ok(QId {
                typ: if node.is_dir { QIdType::DIR } else { QIdType::FILE },
                version: node.mtime,
                path: node.ino,
            })
        }

        async fn build_stat(&self, path: &Path, name: &str) -> Result<Stat> {
            let nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get(path)
                .ok_or_else(|| Error::path("no such file or directory"))?;
            Ok(Self::stat_of(node, name, "test"))
        }

        async fn open(&self, path: &Path, _mode: u8) -> Result<Self::Handle> {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .contains_key(path)
                .then_some(())
                .ok_or_else(|| Error::path("no such file or directory"))
        }

        async fn create(
            &self,
            dir: &Path,
            name: &str,
            perm: u32,
            _mode: u8,
            _extension: &str,
        ) -> Result<(PathBuf, Self::Handle)> {
            let path = dir.join(name);
            let mut nodes = self.nodes.lock().unwrap();
            if nodes.contains_key(&path) {
                return Err(Error::path("already exists"));
            }
            let ino = self.alloc_ino();
            nodes.insert(
                path.clone(),
                MemNode {
                    is_dir: perm & dm::DIR != 0,
                    data: Vec::new(),
                    mode: perm & dm::PERM_MASK,
                    ino,
                    mtime: 0,
                },
            );
            Ok((path, ()))
        }

        async fn read(
            &self,
            path: &Path,
            _handle: &mut Self::Handle,
            offset: u64,
            count: u32,
        ) -> Result<Vec<u8>> {
            let nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get(path)
                .ok_or_else(|| Error::path("no such file or directory"))?;
            let start = (offset as usize).min(node.data.len());
            let end = (start + count as usize).min(node.data.len());
            Ok(node.data[start..end].to_vec())
        }

        async fn read_dir(&self, path: &Path, offset: u64, count: u32, user: &str) -> Result<Vec<u8>> {
            let nodes = self.nodes.lock().unwrap();
            let mut children: Vec<(String, MemNode)> = nodes
                .iter()
                .filter(|(p, _)| p.parent() == Some(path))
                .map(|(p, n)| (p.file_name().unwrap().to_string_lossy().into_owned(), n.clone()))
                .collect();
            children.sort_by(|a, b| a.0.cmp(&b.0));
            drop(nodes);

            let mut out = Vec::new();
            let mut pos = 0u64;
            for (name, node) in children {
                let stat = Self::stat_of(&node, &name, user);
                let slen = stat.packed_len() as u64;
                if pos + slen <= offset {
                    pos += slen;
                    continue;
                }
                if out.len() as u64 + slen > count as u64 {
                    break;
                }
                let mut buf = Vec::new();
                crate::serialize::Encodable::encode(&stat, &mut buf).map_err(Error::from)?;
                out.extend_from_slice(&buf);
                pos += slen;
            }
            Ok(out)
        }

        async fn write(
            &self,
            path: &Path,
            _handle: &mut Self::Handle,
            offset: u64,
            data: &[u8],
        ) -> Result<u32> {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| Error::path("no such file or directory"))?;
            let end = offset as usize + data.len();
            if node.data.len() < end {
                node.data.resize(end, 0);
            }
            node.data[offset as usize..end].copy_from_slice(data);
            node.mtime += 1;
            Ok(data.len() as u32)
        }

        async fn truncate(&self, path: &Path, length: u64) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| Error::path("no such file or directory"))?;
            node.data.resize(length as usize, 0);
            Ok(())
        }

        async fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| Error::path("no such file or directory"))?;
            node.mode = mode & dm::PERM_MASK;
            Ok(())
        }

        async fn rename(&self, path: &Path, new_name: &str) -> Result<PathBuf> {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .remove(path)
                .ok_or_else(|| Error::path("no such file or directory"))?;
            let new_path = path
                .parent()
                .ok_or_else(|| Error::path("cannot rename root"))?
                .join(new_name);
            nodes.insert(new_path.clone(), node);
            Ok(new_path)
        }

        async fn remove(&self, path: &Path) -> Result<()> {
            let mut nodes = self.nodes.lock().unwrap();
            nodes
                .remove(path)
                .ok_or_else(|| Error::path("no such file or directory"))?;
            Ok(())
        }
    }

    fn new_session() -> Session<MemFs> {
        let root = PathBuf::from("/virtual");
        let fs = Arc::new(MemFs::new(&root));
        let config = Arc::new(Config {
            exported_root: root,
            debug: false,
            user: "test".to_owned(),
        });
        Session::new(fs, config)
    }

    #[tokio::test]
    async fn attach_walk_open_create_write_read_roundtrip() {
        let mut s = new_session();
        s.tattach(0, NOFID, "u", "").await.unwrap();
        s.twalk(0, 1, &[]).await.unwrap();
        s.tcreate(1, "hello", 0o644, om::WRITE, "").await.unwrap();
        match s.twrite(1, 0, &crate::serialize::Data(b"world".to_vec())).await.unwrap() {
            FCall::RWrite { count } => assert_eq!(count, 5),
            other => panic!("unexpected reply: {other:?}"),
        }
        s.tclunk(1).unwrap();

        s.twalk(0, 2, &["hello".to_owned()]).await.unwrap();
        s.topen(2, om::READ).await.unwrap();
        match s.tread(2, 0, 16).await.unwrap() {
            FCall::RRead { data } => assert_eq!(data.0, b"world"),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn walk_partial_failure_does_not_bind_newfid() {
        let mut s = new_session();
        s.tattach(0, NOFID, "u", "").await.unwrap();
        s.twalk(0, 1, &[]).await.unwrap();
        s.tcreate(1, "a", dm::DIR | 0o755, om::READ, "").await.unwrap();
        s.tclunk(1).unwrap();

        s.twalk(0, 1, &[]).await.unwrap();
        let reply = s
            .twalk(1, 2, &["a".to_owned(), "b".to_owned()])
            .await
            .unwrap();
        match reply {
            FCall::RWalk { wqids } => assert_eq!(wqids.len(), 1),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(!s.fids.contains(2));
    }

    #[tokio::test]
    async fn walk_onto_self_updates_in_place_without_error() {
        let mut s = new_session();
        s.tattach(0, NOFID, "u", "").await.unwrap();
        s.twalk(0, 1, &[]).await.unwrap();
        s.tcreate(1, "a", dm::DIR | 0o755, om::READ, "").await.unwrap();
        s.tclunk(1).unwrap();

        s.twalk(0, 0, &["a".to_owned()]).await.unwrap();
        assert_eq!(s.fids.get(0).unwrap().path, "/a");
    }

    #[tokio::test]
    async fn walking_an_open_fid_onto_itself_is_rejected() {
        let mut s = new_session();
        s.tattach(0, NOFID, "u", "").await.unwrap();
        s.twalk(0, 1, &[]).await.unwrap();
        s.tcreate(1, "a", dm::DIR | 0o755, om::READ, "").await.unwrap();
        s.tclunk(1).unwrap();

        s.twalk(0, 1, &["a".to_owned()]).await.unwrap();
        s.topen(1, om::READ).await.unwrap();

        assert!(s.twalk(1, 1, &[]).await.is_err());
        // The fid's path/qid must be untouched by the rejected walk.
        assert_eq!(s.fids.get(1).unwrap().path, "/a");
    }

    #[tokio::test]
    async fn opening_a_directory_for_writing_is_rejected() {
        let mut s = new_session();
        s.tattach(0, NOFID, "u", "").await.unwrap();
        s.twalk(0, 1, &[]).await.unwrap();
        assert!(s.topen(1, om::WRITE).await.is_err());
    }

    #[tokio::test]
    async fn opening_a_fid_twice_is_rejected() {
        let mut s = new_session();
        s.tattach(0, NOFID, "u", "").await.unwrap();
        s.twalk(0, 1, &[]).await.unwrap();
        s.topen(1, om::READ).await.unwrap();
        assert!(s.topen(1, om::READ).await.is_err());
    }

    #[tokio::test]
    async fn wstat_rename_moves_the_fid_path() {
        let mut s = new_session();
        s.tattach(0, NOFID, "u", "").await.unwrap();
        s.twalk(0, 1, &[]).await.unwrap();
        s.tcreate(1, "x", 0o644, om::WRITE, "").await.unwrap();

        let stat = Stat {
            qid: s.fids.get(1).unwrap().qid,
            mode: None,
            atime: None,
            mtime: None,
            length: None,
            name: Some("y".to_owned()),
            uid: None,
            gid: None,
            muid: None,
        };
        s.twstat(1, &stat).await.unwrap();
        assert_eq!(s.fids.get(1).unwrap().path, "/y");

        s.tattach(9, NOFID, "u", "").await.unwrap();
        assert!(s.twalk(9, 10, &["x".to_owned()]).await.is_err());
    }

    #[tokio::test]
    async fn wstat_rename_rejects_a_name_that_escapes_the_parent() {
        let mut s = new_session();
        s.tattach(0, NOFID, "u", "").await.unwrap();
        s.twalk(0, 1, &[]).await.unwrap();
        s.tcreate(1, "x", 0o644, om::WRITE, "").await.unwrap();

        for evil in ["../escaped", "a/b", ".."] {
            let stat = Stat {
                qid: s.fids.get(1).unwrap().qid,
                mode: None,
                atime: None,
                mtime: None,
                length: None,
                name: Some(evil.to_owned()),
                uid: None,
                gid: None,
                muid: None,
            };
            assert!(s.twstat(1, &stat).await.is_err());
        }
        // The fid must still point at its original, un-renamed path.
        assert_eq!(s.fids.get(1).unwrap().path, "/x");
    }

    #[tokio::test]
    async fn remove_clunks_the_fid_even_though_it_also_removes() {
        let mut s = new_session();
        s.tattach(0, NOFID, "u", "").await.unwrap();
        s.twalk(0, 1, &[]).await.unwrap();
        s.tcreate(1, "x", 0o644, om::WRITE, "").await.unwrap();
        s.tremove(1).await.unwrap();
        assert!(!s.fids.contains(1));
    }

    #[tokio::test]
    async fn tversion_clamps_msize_to_the_server_cap() {
        let mut s = new_session();
        match s.tversion(10 * 1024 * 1024, P92000).await.unwrap() {
            FCall::RVersion { msize, .. } => assert_eq!(msize, MSIZE_MAX),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn directory_read_never_truncates_a_record() {
        let mut s = new_session();
        s.tattach(0, NOFID, "u", "").await.unwrap();
        s.twalk(0, 1, &[]).await.unwrap();
        for name in ["a", "b", "c"] {
            s.twalk(0, 2, &[]).await.unwrap();
            s.tcreate(2, name, 0o644, om::WRITE, "").await.unwrap();
            s.tclunk(2).unwrap();
        }
        s.topen(1, om::READ).await.unwrap();

        let full = match s.tread(1, 0, 65536).await.unwrap() {
            FCall::RRead { data } => data.0,
            other => panic!("unexpected reply: {other:?}"),
        };

        let mut offset = 0u64;
        let mut collected = Vec::new();
        loop {
            let chunk = match s.tread(1, offset, 16).await.unwrap() {
                FCall::RRead { data } => data.0,
                other => panic!("unexpected reply: {other:?}"),
            };
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected.len(), full.len());
    }
}
