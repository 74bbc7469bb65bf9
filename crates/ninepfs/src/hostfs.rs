//! Maps the session engine's `Filesystem` trait onto a real directory tree.
//!
//! Every path this module touches is already resolved under the exported
//! root by `ninep::path::resolve`; nothing here re-checks traversal.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ninep::error::Error;
use ninep::fcall::{QId, QIdType, Stat, dm, om};
use ninep::serialize::Encodable;
use ninep::srv::Filesystem;
use ninep::utils::Result;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReadDirStream;

pub struct HostFs {
    pub user: String,
}

async fn qid_for(path: &Path) -> Result<QId> {
    let attr = fs::symlink_metadata(path).await?;
    Ok(qid_from_metadata(&attr))
}

fn qid_from_metadata(attr: &std::fs::Metadata) -> QId {
    QId {
        typ: QIdType::from(attr.file_type()),
        // The host mtime doubles as the qid version: any write bumps it,
        // so a cached client-side qid becomes stale exactly when it should.
        version: attr.mtime() as u32,
        path: attr.ino(),
    }
}

fn stat_from_metadata(attr: &std::fs::Metadata, name: &str, user: &str) -> Stat {
    let mut mode = attr.permissions().mode() & dm::PERM_MASK;
    if attr.is_dir() {
        mode |= dm::DIR;
    }
    if attr.file_type().is_symlink() {
        mode |= dm::SYMLINK;
    }
    Stat {
        qid: qid_from_metadata(attr),
        mode: Some(mode),
        atime: Some(attr.atime() as u32),
        mtime: Some(attr.mtime() as u32),
        length: Some(if attr.is_dir() { 0 } else { attr.len() }),
        name: Some(name.to_owned()),
        uid: Some(user.to_owned()),
        gid: Some(user.to_owned()),
        muid: Some(user.to_owned()),
    }
}

#[async_trait]
impl Filesystem for HostFs {
    /// `None` for directories (never actually read through as a file) and
    /// for fids that have not been opened yet.
    type Handle = Option<fs::File>;

    async fn qid(&self, path: &Path) -> Result<QId> {
        qid_for(path).await
    }

    async fn build_stat(&self, path: &Path, name: &str) -> Result<Stat> {
        let attr = fs::symlink_metadata(path).await?;
        Ok(stat_from_metadata(&attr, name, &self.user))
    }

    async fn open(&self, path: &Path, mode: u8) -> Result<Self::Handle> {
        let qid = qid_for(path).await?;
        if qid.typ.contains(QIdType::DIR) {
            return Ok(None);
        }

        let mut opts = fs::OpenOptions::new();
        match mode & om::MODE_MASK {
            om::WRITE => {
                opts.write(true);
            }
            om::RDWR => {
                opts.read(true).write(true);
            }
            _ => {
                opts.read(true);
            }
        }
        if mode & om::TRUNC != 0 {
            opts.write(true).truncate(true);
        }
        Ok(Some(opts.open(path).await?))
    }

    async fn create(
        &self,
        dir: &Path,
        name: &str,
        perm: u32,
        mode: u8,
        extension: &str,
    ) -> Result<(PathBuf, Self::Handle)> {
        let path = dir.join(name);

        if perm & dm::DIR != 0 {
            fs::create_dir(&path).await?;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(perm & dm::PERM_MASK))
                .await?;
            return Ok((path, None));
        }

        if perm & dm::SYMLINK != 0 {
            if extension.is_empty() {
                return Err(Error::path("symlink target required"));
            }
            fs::symlink(extension, &path).await?;
            return Ok((path, None));
        }

        let mut opts = fs::OpenOptions::new();
        opts.create_new(true);
        match mode & om::MODE_MASK {
            om::WRITE => {
                opts.write(true);
            }
            om::RDWR => {
                opts.read(true).write(true);
            }
            _ => {
                opts.read(true);
            }
        }
        let file = opts.open(&path).await?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(perm & dm::PERM_MASK)).await?;
        Ok((path, Some(file)))
    }

    async fn read(
        &self,
        path: &Path,
        handle: &mut Self::Handle,
        offset: u64,
        count: u32,
    ) -> Result<Vec<u8>> {
        let qid = qid_for(path).await?;
        if qid.typ.contains(QIdType::SYMLINK) {
            return read_symlink(path, offset, count).await;
        }
        let file = handle.as_mut().ok_or_else(|| Error::fid_state("fid not open"))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; count as usize];
        let n = file.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn read_dir(&self, path: &Path, offset: u64, count: u32, user: &str) -> Result<Vec<u8>> {
        read_directory(path, offset, count, user).await
    }

    async fn write(
        &self,
        _path: &Path,
        handle: &mut Self::Handle,
        offset: u64,
        data: &[u8],
    ) -> Result<u32> {
        let file = handle.as_mut().ok_or_else(|| Error::fid_state("fid not open"))?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let n = file.write(data).await?;
        Ok(n as u32)
    }

    async fn truncate(&self, path: &Path, length: u64) -> Result<()> {
        let file = fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(length).await?;
        Ok(())
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode & dm::PERM_MASK)).await?;
        Ok(())
    }

    async fn rename(&self, path: &Path, new_name: &str) -> Result<PathBuf> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::path("cannot rename root"))?;
        let new_path = parent.join(new_name);
        fs::rename(path, &new_path).await?;
        Ok(new_path)
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let attr = fs::symlink_metadata(path).await?;
        if attr.is_dir() {
            fs::remove_dir(path).await?;
        } else {
            fs::remove_file(path).await?;
        }
        Ok(())
    }
}

/// `Tread` on a symlink fid: null-terminate into a `count+1` buffer, then
/// return the `[offset, min(offset+count, linklen))` slice.
async fn read_symlink(path: &Path, offset: u64, count: u32) -> Result<Vec<u8>> {
    let target = fs::read_link(path).await?;
    let bytes = target.to_string_lossy().into_owned().into_bytes();
    let linklen = bytes.len() as u64;
    if offset >= linklen {
        return Ok(Vec::new());
    }
    let end = linklen.min(offset + count as u64);
    Ok(bytes[offset as usize..end as usize].to_vec())
}

/// `Tread` on a directory fid: concatenated stat records. `"."` is never
/// emitted (the client already has it); `".."` is. Entries are addressed by
/// a byte-position `pos` that advances by each record's packed length, so
/// `offset` must land exactly on a record boundary from a previous read.
async fn read_directory(path: &Path, offset: u64, count: u32, user: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos: u64 = 0;

    // The exported root's own parent isn't exposed; ".." loops back to it.
    let parent_path = path.parent().unwrap_or(path).to_path_buf();
    let parent_attr = fs::symlink_metadata(&parent_path).await.ok();

    let mut push_entry = |stat: Stat, pos: &mut u64, out: &mut Vec<u8>| -> Result<bool> {
        let slen = stat.packed_len() as u64;
        if *pos + slen <= offset {
            *pos += slen;
            return Ok(true);
        }
        if out.len() as u64 + slen > count as u64 {
            return Ok(false);
        }
        let mut buf = Vec::new();
        Encodable::encode(&stat, &mut buf).map_err(Error::from)?;
        out.extend_from_slice(&buf);
        *pos += slen;
        Ok(true)
    };

    if let Some(parent_attr) = parent_attr {
        let dotdot = stat_from_metadata(&parent_attr, "..", user);
        if !push_entry(dotdot, &mut pos, &mut out)? {
            return Ok(out);
        }
    }

    let mut entries = ReadDirStream::new(fs::read_dir(path).await?);
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        let attr = entry.metadata().await?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let stat = stat_from_metadata(&attr, &name, user);
        if !push_entry(stat, &mut pos, &mut out)? {
            break;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn qid_path_is_stable_inode() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a");
        tokio::fs::write(&file, b"x").await.unwrap();

        let q1 = qid_for(&file).await.unwrap();
        let q2 = qid_for(&file).await.unwrap();
        assert_eq!(q1.path, q2.path);
        assert!(!q1.typ.contains(QIdType::DIR));
    }

    #[tokio::test]
    async fn read_directory_never_emits_dot_but_emits_dotdot() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("a"), b"hi").await.unwrap();

        let bytes = read_directory(dir.path(), 0, 65536, "none").await.unwrap();
        let mut names = Vec::new();
        let mut r = std::io::Cursor::new(bytes);
        while let Ok(stat) = <Stat as ninep::serialize::Decodable>::decode(&mut r) {
            names.push(stat.name.unwrap_or_default());
        }
        assert!(names.contains(&"..".to_owned()));
        assert!(names.contains(&"a".to_owned()));
        assert!(!names.contains(&".".to_owned()));
    }

    #[tokio::test]
    async fn read_directory_paging_never_truncates_a_record() {
        let dir = tempdir().unwrap();
        for name in ["a", "b", "c"] {
            tokio::fs::write(dir.path().join(name), b"hi").await.unwrap();
        }

        let full = read_directory(dir.path(), 0, 65536, "none").await.unwrap();
        let mut offset = 0u64;
        let mut collected = Vec::new();
        loop {
            // A tiny count forces one record per call; never 0 progress.
            let chunk = read_directory(dir.path(), offset, 64, "none").await.unwrap();
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected.len(), full.len());
    }
}
