use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;

use guestctl_proto::msg::{host_features, seek_method};
use guestctl_proto::{
    context, rc_of, ErrorCode, FileOpenParams, FileReply, HostCtx, HostMessage, HostMsgKind,
    Result,
};

use super::{fetch, finish, GuestSession};
use crate::scratch::ScratchBuffer;

pub(super) struct OpenFile {
    pub path: PathBuf,
    file: File,
    append: bool,
}

/// Maps access mode and disposition strings onto open options. Returns
/// whether writes go to the end of the file.
fn open_options(access: &str, disposition: &str) -> Result<(OpenOptions, bool)> {
    let mut opts = OpenOptions::new();
    let mut append = false;
    let read_only = match access {
        "r" => {
            opts.read(true);
            true
        }
        "w" => {
            opts.write(true);
            false
        }
        "r+" | "w+" | "rw" => {
            opts.read(true).write(true);
            false
        }
        "a" => {
            opts.write(true);
            append = true;
            false
        }
        "a+" => {
            opts.read(true).write(true);
            append = true;
            false
        }
        _ => return Err(ErrorCode::InvalidParameter),
    };

    match disposition {
        // Create, replacing an existing file.
        "ca" => {
            opts.create(true).truncate(true);
        }
        // Create, failing if it exists.
        "ce" => {
            opts.create_new(true);
        }
        // Open or create.
        "oc" => {
            opts.create(true);
        }
        // Open existing or create, appending.
        "oa" => {
            opts.create(true);
            append = true;
        }
        // Open existing and truncate.
        "ot" => {
            opts.truncate(true);
        }
        // Open existing.
        "oe" => {}
        _ => return Err(ErrorCode::InvalidParameter),
    }

    // Truncation needs write access; a read-only open keeps the contents.
    if read_only {
        opts.truncate(false);
    }
    if append {
        opts.append(true);
    }
    Ok((opts, append))
}

fn open_file(params: &FileOpenParams) -> Result<OpenFile> {
    if params.file_name.is_empty() {
        return Err(ErrorCode::InvalidName);
    }
    let (mut opts, append) = open_options(&params.access, &params.disposition)?;
    if params.creation_mode != 0 {
        opts.mode(params.creation_mode & 0o7777);
    }

    let path = PathBuf::from(&params.file_name);
    let mut file = opts.open(&path)?;
    if !file.metadata()?.is_file() {
        return Err(ErrorCode::NotSupported);
    }
    if params.offset != 0 {
        file.seek(SeekFrom::Start(params.offset))?;
    }
    Ok(OpenFile { path, file, append })
}

fn seek_from(method: u32, offset: i64) -> Result<SeekFrom> {
    match method {
        seek_method::BEGIN => u64::try_from(offset)
            .map(SeekFrom::Start)
            .map_err(|_| ErrorCode::InvalidParameter),
        seek_method::CURRENT => Ok(SeekFrom::Current(offset)),
        seek_method::END => Ok(SeekFrom::End(offset)),
        _ => Err(ErrorCode::NotSupported),
    }
}

impl GuestSession {
    fn with_file<T>(
        &self,
        handle: u32,
        op: impl FnOnce(&mut OpenFile) -> io::Result<T>,
    ) -> Result<T> {
        let mut files = self.lock_files();
        let file = files.get_mut(&handle).ok_or(ErrorCode::NotFound)?;
        op(file).map_err(ErrorCode::from)
    }

    pub(super) fn handle_file_open(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::FileOpen(params) = fetch(ctx, HostMsgKind::FileOpen, scratch)? else {
            return Err(ErrorCode::Mismatch);
        };
        let handle = context::object_id_of(ctx.context_id);

        let result = open_file(&params).and_then(|file| {
            let mut files = self.lock_files();
            if files.contains_key(&handle) {
                return Err(ErrorCode::AlreadyExists);
            }
            tracing::debug!(
                "[session {}] opened '{}' ({} {}) as handle {}",
                self.id(),
                params.file_name,
                params.access,
                params.disposition,
                handle
            );
            files.insert(handle, file);
            Ok(handle)
        });
        if let Err(e) = &result {
            tracing::debug!("[session {}] open '{}' failed: {}", self.id(), params.file_name, e);
        }

        let replied = ctx.file_reply(FileReply::Open {
            rc: rc_of(&result),
            handle: *result.as_ref().unwrap_or(&0),
        });
        finish(result, replied)
    }

    pub(super) fn handle_file_close(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::FileClose { handle } = fetch(ctx, HostMsgKind::FileClose, scratch)? else {
            return Err(ErrorCode::Mismatch);
        };
        let result = self
            .lock_files()
            .remove(&handle)
            .map(drop)
            .ok_or(ErrorCode::NotFound);
        let replied = ctx.file_reply(FileReply::Close {
            rc: rc_of(&result),
        });
        finish(result, replied)
    }

    pub(super) fn handle_file_read(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::FileRead { handle, to_read } = fetch(ctx, HostMsgKind::FileRead, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let to_read = to_read as usize;
        // A failed grow just means a shorter read.
        if let Err(e) = scratch.ensure_capacity(to_read) {
            tracing::debug!("reading at most {} bytes: {}", scratch.capacity(), e);
        }

        let buf = scratch.as_mut_slice(to_read);
        let result = self.with_file(handle, |f| {
            let n = f.file.read(buf)?;
            let offset = f.file.stream_position()?;
            Ok((n, offset))
        });
        self.reply_read(ctx, scratch, result)
    }

    pub(super) fn handle_file_read_at(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::FileReadAt {
            handle,
            to_read,
            offset,
        } = fetch(ctx, HostMsgKind::FileReadAt, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let to_read = to_read as usize;
        if let Err(e) = scratch.ensure_capacity(to_read) {
            tracing::debug!("reading at most {} bytes: {}", scratch.capacity(), e);
        }

        let buf = scratch.as_mut_slice(to_read);
        let result = self.with_file(handle, |f| {
            let n = f.file.read_at(buf, offset)?;
            let offset = f.file.seek(SeekFrom::Start(offset + n as u64))?;
            Ok((n, offset))
        });
        self.reply_read(ctx, scratch, result)
    }

    fn reply_read(
        &self,
        ctx: &HostCtx,
        scratch: &mut ScratchBuffer,
        result: Result<(usize, u64)>,
    ) -> Result<()> {
        let (data, offset) = match &result {
            Ok((n, offset)) => (scratch.as_mut_slice(*n).to_vec(), *offset as i64),
            Err(_) => (Vec::new(), 0),
        };
        let rc = rc_of(&result);
        let reply = if ctx.has_host_feature(host_features::NOTIFY_RDWR_OFFSET) {
            FileReply::ReadOffset { rc, data, offset }
        } else {
            FileReply::Read { rc, data }
        };
        finish(result, ctx.file_reply(reply))
    }

    pub(super) fn handle_file_write(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::FileWrite { handle, data } = fetch(ctx, HostMsgKind::FileWrite, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let result = self.with_file(handle, |f| {
            let n = f.file.write(&data)?;
            let offset = f.file.stream_position()?;
            Ok((n, offset))
        });
        self.reply_write(ctx, result)
    }

    pub(super) fn handle_file_write_at(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::FileWriteAt {
            handle,
            data,
            offset,
        } = fetch(ctx, HostMsgKind::FileWriteAt, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let result = self.with_file(handle, |f| {
            let n = f.file.write_at(&data, offset)?;
            let next = if f.append {
                SeekFrom::End(0)
            } else {
                SeekFrom::Start(offset + n as u64)
            };
            let offset = f.file.seek(next)?;
            Ok((n, offset))
        });
        self.reply_write(ctx, result)
    }

    fn reply_write(&self, ctx: &HostCtx, result: Result<(usize, u64)>) -> Result<()> {
        let (written, offset) = match &result {
            Ok((n, offset)) => (*n as u32, *offset as i64),
            Err(_) => (0, 0),
        };
        let rc = rc_of(&result);
        let reply = if ctx.has_host_feature(host_features::NOTIFY_RDWR_OFFSET) {
            FileReply::WriteOffset {
                rc,
                written,
                offset,
            }
        } else {
            FileReply::Write { rc, written }
        };
        finish(result, ctx.file_reply(reply))
    }

    pub(super) fn handle_file_seek(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::FileSeek {
            handle,
            method,
            offset,
        } = fetch(ctx, HostMsgKind::FileSeek, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let result = seek_from(method, offset)
            .and_then(|pos| self.with_file(handle, |f| f.file.seek(pos)));
        let replied = ctx.file_reply(FileReply::Seek {
            rc: rc_of(&result),
            offset: *result.as_ref().unwrap_or(&0),
        });
        finish(result, replied)
    }

    pub(super) fn handle_file_tell(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::FileTell { handle } = fetch(ctx, HostMsgKind::FileTell, scratch)? else {
            return Err(ErrorCode::Mismatch);
        };
        let result = self.with_file(handle, |f| f.file.stream_position());
        let replied = ctx.file_reply(FileReply::Tell {
            rc: rc_of(&result),
            offset: *result.as_ref().unwrap_or(&0),
        });
        finish(result, replied)
    }

    pub(super) fn handle_file_set_size(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::FileSetSize { handle, size } =
            fetch(ctx, HostMsgKind::FileSetSize, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let result = self.with_file(handle, |f| f.file.set_len(size));
        let size = match result {
            Ok(()) => size,
            Err(ErrorCode::NotFound) => u64::MAX,
            Err(_) => size,
        };
        let replied = ctx.file_reply(FileReply::SetSize {
            rc: rc_of(&result),
            size,
        });
        finish(result, replied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(name: &str, access: &str, disposition: &str) -> FileOpenParams {
        FileOpenParams {
            file_name: name.into(),
            access: access.into(),
            disposition: disposition.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_bad_modes_are_rejected() {
        assert!(matches!(open_options("x", "oe"), Err(ErrorCode::InvalidParameter)));
        assert!(matches!(open_options("r", "zz"), Err(ErrorCode::InvalidParameter)));
        assert!(matches!(open_options("a", "oe"), Ok((_, true))));
    }

    #[test]
    fn test_open_dispositions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        let name = path.to_str().unwrap();

        assert!(matches!(
            open_file(&params(name, "r", "oe")),
            Err(ErrorCode::FileNotFound)
        ));
        open_file(&params(name, "w", "ce")).unwrap();
        assert!(matches!(
            open_file(&params(name, "w", "ce")),
            Err(ErrorCode::AlreadyExists)
        ));

        std::fs::write(&path, b"hello").unwrap();
        // Read-only opens never truncate.
        open_file(&params(name, "r", "ot")).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        open_file(&params(name, "rw", "ot")).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }

    #[test]
    fn test_open_rejects_directories_and_empty_names() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().to_str().unwrap();
        assert!(matches!(
            open_file(&params(name, "r", "oe")),
            Err(ErrorCode::NotSupported)
        ));
        assert!(matches!(
            open_file(&params("", "r", "oe")),
            Err(ErrorCode::InvalidName)
        ));
    }

    #[test]
    fn test_open_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.bin");
        std::fs::write(&path, b"0123456789").unwrap();
        let mut p = params(path.to_str().unwrap(), "r", "oe");
        p.offset = 4;
        let mut f = open_file(&p).unwrap();
        let mut rest = String::new();
        f.file.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "456789");
    }

    #[test]
    fn test_seek_methods() {
        assert_eq!(seek_from(seek_method::BEGIN, 5).unwrap(), SeekFrom::Start(5));
        assert_eq!(seek_from(seek_method::CURRENT, -2).unwrap(), SeekFrom::Current(-2));
        assert_eq!(seek_from(seek_method::END, 0).unwrap(), SeekFrom::End(0));
        assert_eq!(seek_from(seek_method::BEGIN, -1), Err(ErrorCode::InvalidParameter));
        assert_eq!(seek_from(2, 0), Err(ErrorCode::NotSupported));
    }
}
