use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use guestctl_proto::msg::{dir_remove_flags, rename_flags, shutdown_flags};
use guestctl_proto::{rc_of, ErrorCode, HostCtx, HostMessage, HostMsgKind, Result};
use walkdir::WalkDir;

use super::{fetch, finish, GuestSession};
use crate::scratch::ScratchBuffer;

/// Removes everything below `dir` without following symlinks. Children
/// come before their directory.
fn remove_contents(dir: &Path) -> io::Result<()> {
    let walk = WalkDir::new(dir)
        .min_depth(1)
        .follow_links(false)
        .contents_first(true);
    for entry in walk {
        let entry = entry?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

pub(super) fn remove_dir(path: &Path, flags: u32) -> Result<()> {
    if flags & !dir_remove_flags::VALID_MASK != 0 {
        return Err(ErrorCode::NotSupported);
    }
    if path.as_os_str().is_empty() {
        return Err(ErrorCode::InvalidParameter);
    }
    if flags & dir_remove_flags::RECURSIVE == 0 {
        return fs::remove_dir(path).map_err(ErrorCode::from);
    }

    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(ErrorCode::PathNotFound),
        // Nothing left to remove.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    remove_contents(path)?;
    if flags & dir_remove_flags::CONTENT_ONLY == 0 {
        fs::remove_dir(path)?;
    }
    Ok(())
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

pub(super) fn rename(source: &Path, dest: &Path, flags: u32) -> Result<()> {
    if flags & !rename_flags::VALID_MASK != 0 {
        return Err(ErrorCode::NotSupported);
    }
    if source.as_os_str().is_empty() || dest.as_os_str().is_empty() {
        return Err(ErrorCode::InvalidParameter);
    }
    if flags & rename_flags::NO_SYMLINKS != 0 && (is_symlink(source) || is_symlink(dest)) {
        return Err(ErrorCode::AccessDenied);
    }
    let replace = flags & rename_flags::REPLACE != 0 && flags & rename_flags::NO_REPLACE == 0;
    if !replace && fs::symlink_metadata(dest).is_ok() {
        return Err(ErrorCode::AlreadyExists);
    }
    fs::rename(source, dest)?;
    Ok(())
}

fn user_home() -> Result<PathBuf> {
    dirs::home_dir()
        .filter(|home| !home.as_os_str().is_empty())
        .ok_or(ErrorCode::NotFound)
}

/// Program and arguments run for a shutdown request.
pub(super) fn shutdown_command(action: u32, program: Option<&Path>) -> (OsString, Vec<OsString>) {
    let reboot = action & shutdown_flags::REBOOT != 0;
    let force = action & shutdown_flags::FORCE != 0;

    if let Some(program) = program {
        let mut args = vec![OsString::from(if reboot { "reboot" } else { "poweroff" })];
        if force {
            args.push("--force".into());
        }
        return (program.as_os_str().to_owned(), args);
    }
    if force {
        let verb = if reboot { "reboot" } else { "poweroff" };
        return ("systemctl".into(), vec!["--force".into(), verb.into()]);
    }
    let mode = if reboot { "-r" } else { "-P" };
    ("shutdown".into(), vec![mode.into(), "now".into()])
}

impl GuestSession {
    pub(super) fn handle_dir_remove(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::DirRemove { path, flags } = fetch(ctx, HostMsgKind::DirRemove, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let result = remove_dir(Path::new(&path), flags);
        tracing::debug!(
            "[session {}] remove dir '{}' flags={:#x}: {:?}",
            self.id(),
            path,
            flags,
            result
        );
        let replied = ctx.reply_rc(rc_of(&result));
        finish(result, replied)
    }

    pub(super) fn handle_path_rename(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::PathRename {
            source,
            dest,
            flags,
        } = fetch(ctx, HostMsgKind::PathRename, scratch)?
        else {
            return Err(ErrorCode::Mismatch);
        };
        let result = rename(Path::new(&source), Path::new(&dest), flags);
        tracing::debug!(
            "[session {}] rename '{}' -> '{}' flags={:#x}: {:?}",
            self.id(),
            source,
            dest,
            flags,
            result
        );
        let replied = ctx.reply_rc(rc_of(&result));
        finish(result, replied)
    }

    pub(super) fn handle_user_home(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        fetch(ctx, HostMsgKind::PathUserHome, scratch)?;
        self.reply_path(ctx, user_home())
    }

    pub(super) fn handle_user_documents(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        fetch(ctx, HostMsgKind::PathUserDocuments, scratch)?;
        self.reply_path(ctx, user_home().map(|home| home.join("Documents")))
    }

    fn reply_path(&self, ctx: &HostCtx, result: Result<PathBuf>) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;

        let payload = match &result {
            Ok(path) => path.as_os_str().as_bytes().to_vec(),
            Err(e) => {
                tracing::debug!("[session {}] user path lookup failed: {}", self.id(), e);
                Vec::new()
            }
        };
        let replied = ctx.reply_payload(rc_of(&result), 0, payload);
        finish(result, replied)
    }

    pub(super) fn handle_shutdown(
        &self,
        ctx: &mut HostCtx,
        scratch: &mut ScratchBuffer,
    ) -> Result<()> {
        let HostMessage::Shutdown { action } = fetch(ctx, HostMsgKind::Shutdown, scratch)? else {
            return Err(ErrorCode::Mismatch);
        };
        let valid = shutdown_flags::REBOOT | shutdown_flags::FORCE;
        if action & !valid != 0 {
            ctx.reply_rc(ErrorCode::InvalidParameter.to_raw())?;
            return Err(ErrorCode::InvalidParameter);
        }

        ctx.reply_rc(0)?;

        let (program, args) = shutdown_command(action, self.options().shutdown_program.as_deref());
        tracing::info!(
            "[session {}] running {:?} {:?}",
            self.id(),
            program,
            args
        );
        let status = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            tracing::error!("{:?} failed: {}", program, status);
            return Err(ErrorCode::Internal);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_dir_flags() {
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path().join("top");
        fs::create_dir_all(top.join("a/b")).unwrap();
        fs::write(top.join("a/b/f"), b"x").unwrap();
        fs::write(top.join("g"), b"y").unwrap();

        assert_eq!(remove_dir(&top, 0x80), Err(ErrorCode::NotSupported));
        assert_eq!(remove_dir(&top, 0), Err(ErrorCode::DirNotEmpty));

        remove_dir(&top, dir_remove_flags::RECURSIVE | dir_remove_flags::CONTENT_ONLY).unwrap();
        assert!(top.is_dir());
        assert_eq!(fs::read_dir(&top).unwrap().count(), 0);

        fs::create_dir(top.join("c")).unwrap();
        remove_dir(&top, dir_remove_flags::RECURSIVE).unwrap();
        assert!(!top.exists());

        // Already gone.
        remove_dir(&top, dir_remove_flags::RECURSIVE).unwrap();
    }

    #[test]
    fn test_recursive_remove_keeps_symlink_targets() {
        let dir = tempfile::tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("keep"), b"k").unwrap();
        let top = dir.path().join("top");
        fs::create_dir(&top).unwrap();
        std::os::unix::fs::symlink(&outside, top.join("link")).unwrap();

        remove_dir(&top, dir_remove_flags::RECURSIVE | dir_remove_flags::CONTENT_AND_DIR).unwrap();
        assert!(!top.exists());
        assert!(outside.join("keep").exists());
    }

    #[test]
    fn test_content_only_empties_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path().join("top");
        fs::create_dir_all(top.join("a/b/c")).unwrap();
        fs::write(top.join("a/b/c/deep"), b"d").unwrap();
        fs::write(top.join("a/f"), b"f").unwrap();
        std::os::unix::fs::symlink(top.join("a/b"), top.join("loop")).unwrap();

        remove_dir(&top, dir_remove_flags::RECURSIVE | dir_remove_flags::CONTENT_ONLY).unwrap();
        assert!(top.is_dir());
        assert_eq!(fs::read_dir(&top).unwrap().count(), 0);
    }

    #[test]
    fn test_recursive_remove_of_file_is_path_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"p").unwrap();
        assert_eq!(
            remove_dir(&file, dir_remove_flags::RECURSIVE),
            Err(ErrorCode::PathNotFound)
        );
        assert!(file.exists());
    }

    #[test]
    fn test_rename_flags() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"1").unwrap();
        fs::write(&b, b"2").unwrap();

        assert_eq!(rename(&a, &b, 0x10), Err(ErrorCode::NotSupported));
        assert_eq!(rename(&a, &b, 0), Err(ErrorCode::AlreadyExists));
        assert_eq!(
            rename(&a, &b, rename_flags::NO_REPLACE),
            Err(ErrorCode::AlreadyExists)
        );
        rename(&a, &b, rename_flags::REPLACE).unwrap();
        assert_eq!(fs::read(&b).unwrap(), b"1");
        assert!(!a.exists());

        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&b, &link).unwrap();
        assert_eq!(
            rename(&link, &a, rename_flags::NO_SYMLINKS),
            Err(ErrorCode::AccessDenied)
        );
        rename(&link, &a, 0).unwrap();
        assert!(a.is_symlink());
    }

    fn command(action: u32, program: Option<&Path>) -> Vec<String> {
        let (prog, args) = shutdown_command(action, program);
        std::iter::once(prog)
            .chain(args)
            .map(|s| s.into_string().unwrap())
            .collect()
    }

    #[test]
    fn test_shutdown_commands() {
        assert_eq!(command(shutdown_flags::REBOOT, None), ["shutdown", "-r", "now"]);
        assert_eq!(command(shutdown_flags::POWER_OFF, None), ["shutdown", "-P", "now"]);
        assert_eq!(
            command(shutdown_flags::FORCE, None),
            ["systemctl", "--force", "poweroff"]
        );

        let custom = Path::new("/usr/local/bin/fake-shutdown");
        assert_eq!(
            command(shutdown_flags::REBOOT | shutdown_flags::FORCE, Some(custom)),
            ["/usr/local/bin/fake-shutdown", "reboot", "--force"]
        );
    }
}
