mod common;

use common::{shell, Rig};
use guestctl_proto::msg::{dir_remove_flags, host_features, seek_method};
use guestctl_proto::{
    context, ErrorCode, FileOpenParams, FileReply, GuestReply, HostEvent, HostMessage,
};
use guestctl_service::session::flags;
use guestctl_service::{Flow, ScratchBuffer};

fn open_params(path: &std::path::Path, access: &str, disposition: &str) -> FileOpenParams {
    FileOpenParams {
        file_name: path.to_str().unwrap().into(),
        access: access.into(),
        disposition: disposition.into(),
        ..Default::default()
    }
}

fn file_reply(rig: &Rig, context_id: u32) -> FileReply {
    match rig.replies(context_id).pop() {
        Some(GuestReply::File(reply)) => reply,
        other => panic!("no file reply on {:#x}: {:?}", context_id, other),
    }
}

fn open(rig: &mut Rig, context_id: u32, params: FileOpenParams) -> u32 {
    rig.send(context_id, HostMessage::FileOpen(params)).unwrap();
    match file_reply(rig, context_id) {
        FileReply::Open { rc: 0, handle } => handle,
        other => panic!("open failed: {:?}", other),
    }
}

#[test]
fn test_write_then_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("x");
    let mut rig = Rig::new(flags::SPAWN, 0);
    let data: Vec<u8> = (0..100u8).collect();

    let first = open(&mut rig, context::make(1, 5, 1), open_params(&path, "w", "ca"));
    rig.send(
        context::make(1, 5, 2),
        HostMessage::FileWriteAt {
            handle: first,
            data: data.clone(),
            offset: 0,
        },
    )
    .unwrap();
    assert_eq!(
        file_reply(&rig, context::make(1, 5, 2)),
        FileReply::Write {
            rc: 0,
            written: 100
        }
    );
    rig.send(context::make(1, 5, 3), HostMessage::FileClose { handle: first })
        .unwrap();

    let second = open(&mut rig, context::make(1, 6, 1), open_params(&path, "r", "oe"));
    assert_ne!(first, second);
    rig.send(
        context::make(1, 6, 2),
        HostMessage::FileRead {
            handle: second,
            to_read: 100,
        },
    )
    .unwrap();
    assert_eq!(
        file_reply(&rig, context::make(1, 6, 2)),
        FileReply::Read { rc: 0, data }
    );
    assert_eq!(rig.session.file_count(), 1);
}

#[test]
fn test_large_write_grows_scratch_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big");
    let mut rig = Rig::new(flags::SPAWN, host_features::NOTIFY_RDWR_OFFSET);
    let data = vec![0x5a; ScratchBuffer::INITIAL_SIZE * 2];

    let handle = open(&mut rig, context::make(1, 1, 1), open_params(&path, "rw", "ca"));
    rig.send(
        context::make(1, 1, 2),
        HostMessage::FileWriteAt {
            handle,
            data: data.clone(),
            offset: 16,
        },
    )
    .unwrap();
    assert_eq!(rig.scratch.grows(), 1);
    assert_eq!(
        file_reply(&rig, context::make(1, 1, 2)),
        FileReply::WriteOffset {
            rc: 0,
            written: data.len() as u32,
            offset: 16 + data.len() as i64
        }
    );

    rig.send(
        context::make(1, 1, 3),
        HostMessage::FileReadAt {
            handle,
            to_read: data.len() as u32,
            offset: 16,
        },
    )
    .unwrap();
    match file_reply(&rig, context::make(1, 1, 3)) {
        FileReply::ReadOffset { rc: 0, data: read, offset } => {
            assert_eq!(read, data);
            assert_eq!(offset, 16 + data.len() as i64);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
    assert_eq!(rig.scratch.grows(), 1);
}

#[test]
fn test_seek_tell_and_set_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s");
    std::fs::write(&path, b"0123456789").unwrap();
    let mut rig = Rig::new(flags::SPAWN, 0);
    let handle = open(&mut rig, context::make(1, 2, 1), open_params(&path, "r+", "oe"));

    rig.send(
        context::make(1, 2, 2),
        HostMessage::FileSeek {
            handle,
            method: seek_method::END,
            offset: -3,
        },
    )
    .unwrap();
    assert_eq!(
        file_reply(&rig, context::make(1, 2, 2)),
        FileReply::Seek { rc: 0, offset: 7 }
    );

    rig.send(context::make(1, 2, 3), HostMessage::FileTell { handle })
        .unwrap();
    assert_eq!(
        file_reply(&rig, context::make(1, 2, 3)),
        FileReply::Tell { rc: 0, offset: 7 }
    );

    let err = rig
        .send(
            context::make(1, 2, 4),
            HostMessage::FileSeek {
                handle,
                method: 2,
                offset: 0,
            },
        )
        .unwrap_err();
    assert_eq!(err, ErrorCode::NotSupported);

    rig.send(
        context::make(1, 2, 5),
        HostMessage::FileSetSize { handle, size: 4 },
    )
    .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"0123");

    rig.send(
        context::make(1, 2, 6),
        HostMessage::FileSetSize {
            handle: 999,
            size: 4,
        },
    )
    .unwrap_err();
    assert_eq!(
        file_reply(&rig, context::make(1, 2, 6)),
        FileReply::SetSize {
            rc: ErrorCode::NotFound.to_raw(),
            size: u64::MAX
        }
    );
}

#[test]
fn test_non_recursive_remove_leaves_full_directory() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("full");
    std::fs::create_dir(&target).unwrap();
    std::fs::write(target.join("f"), b"x").unwrap();
    let mut rig = Rig::new(flags::SPAWN, 0);

    let err = rig
        .send(
            7,
            HostMessage::DirRemove {
                path: target.to_str().unwrap().into(),
                flags: dir_remove_flags::NONE,
            },
        )
        .unwrap_err();
    assert_eq!(err, ErrorCode::DirNotEmpty);
    assert_eq!(
        rig.replies(7),
        [GuestReply::Generic {
            rc: ErrorCode::DirNotEmpty.to_raw(),
            kind: 0,
            payload: Vec::new()
        }]
    );
    assert!(target.join("f").exists());
}

#[test]
fn test_root_session_refuses_file_system_access() {
    let dir = tempfile::tempdir().unwrap();
    let victim = dir.path().join("victim");
    std::fs::create_dir(&victim).unwrap();
    let created = dir.path().join("created");
    let mut rig = Rig::new(0, host_features::OPTIMIZATIONS);

    let messages = vec![
        HostMessage::FileOpen(open_params(&created, "w", "ca")),
        HostMessage::DirRemove {
            path: victim.to_str().unwrap().into(),
            flags: dir_remove_flags::RECURSIVE,
        },
        HostMessage::PathRename {
            source: victim.to_str().unwrap().into(),
            dest: created.to_str().unwrap().into(),
            flags: 0,
        },
        HostMessage::PathUserHome,
    ];
    for (i, message) in messages.into_iter().enumerate() {
        let kind = message.kind();
        assert_eq!(rig.send(i as u32 + 1, message), Ok(Flow::Continue));
        assert!(rig.replies(i as u32 + 1).is_empty());
        assert!(rig.host.events().iter().any(|e| matches!(
            e,
            HostEvent::Skipped { msg, rc, .. }
                if *msg == kind as u32 && *rc == ErrorCode::NotSupported.to_raw()
        )));
    }
    assert!(victim.exists());
    assert!(!created.exists());
    assert_eq!(rig.host.queued(rig.client), 0);
}

#[test]
fn test_unknown_message_is_skipped() {
    let mut rig = Rig::new(flags::SPAWN, 0);
    rig.host.post_unknown(rig.client, 3, 9999);
    let mut epoch = 0;
    let peeked = rig.channel.peek_wait(&mut epoch).unwrap();
    let mut ctx = guestctl_proto::HostCtx::new(rig.channel.clone(), 2, 0);
    ctx.set_peeked(peeked);
    assert_eq!(
        rig.session.dispatch(&mut ctx, &mut rig.scratch),
        Ok(Flow::Continue)
    );
    assert_eq!(rig.host.queued(rig.client), 0);
}

#[test]
fn test_user_home_is_reported() {
    let mut rig = Rig::new(flags::SPAWN, 0);
    rig.send(8, HostMessage::PathUserHome).unwrap();
    match rig.replies(8).as_slice() {
        [GuestReply::Generic { rc: 0, payload, .. }] => {
            use std::os::unix::ffi::OsStrExt;
            let home = dirs::home_dir().unwrap();
            assert_eq!(payload.as_slice(), home.as_os_str().as_bytes());
        }
        other => panic!("unexpected replies: {:?}", other),
    }
}

#[test]
fn test_session_close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut rig = Rig::new(flags::SPAWN, 0);
    rig.start(1, shell("sleep 30", 0, 0));
    open(&mut rig, context::make(1, 3, 1), open_params(&dir.path().join("f"), "w", "ca"));
    assert_eq!(rig.session.process_count(), 1);
    assert_eq!(rig.session.file_count(), 1);

    let flow = rig
        .send(
            context::make(1, 0, 9),
            HostMessage::SessionClose {
                flags: 0,
                session_id: 1,
            },
        )
        .unwrap();
    assert_eq!(flow, Flow::Shutdown);
    assert_eq!(rig.session.process_count(), 0);
    assert_eq!(rig.session.file_count(), 0);

    rig.session.close().unwrap();
    assert_eq!(rig.session.process_count(), 0);
    assert_eq!(rig.session.file_count(), 0);
    assert_eq!(
        rig.host.count(|e| matches!(e, HostEvent::Reply { context_id: 1, .. })),
        2
    );
}
