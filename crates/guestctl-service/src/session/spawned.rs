//! Message loop of a session running in its own process.
//!
//! The supervising agent starts the process, feeds it the session key on
//! stdin and from then on only waits for it to exit.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use guestctl_proto::msg::SESSION_KEY_SIZE;
use guestctl_proto::{
    context, Connector, ErrorCode, HostChannel, HostCtx, HostMsgKind, Result, SessionNotifyType,
};

use super::{flags, Flow, GuestSession, SessionOptions};
use crate::cancel::CancelToken;
use crate::scratch::ScratchBuffer;

/// How a spawned session process ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Success,
    Failure,
    /// Could not connect or authenticate.
    Init,
}

impl SessionExit {
    pub const INIT_CODE: i32 = 3;

    pub fn code(self) -> i32 {
        match self {
            SessionExit::Success => 0,
            SessionExit::Failure => 1,
            SessionExit::Init => Self::INIT_CODE,
        }
    }
}

pub struct SpawnedSession {
    pub options: SessionOptions,
    /// Protocol version the host asked for.
    pub protocol: u32,
    /// Consecutive peek failures tolerated before giving up.
    pub max_failures: u32,
    pub retry_delay: Duration,
}

impl SpawnedSession {
    pub fn new(mut options: SessionOptions, protocol: u32) -> Self {
        options.flags |= flags::SPAWN;
        SpawnedSession {
            options,
            protocol,
            max_failures: 3,
            retry_delay: Duration::from_secs(3),
        }
    }

    pub fn run(
        &self,
        connector: &dyn Connector,
        key_source: &mut dyn Read,
        shutdown: &CancelToken,
    ) -> SessionExit {
        let id = self.options.id;
        let channel = match connector.connect() {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!("[session {}] connecting to the host failed: {}", id, e);
                return SessionExit::Init;
            }
        };

        let exit = match self.authenticate(&channel, key_source) {
            Ok(ctx) => {
                let session = GuestSession::new(self.options.clone());
                self.serve(ctx, &session, shutdown)
            }
            Err(e) => {
                tracing::error!("[session {}] initialisation failed: {}", id, e);
                SessionExit::Init
            }
        };

        if let Err(e) = channel.disconnect() {
            tracing::debug!("[session {}] disconnect: {}", id, e);
        }
        tracing::debug!("[session {}] ended with {:?}", id, exit);
        exit
    }

    /// Proves to the host that this process is the session it prepared and
    /// reports it as started.
    fn authenticate(
        &self,
        channel: &Arc<dyn HostChannel>,
        key_source: &mut dyn Read,
    ) -> Result<HostCtx> {
        let id = self.options.id;
        let host_features = channel.query_features()?;

        let mut key = [0u8; SESSION_KEY_SIZE];
        key_source.read_exact(&mut key).map_err(|e| {
            tracing::error!("[session {}] reading the session key failed: {}", id, e);
            ErrorCode::AccessDenied
        })?;

        let ctx = HostCtx::new(channel.clone(), self.protocol, host_features);
        if ctx.supports_optimizations() {
            channel.session_accept(id, &key)?;
        } else {
            channel.set_filter(context::session_context(id), id, 0)?;
        }
        tracing::debug!(
            "[session {}] accepted by host (features {:#x})",
            id,
            host_features
        );

        ctx.with_context(context::session_context(id))
            .session_notify(SessionNotifyType::Started, 0)?;
        Ok(ctx)
    }

    fn serve(
        &self,
        mut ctx: HostCtx,
        session: &Arc<GuestSession>,
        shutdown: &CancelToken,
    ) -> SessionExit {
        let channel = ctx.channel().clone();
        let mut scratch = ScratchBuffer::new();
        let mut epoch = 0;
        let mut failures = 0;

        let exit = loop {
            if shutdown.is_cancelled() {
                break SessionExit::Success;
            }
            match channel.peek_wait(&mut epoch) {
                Ok(peeked) => {
                    failures = 0;
                    ctx.set_peeked(peeked);
                    if peeked.msg == HostMsgKind::CancelPendingWaits as u32 {
                        tracing::debug!("[session {}] waits cancelled", session.id());
                        break SessionExit::Success;
                    }
                    match session.dispatch(&mut ctx, &mut scratch) {
                        Ok(Flow::Shutdown) => break SessionExit::Success,
                        Ok(Flow::Continue) => {}
                        Err(e) => {
                            tracing::debug!("[session {}] message {} failed: {}", session.id(), peeked.msg, e)
                        }
                    }
                }
                Err(ErrorCode::VmRestored) => {
                    tracing::debug!("[session {}] VM restored, ending session", session.id());
                    break SessionExit::Success;
                }
                Err(ErrorCode::Interrupted) => std::thread::yield_now(),
                Err(e) => {
                    failures += 1;
                    tracing::error!(
                        "[session {}] waiting for host messages failed ({} in a row): {}",
                        session.id(),
                        failures,
                        e
                    );
                    if failures > self.max_failures {
                        break SessionExit::Failure;
                    }
                    shutdown.wait_timeout(self.retry_delay);
                }
            }
        };

        if let Err(e) = session.close() {
            tracing::error!("[session {}] closing failed: {}", session.id(), e);
        }
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestctl_proto::msg::host_features;
    use guestctl_proto::{
        FileOpenParams, FileReply, GuestReply, HostEvent, HostMessage, LoopbackHost, ProcStartupInfo,
        ProcStatus, PROTOCOL_VERSION,
    };

    fn sleeper() -> HostMessage {
        HostMessage::ExecCmd(ProcStartupInfo {
            cmd: "/bin/sh".into(),
            args: "-c 'sleep 30'".into(),
            ..Default::default()
        })
    }

    fn reply(host: &LoopbackHost, context_id: u32) -> GuestReply {
        let event = host.wait_for(Duration::from_secs(20), |e| {
            matches!(e, HostEvent::Reply { context_id: c, .. } if *c == context_id)
        });
        match event {
            Some(HostEvent::Reply { reply, .. }) => reply,
            other => panic!("no reply on {:#x}: {:?}", context_id, other),
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SessionExit::Success.code(), 0);
        assert_eq!(SessionExit::Failure.code(), 1);
        assert_eq!(SessionExit::Init.code(), 3);
    }

    #[test]
    fn test_wrong_key_is_init_failure() {
        let host = LoopbackHost::new(host_features::OPTIMIZATIONS);
        let master = host.connect_client().unwrap();
        master.session_prepare(2, &[7u8; SESSION_KEY_SIZE]).unwrap();

        let spawned = SpawnedSession::new(SessionOptions::new(2, 0), 2);
        let mut key: &[u8] = &[8u8; SESSION_KEY_SIZE];
        let exit = spawned.run(&host, &mut key, &CancelToken::new());
        assert_eq!(exit, SessionExit::Init);
        assert_eq!(
            host.count(|e| matches!(e, HostEvent::SessionAccepted { .. })),
            0
        );
    }

    #[test]
    fn test_short_key_is_init_failure() {
        let host = LoopbackHost::new(0);
        let spawned = SpawnedSession::new(SessionOptions::new(1, 0), 2);
        let mut key: &[u8] = &[1, 2, 3];
        assert_eq!(
            spawned.run(&host, &mut key, &CancelToken::new()),
            SessionExit::Init
        );
    }

    #[test]
    fn test_restore_drops_processes_and_files() {
        let host = LoopbackHost::new(0);
        let dir = tempfile::tempdir().unwrap();
        let spawned = SpawnedSession::new(SessionOptions::new(6, 0), PROTOCOL_VERSION);
        let session = GuestSession::new(spawned.options.clone());
        let channel = host.connect().unwrap();
        let mut key: &[u8] = &[0u8; SESSION_KEY_SIZE];
        let ctx = spawned.authenticate(&channel, &mut key).unwrap();
        let shutdown = CancelToken::new();

        let open = context::make(6, 1, 1);
        let (first, second) = (context::make(6, 2, 1), context::make(6, 3, 1));
        let (exit, handle, pids) = std::thread::scope(|s| {
            let serving = s.spawn(|| spawned.serve(ctx, &session, &shutdown));

            let params = FileOpenParams {
                file_name: dir.path().join("f").to_str().unwrap().into(),
                access: "w".into(),
                disposition: "ca".into(),
                ..Default::default()
            };
            assert!(host.post_to_session(6, open, HostMessage::FileOpen(params)));
            let handle = match reply(&host, open) {
                GuestReply::File(FileReply::Open { rc: 0, handle }) => handle,
                other => panic!("open failed: {:?}", other),
            };
            let mut pids = Vec::new();
            for context_id in [first, second] {
                assert!(host.post_to_session(6, context_id, sleeper()));
                match reply(&host, context_id) {
                    GuestReply::ProcStatus {
                        pid,
                        status: ProcStatus::Started,
                        ..
                    } => pids.push(pid),
                    other => panic!("not started: {:?}", other),
                }
            }
            assert_eq!(session.file_count(), 1);
            assert_eq!(session.process_count(), 2);

            host.restore();
            (serving.join().unwrap(), handle, pids)
        });

        assert_eq!(exit, SessionExit::Success);
        assert_eq!(session.file_count(), 0);
        assert_eq!(session.process_count(), 0);
        for context_id in [first, second] {
            assert_eq!(host.replies_for(context_id).len(), 2);
            assert!(matches!(
                host.replies_for(context_id)[1],
                GuestReply::ProcStatus {
                    status: ProcStatus::Down,
                    ..
                }
            ));
        }

        // Requests for the old IDs find nothing.
        let mut epoch = host.restore_id();
        let mut ctx = HostCtx::new(channel.clone(), PROTOCOL_VERSION, 0);
        let mut scratch = ScratchBuffer::new();
        let stale = [
            (context::make(6, 4, 1), HostMessage::FileTell { handle }),
            (
                context::make(6, 5, 1),
                HostMessage::ExecGetOutput {
                    pid: pids[0],
                    handle: guestctl_proto::msg::output_handle::STDOUT,
                    flags: 0,
                },
            ),
        ];
        for (context_id, message) in stale {
            host.post(channel.client_id(), context_id, message);
            ctx.set_peeked(channel.peek_wait(&mut epoch).unwrap());
            assert!(session.dispatch(&mut ctx, &mut scratch).is_err());
        }
        assert!(matches!(
            host.replies_for(context::make(6, 4, 1))[..],
            [GuestReply::File(FileReply::Tell { rc, .. })] if rc == ErrorCode::NotFound.to_raw()
        ));
        assert_eq!(
            host.replies_for(context::make(6, 5, 1)),
            [GuestReply::Generic {
                rc: ErrorCode::ProcessNotFound.to_raw(),
                kind: 0,
                payload: Vec::new()
            }]
        );
    }

    #[test]
    fn test_gives_up_after_repeated_peek_failures() {
        let host = LoopbackHost::new(0);
        host.fail_next_peeks(10);
        let mut spawned = SpawnedSession::new(SessionOptions::new(4, 0), 2);
        spawned.retry_delay = Duration::from_millis(10);
        let mut key: &[u8] = &[0u8; SESSION_KEY_SIZE];
        assert_eq!(
            spawned.run(&host, &mut key, &CancelToken::new()),
            SessionExit::Failure
        );
        assert!(host
            .events()
            .iter()
            .any(|e| matches!(e, HostEvent::FilterSet { .. })));
    }
}
