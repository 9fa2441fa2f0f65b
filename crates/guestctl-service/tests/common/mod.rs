#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use guestctl_proto::{
    GuestReply, HostChannel, HostCtx, HostEvent, HostMessage, LoopbackHost, ProcStartupInfo,
    ProcStatus, Result, PROTOCOL_VERSION,
};
use guestctl_service::{Flow, GuestSession, ScratchBuffer, SessionOptions};

pub const WAIT: Duration = Duration::from_secs(20);

/// A session wired to a loopback host, driven one message at a time.
pub struct Rig {
    pub host: LoopbackHost,
    pub channel: Arc<dyn HostChannel>,
    pub client: u32,
    pub session: Arc<GuestSession>,
    pub scratch: ScratchBuffer,
    features: u64,
    epoch: u64,
}

impl Rig {
    pub fn new(flags: u32, features: u64) -> Rig {
        Self::with_options(SessionOptions::new(1, flags), features)
    }

    pub fn with_options(options: SessionOptions, features: u64) -> Rig {
        let host = LoopbackHost::new(features);
        let channel: Arc<dyn HostChannel> = host.connect_client().unwrap();
        let client = channel.client_id();
        Rig {
            host,
            channel,
            client,
            session: GuestSession::new(options),
            scratch: ScratchBuffer::new(),
            features,
            epoch: 0,
        }
    }

    /// Posts `message` and lets the session handle it.
    pub fn send(&mut self, context_id: u32, message: HostMessage) -> Result<Flow> {
        self.host.post(self.client, context_id, message);
        let peeked = self.channel.peek_wait(&mut self.epoch)?;
        let mut ctx = HostCtx::new(self.channel.clone(), PROTOCOL_VERSION, self.features);
        ctx.set_peeked(peeked);
        self.session.dispatch(&mut ctx, &mut self.scratch)
    }

    pub fn replies(&self, context_id: u32) -> Vec<GuestReply> {
        self.host.replies_for(context_id)
    }

    /// Waits for the first reply on `context_id` matching `pred`.
    pub fn wait_reply(
        &self,
        context_id: u32,
        pred: impl Fn(&GuestReply) -> bool,
    ) -> Option<GuestReply> {
        self.host
            .wait_for(WAIT, |e| match e {
                HostEvent::Reply {
                    context_id: c,
                    reply,
                    ..
                } => *c == context_id && pred(reply),
                _ => false,
            })
            .and_then(|e| match e {
                HostEvent::Reply { reply, .. } => Some(reply),
                _ => None,
            })
    }

    /// Starts a process and returns the guest PID from its started status.
    pub fn start(&mut self, context_id: u32, info: ProcStartupInfo) -> u32 {
        self.send(context_id, HostMessage::ExecCmd(info)).unwrap();
        match self.wait_reply(context_id, |r| {
            matches!(r, GuestReply::ProcStatus { status: ProcStatus::Started, .. })
        }) {
            Some(GuestReply::ProcStatus { pid, .. }) => pid,
            other => panic!("no started status: {:?}", other),
        }
    }

    /// Waits for the final status reported for the process started on
    /// `context_id`.
    pub fn final_status(&self, context_id: u32) -> (ProcStatus, u32) {
        match self.wait_reply(context_id, |r| {
            matches!(r, GuestReply::ProcStatus { status, .. } if *status != ProcStatus::Started)
        }) {
            Some(GuestReply::ProcStatus { status, flags, .. }) => (status, flags),
            other => panic!("no final status: {:?}", other),
        }
    }
}

pub fn shell(script: &str, flags: u32, timeout_ms: u32) -> ProcStartupInfo {
    ProcStartupInfo {
        cmd: "/bin/sh".into(),
        args: format!("-c '{}'", script),
        flags,
        timeout_ms,
        ..Default::default()
    }
}
