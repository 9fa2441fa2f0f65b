use std::sync::Arc;

use crate::error::{ErrorCode, Result};
use crate::msg::{host_features, HostMsgKind, InputStatus, ProcStatus, SessionNotifyType};
use crate::params::{FileReply, GuestReply, HostMessage};

/// Result of waiting for the next host message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peeked {
    /// Raw message kind, may be unknown to this guest.
    pub msg: u32,
    pub num_parms: u32,
}

/// Result of fetching a peeked message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Message { context_id: u32, message: HostMessage },
    /// The body does not fit; the message stays queued.
    Overflow { needed: usize },
}

/// A connected client of the host's guest control service.
///
/// Every call is synchronous. `peek_wait` may block indefinitely and must be
/// releasable by `cancel_pending_waits` from another thread.
pub trait HostChannel: Send + Sync {
    fn client_id(&self) -> u32;

    fn make_master(&self) -> Result<()>;

    /// Reports the guest features, returns the host features.
    fn report_features(&self, guest_features: u64) -> Result<u64>;

    fn query_features(&self) -> Result<u64>;

    /// Current VM session ID, changes whenever the VM is restored or reset.
    fn query_session_id(&self) -> Result<u64>;

    /// Blocks until a message is queued. `restore_check` carries the VM
    /// session epoch; on `VmRestored` it is updated to the new epoch.
    fn peek_wait(&self, restore_check: &mut u64) -> Result<Peeked>;

    fn get(&self, msg: u32, max_payload: usize) -> Result<Fetched>;

    fn reply(&self, context_id: u32, reply: GuestReply) -> Result<()>;

    fn skip(&self, rc: i32, msg: u32) -> Result<()>;

    /// Skip for hosts without the optimizations feature.
    fn skip_old(&self) -> Result<()>;

    fn cancel_pending_waits(&self) -> Result<()>;

    fn set_filter(&self, value: u32, mask_add: u32, mask_remove: u32) -> Result<()>;

    fn session_prepare(&self, session_id: u32, key: &[u8]) -> Result<()>;

    fn session_accept(&self, session_id: u32, key: &[u8]) -> Result<()>;

    fn session_cancel_prepared(&self, session_id: u32) -> Result<()>;

    fn session_has_changed(&self, new_session: u64) -> Result<()>;

    /// Asks the host to close a spawned session.
    fn session_close(&self, context_id: u32, flags: u32) -> Result<()>;

    fn session_notify(&self, context_id: u32, kind: SessionNotifyType, result: i32) -> Result<()>;

    fn disconnect(&self) -> Result<()>;
}

/// Opens new clients, used at start-up and on reconnect.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn HostChannel>>;
}

/// Per-message host context: which client it arrived on, its context ID,
/// and what the host can do.
#[derive(Clone)]
pub struct HostCtx {
    channel: Arc<dyn HostChannel>,
    pub msg: u32,
    pub context_id: u32,
    pub protocol: u32,
    pub num_parms: u32,
    pub host_features: u64,
}

impl HostCtx {
    pub fn new(channel: Arc<dyn HostChannel>, protocol: u32, host_features: u64) -> Self {
        HostCtx {
            channel,
            msg: 0,
            context_id: 0,
            protocol,
            num_parms: 0,
            host_features,
        }
    }

    /// Context for an unsolicited call on behalf of `context_id`.
    pub fn with_context(&self, context_id: u32) -> Self {
        let mut ctx = self.clone();
        ctx.context_id = context_id;
        ctx
    }

    pub fn channel(&self) -> &Arc<dyn HostChannel> {
        &self.channel
    }

    pub fn client_id(&self) -> u32 {
        self.channel.client_id()
    }

    pub fn supports_optimizations(&self) -> bool {
        self.host_features & host_features::OPTIMIZATIONS != 0
    }

    pub fn has_host_feature(&self, feature: u64) -> bool {
        self.host_features & feature != 0
    }

    pub fn set_peeked(&mut self, peeked: Peeked) {
        self.msg = peeked.msg;
        self.num_parms = peeked.num_parms;
    }

    /// Fetches the current message, reporting an oversized body.
    pub fn fetch(&mut self, kind: HostMsgKind, max_payload: usize) -> Result<Fetched> {
        let fetched = self.channel.get(kind as u32, max_payload)?;
        if let Fetched::Message { context_id, message } = &fetched {
            if message.kind() != kind {
                return Err(ErrorCode::Mismatch);
            }
            self.context_id = *context_id;
        }
        Ok(fetched)
    }

    /// Fetches a message that carries no variable-length body.
    pub fn get_message(&mut self, kind: HostMsgKind) -> Result<HostMessage> {
        match self.fetch(kind, usize::MAX)? {
            Fetched::Message { message, .. } => Ok(message),
            Fetched::Overflow { .. } => Err(ErrorCode::BufferOverflow),
        }
    }

    pub fn reply(&self, reply: GuestReply) -> Result<()> {
        self.channel.reply(self.context_id, reply)
    }

    pub fn reply_rc(&self, rc: i32) -> Result<()> {
        self.reply_payload(rc, 0, Vec::new())
    }

    pub fn reply_payload(&self, rc: i32, kind: u32, payload: Vec<u8>) -> Result<()> {
        self.reply(GuestReply::Generic { rc, kind, payload })
    }

    pub fn file_reply(&self, reply: FileReply) -> Result<()> {
        self.reply(GuestReply::File(reply))
    }

    pub fn proc_status(&self, pid: u32, status: ProcStatus, flags: u32) -> Result<()> {
        self.reply(GuestReply::ProcStatus {
            pid,
            status,
            flags,
            data: Vec::new(),
        })
    }

    pub fn proc_output(&self, pid: u32, handle: u32, flags: u32, data: Vec<u8>) -> Result<()> {
        self.reply(GuestReply::ProcOutput {
            pid,
            handle,
            flags,
            data,
        })
    }

    pub fn proc_input_status(
        &self,
        pid: u32,
        status: InputStatus,
        flags: u32,
        written: u32,
    ) -> Result<()> {
        self.reply(GuestReply::ProcInputStatus {
            pid,
            status,
            flags,
            written,
        })
    }

    /// Skips the current message, picking the call the host understands.
    pub fn skip(&self, rc: i32) -> Result<()> {
        if self.supports_optimizations() {
            self.channel.skip(rc, self.msg)
        } else {
            self.channel.skip_old()
        }
    }

    pub fn session_notify(&self, kind: SessionNotifyType, result: i32) -> Result<()> {
        self.channel.session_notify(self.context_id, kind, result)
    }

    pub fn session_close(&self, flags: u32) -> Result<()> {
        self.channel.session_close(self.context_id, flags)
    }
}

impl std::fmt::Debug for HostCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostCtx")
            .field("client_id", &self.channel.client_id())
            .field("msg", &self.msg)
            .field("context_id", &self.context_id)
            .field("protocol", &self.protocol)
            .finish()
    }
}
