//! In-process host used to drive the guest side without a hypervisor.
//!
//! It keeps one message queue per client, records everything the guest sends
//! back, and can inject VM restores and wait cancellations.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::channel::{Connector, Fetched, HostChannel, Peeked};
use crate::context;
use crate::error::{ErrorCode, Result};
use crate::msg::{HostMsgKind, SessionNotifyType};
use crate::params::{GuestReply, HostMessage};

/// Everything the guest told the host, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Connected { client: u32 },
    Disconnected { client: u32 },
    MadeMaster { client: u32 },
    FeaturesReported { client: u32, guest: u64 },
    Reply { client: u32, context_id: u32, reply: GuestReply },
    Skipped { client: u32, msg: u32, rc: i32 },
    FilterSet { client: u32, value: u32 },
    SessionPrepared { session_id: u32 },
    SessionAccepted { client: u32, session_id: u32 },
    SessionCancelled { session_id: u32 },
    SessionChanged { client: u32, new_id: u64 },
    SessionCloseRequested { context_id: u32, flags: u32 },
    SessionNotify { client: u32, context_id: u32, kind: SessionNotifyType, result: i32 },
}

struct Queued {
    context_id: u32,
    raw: u32,
    message: Option<HostMessage>,
}

struct ClientState {
    queue: VecDeque<Queued>,
    cancelled: bool,
    connected: bool,
    session: Option<u32>,
    filter: Option<u32>,
}

struct HostState {
    host_features: u64,
    restore_id: u64,
    next_client_id: u32,
    master: Option<u32>,
    clients: BTreeMap<u32, ClientState>,
    prepared: HashMap<u32, Vec<u8>>,
    events: Vec<HostEvent>,
    failing_prepares: u32,
    failing_peeks: u32,
    refuse_connections: bool,
    legacy_session_close: bool,
    silent_restore: bool,
}

struct Shared {
    state: Mutex<HostState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, state: &mut HostState, event: HostEvent) {
        state.events.push(event);
        self.cond.notify_all();
    }
}

#[derive(Clone)]
pub struct LoopbackHost {
    shared: Arc<Shared>,
}

impl LoopbackHost {
    pub fn new(host_features: u64) -> Self {
        LoopbackHost {
            shared: Arc::new(Shared {
                state: Mutex::new(HostState {
                    host_features,
                    restore_id: 1,
                    next_client_id: 1,
                    master: None,
                    clients: BTreeMap::new(),
                    prepared: HashMap::new(),
                    events: Vec::new(),
                    failing_prepares: 0,
                    failing_peeks: 0,
                    refuse_connections: false,
                    legacy_session_close: false,
                    silent_restore: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn connect_client(&self) -> Result<Arc<LoopbackChannel>> {
        let mut state = self.shared.lock();
        if state.refuse_connections {
            return Err(ErrorCode::Disconnected);
        }
        let client_id = state.next_client_id;
        state.next_client_id += 1;
        state.clients.insert(
            client_id,
            ClientState {
                queue: VecDeque::new(),
                cancelled: false,
                connected: true,
                session: None,
                filter: None,
            },
        );
        self.shared
            .record(&mut state, HostEvent::Connected { client: client_id });
        Ok(Arc::new(LoopbackChannel {
            shared: self.shared.clone(),
            client_id,
        }))
    }

    pub fn master(&self) -> Option<u32> {
        self.shared.lock().master
    }

    pub fn restore_id(&self) -> u64 {
        self.shared.lock().restore_id
    }

    /// Queues a message for one client.
    pub fn post(&self, client: u32, context_id: u32, message: HostMessage) {
        let raw = message.kind() as u32;
        self.push(client, context_id, raw, Some(message));
    }

    /// Queues a message kind this host invented after the guest was built.
    pub fn post_unknown(&self, client: u32, context_id: u32, raw: u32) {
        self.push(client, context_id, raw, None);
    }

    /// Queues a message for whichever client serves `session_id`.
    pub fn post_to_session(&self, session_id: u32, context_id: u32, message: HostMessage) -> bool {
        let client = {
            let state = self.shared.lock();
            state
                .clients
                .iter()
                .find(|(_, c)| {
                    c.connected && (c.session == Some(session_id) || c.filter == Some(session_id))
                })
                .map(|(id, _)| *id)
        };
        match client {
            Some(client) => {
                self.post(client, context_id, message);
                true
            }
            None => false,
        }
    }

    fn push(&self, client: u32, context_id: u32, raw: u32, message: Option<HostMessage>) {
        let mut state = self.shared.lock();
        if let Some(c) = state.clients.get_mut(&client) {
            c.queue.push_back(Queued {
                context_id,
                raw,
                message,
            });
        }
        self.shared.cond.notify_all();
    }

    /// Simulates restoring a VM snapshot: a new epoch and empty queues.
    pub fn restore(&self) {
        let mut state = self.shared.lock();
        state.restore_id += 1;
        state.silent_restore = false;
        for client in state.clients.values_mut() {
            client.queue.clear();
        }
        self.shared.cond.notify_all();
    }

    pub fn fail_next_prepares(&self, count: u32) {
        self.shared.lock().failing_prepares = count;
    }

    /// Makes the next `count` peeks fail with `Internal`.
    pub fn fail_next_peeks(&self, count: u32) {
        self.shared.lock().failing_peeks = count;
    }

    /// Changes the VM session ID without telling waiting peeks, like a
    /// reset the host could not announce.
    pub fn change_session_silently(&self) -> u64 {
        let mut state = self.shared.lock();
        state.restore_id += 1;
        state.silent_restore = true;
        state.restore_id
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.lock().refuse_connections = refuse;
    }

    /// Makes `session_close` answer `NotSupported`, like hosts predating it.
    pub fn set_legacy_session_close(&self, legacy: bool) {
        self.shared.lock().legacy_session_close = legacy;
    }

    pub fn prepared_key(&self, session_id: u32) -> Option<Vec<u8>> {
        self.shared.lock().prepared.get(&session_id).cloned()
    }

    pub fn queued(&self, client: u32) -> usize {
        self.shared
            .lock()
            .clients
            .get(&client)
            .map(|c| c.queue.len())
            .unwrap_or(0)
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.shared.lock().events.clone()
    }

    pub fn count(&self, pred: impl Fn(&HostEvent) -> bool) -> usize {
        self.shared.lock().events.iter().filter(|e| pred(e)).count()
    }

    /// Replies sent for one context ID.
    pub fn replies_for(&self, context_id: u32) -> Vec<GuestReply> {
        self.shared
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                HostEvent::Reply {
                    context_id: c,
                    reply,
                    ..
                } if *c == context_id => Some(reply.clone()),
                _ => None,
            })
            .collect()
    }

    /// Blocks until an event matching `pred` has been recorded.
    pub fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(&HostEvent) -> bool,
    ) -> Option<HostEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if let Some(event) = state.events.iter().find(|e| pred(e)) {
                return Some(event.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Blocks until the client has consumed its whole queue.
    pub fn wait_drained(&self, client: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            let empty = state
                .clients
                .get(&client)
                .map(|c| c.queue.is_empty())
                .unwrap_or(true);
            if empty {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl Connector for LoopbackHost {
    fn connect(&self) -> Result<Arc<dyn HostChannel>> {
        let channel: Arc<dyn HostChannel> = self.connect_client()?;
        Ok(channel)
    }
}

pub struct LoopbackChannel {
    shared: Arc<Shared>,
    client_id: u32,
}

impl LoopbackChannel {
    fn with_client<T>(&self, f: impl FnOnce(&mut HostState, u32) -> Result<T>) -> Result<T> {
        let mut state = self.shared.lock();
        match state.clients.get(&self.client_id) {
            Some(c) if c.connected => {}
            _ => return Err(ErrorCode::Disconnected),
        }
        f(&mut state, self.client_id)
    }
}

fn client(state: &mut HostState, id: u32) -> &mut ClientState {
    state
        .clients
        .get_mut(&id)
        .unwrap_or_else(|| unreachable!("client {} checked by with_client", id))
}

impl HostChannel for LoopbackChannel {
    fn client_id(&self) -> u32 {
        self.client_id
    }

    fn make_master(&self) -> Result<()> {
        self.with_client(|state, id| match state.master {
            Some(master) if master != id => Err(ErrorCode::AccessDenied),
            _ => {
                state.master = Some(id);
                self.shared.record(state, HostEvent::MadeMaster { client: id });
                Ok(())
            }
        })
    }

    fn report_features(&self, guest_features: u64) -> Result<u64> {
        self.with_client(|state, id| {
            self.shared.record(
                state,
                HostEvent::FeaturesReported {
                    client: id,
                    guest: guest_features,
                },
            );
            Ok(state.host_features)
        })
    }

    fn query_features(&self) -> Result<u64> {
        self.with_client(|state, _| Ok(state.host_features))
    }

    fn query_session_id(&self) -> Result<u64> {
        self.with_client(|state, _| Ok(state.restore_id))
    }

    fn peek_wait(&self, restore_check: &mut u64) -> Result<Peeked> {
        let mut state = self.shared.lock();
        if state.failing_peeks > 0 {
            state.failing_peeks -= 1;
            return Err(ErrorCode::Internal);
        }
        if *restore_check == 0 {
            *restore_check = state.restore_id;
        }
        loop {
            if *restore_check != state.restore_id && !state.silent_restore {
                *restore_check = state.restore_id;
                return Err(ErrorCode::VmRestored);
            }
            let c = match state.clients.get_mut(&self.client_id) {
                Some(c) if c.connected => c,
                _ => return Err(ErrorCode::Disconnected),
            };
            if c.cancelled {
                c.cancelled = false;
                return Ok(Peeked {
                    msg: HostMsgKind::CancelPendingWaits as u32,
                    num_parms: 0,
                });
            }
            if let Some(front) = c.queue.front() {
                return Ok(Peeked {
                    msg: front.raw,
                    num_parms: front.message.as_ref().map(|m| m.num_parms()).unwrap_or(0),
                });
            }
            state = self
                .shared
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn get(&self, msg: u32, max_payload: usize) -> Result<Fetched> {
        self.with_client(|state, id| {
            let c = client(state, id);
            let front = c.queue.front().ok_or(ErrorCode::TryAgain)?;
            if front.raw != msg {
                return Err(ErrorCode::Mismatch);
            }
            let Some(message) = &front.message else {
                return Err(ErrorCode::NotSupported);
            };
            if message.payload_len() > max_payload {
                return Ok(Fetched::Overflow {
                    needed: message.payload_len(),
                });
            }
            let queued = c.queue.pop_front().ok_or(ErrorCode::TryAgain)?;
            self.shared.cond.notify_all();
            match queued.message {
                Some(message) => Ok(Fetched::Message {
                    context_id: queued.context_id,
                    message,
                }),
                None => Err(ErrorCode::NotSupported),
            }
        })
    }

    fn reply(&self, context_id: u32, reply: GuestReply) -> Result<()> {
        self.with_client(|state, id| {
            self.shared.record(
                state,
                HostEvent::Reply {
                    client: id,
                    context_id,
                    reply,
                },
            );
            Ok(())
        })
    }

    fn skip(&self, rc: i32, msg: u32) -> Result<()> {
        self.with_client(|state, id| {
            let c = client(state, id);
            match c.queue.front() {
                Some(front) if front.raw == msg => {
                    c.queue.pop_front();
                }
                Some(_) => return Err(ErrorCode::Mismatch),
                None => return Err(ErrorCode::NotFound),
            }
            self.shared
                .record(state, HostEvent::Skipped { client: id, msg, rc });
            Ok(())
        })
    }

    fn skip_old(&self) -> Result<()> {
        self.with_client(|state, id| {
            let c = client(state, id);
            let front = c.queue.pop_front().ok_or(ErrorCode::NotFound)?;
            self.shared.record(
                state,
                HostEvent::Skipped {
                    client: id,
                    msg: front.raw,
                    rc: ErrorCode::NotSupported.to_raw(),
                },
            );
            Ok(())
        })
    }

    fn cancel_pending_waits(&self) -> Result<()> {
        self.with_client(|state, id| {
            client(state, id).cancelled = true;
            self.shared.cond.notify_all();
            Ok(())
        })
    }

    fn set_filter(&self, value: u32, _mask_add: u32, _mask_remove: u32) -> Result<()> {
        self.with_client(|state, id| {
            client(state, id).filter = Some(context::session_id_of(value));
            self.shared
                .record(state, HostEvent::FilterSet { client: id, value });
            Ok(())
        })
    }

    fn session_prepare(&self, session_id: u32, key: &[u8]) -> Result<()> {
        self.with_client(|state, _| {
            if state.failing_prepares > 0 {
                state.failing_prepares -= 1;
                return Err(ErrorCode::OutOfResources);
            }
            state.prepared.insert(session_id, key.to_vec());
            self.shared
                .record(state, HostEvent::SessionPrepared { session_id });
            Ok(())
        })
    }

    fn session_accept(&self, session_id: u32, key: &[u8]) -> Result<()> {
        self.with_client(|state, id| {
            match state.prepared.get(&session_id) {
                Some(expected) if expected.as_slice() == key => {}
                Some(_) => return Err(ErrorCode::AccessDenied),
                None => return Err(ErrorCode::NotFound),
            }
            state.prepared.remove(&session_id);
            client(state, id).session = Some(session_id);
            self.shared.record(
                state,
                HostEvent::SessionAccepted {
                    client: id,
                    session_id,
                },
            );
            Ok(())
        })
    }

    fn session_cancel_prepared(&self, session_id: u32) -> Result<()> {
        self.with_client(|state, _| {
            state.prepared.remove(&session_id);
            self.shared
                .record(state, HostEvent::SessionCancelled { session_id });
            Ok(())
        })
    }

    fn session_has_changed(&self, new_session: u64) -> Result<()> {
        self.with_client(|state, id| {
            if new_session == state.restore_id {
                state.silent_restore = false;
            }
            self.shared.record(
                state,
                HostEvent::SessionChanged {
                    client: id,
                    new_id: new_session,
                },
            );
            Ok(())
        })
    }

    fn session_close(&self, context_id: u32, flags: u32) -> Result<()> {
        self.with_client(|state, _| {
            if state.legacy_session_close {
                return Err(ErrorCode::NotSupported);
            }
            self.shared
                .record(state, HostEvent::SessionCloseRequested { context_id, flags });
            let session_id = context::session_id_of(context_id);
            let target = state.clients.values_mut().find(|c| {
                c.connected && (c.session == Some(session_id) || c.filter == Some(session_id))
            });
            match target {
                Some(c) => {
                    c.queue.push_back(Queued {
                        context_id,
                        raw: HostMsgKind::SessionClose as u32,
                        message: Some(HostMessage::SessionClose { flags, session_id }),
                    });
                    self.shared.cond.notify_all();
                    Ok(())
                }
                None => Err(ErrorCode::NotFound),
            }
        })
    }

    fn session_notify(&self, context_id: u32, kind: SessionNotifyType, result: i32) -> Result<()> {
        self.with_client(|state, id| {
            self.shared.record(
                state,
                HostEvent::SessionNotify {
                    client: id,
                    context_id,
                    kind,
                    result,
                },
            );
            Ok(())
        })
    }

    fn disconnect(&self) -> Result<()> {
        self.with_client(|state, id| {
            client(state, id).connected = false;
            if state.master == Some(id) {
                state.master = None;
            }
            self.shared
                .record(state, HostEvent::Disconnected { client: id });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::host_features;

    #[test]
    fn test_peek_get_in_order() {
        let host = LoopbackHost::new(host_features::OPTIMIZATIONS);
        let channel = host.connect_client().unwrap();
        let id = channel.client_id();
        host.post(id, 11, HostMessage::FileTell { handle: 1 });
        host.post(id, 12, HostMessage::FileClose { handle: 1 });

        let mut restore = 0;
        let peeked = channel.peek_wait(&mut restore).unwrap();
        assert_eq!(peeked.msg, HostMsgKind::FileTell as u32);
        assert_eq!(peeked.num_parms, 2);
        assert_eq!(restore, host.restore_id());

        // Peeking does not consume.
        assert_eq!(channel.peek_wait(&mut restore).unwrap(), peeked);
        assert_eq!(
            channel.get(HostMsgKind::FileClose as u32, 0),
            Err(ErrorCode::Mismatch)
        );
        let fetched = channel.get(peeked.msg, 0).unwrap();
        assert!(matches!(fetched, Fetched::Message { context_id: 11, .. }));
        assert_eq!(host.queued(id), 1);
    }

    #[test]
    fn test_overflow_keeps_message() {
        let host = LoopbackHost::new(0);
        let channel = host.connect_client().unwrap();
        host.post(
            channel.client_id(),
            1,
            HostMessage::FileWrite {
                handle: 3,
                data: vec![0; 100],
            },
        );
        let msg = HostMsgKind::FileWrite as u32;
        assert_eq!(channel.get(msg, 10).unwrap(), Fetched::Overflow { needed: 100 });
        assert!(matches!(channel.get(msg, 100).unwrap(), Fetched::Message { .. }));
    }

    #[test]
    fn test_cancel_releases_blocked_peek() {
        let host = LoopbackHost::new(0);
        let channel = host.connect_client().unwrap();
        let waiter = {
            let channel = channel.clone();
            std::thread::spawn(move || {
                let mut restore = 0;
                channel.peek_wait(&mut restore)
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        channel.cancel_pending_waits().unwrap();
        let peeked = waiter.join().unwrap().unwrap();
        assert_eq!(peeked.msg, HostMsgKind::CancelPendingWaits as u32);
    }

    #[test]
    fn test_restore_is_reported_once() {
        let host = LoopbackHost::new(0);
        let channel = host.connect_client().unwrap();
        let mut restore = 0;
        host.post(channel.client_id(), 1, HostMessage::PathUserHome);
        channel.peek_wait(&mut restore).unwrap();

        host.restore();
        assert_eq!(channel.peek_wait(&mut restore), Err(ErrorCode::VmRestored));
        assert_eq!(restore, host.restore_id());
        assert_eq!(host.queued(channel.client_id()), 0);
    }

    #[test]
    fn test_session_accept_requires_prepared_key() {
        let host = LoopbackHost::new(host_features::OPTIMIZATIONS);
        let master = host.connect_client().unwrap();
        let child = host.connect_client().unwrap();

        assert_eq!(child.session_accept(4, b"key"), Err(ErrorCode::NotFound));
        master.session_prepare(4, b"key").unwrap();
        assert_eq!(child.session_accept(4, b"bad"), Err(ErrorCode::AccessDenied));
        child.session_accept(4, b"key").unwrap();

        let ctx = context::session_context(4);
        master.session_close(ctx, 0).unwrap();
        let mut restore = 0;
        let peeked = child.peek_wait(&mut restore).unwrap();
        assert_eq!(peeked.msg, HostMsgKind::SessionClose as u32);
    }
}
