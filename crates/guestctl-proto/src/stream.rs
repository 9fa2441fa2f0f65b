use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use serde::de::DeserializeOwned;

use crate::channel::{Connector, Fetched, HostChannel, Peeked};
use crate::error::{ErrorCode, Result};
use crate::msg::SessionNotifyType;
use crate::params::GuestReply;
use crate::wire::{
    CallFrame, ConnectData, FeaturesData, GetData, GuestCall, OverflowData, PeekData,
    ResponseFrame, RestoredData, SessionIdData,
};

pub const DEFAULT_VSOCK_CID: u32 = 2;
pub const DEFAULT_VSOCK_PORT: u32 = 1024;

const CONNECT_ATTEMPTS: u32 = 10;

/// Where the host's guest control service listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelAddress {
    Vsock { cid: u32, port: u32 },
    Unix(PathBuf),
    Tcp(String),
}

impl Default for ChannelAddress {
    fn default() -> Self {
        ChannelAddress::Vsock {
            cid: DEFAULT_VSOCK_CID,
            port: DEFAULT_VSOCK_PORT,
        }
    }
}

impl FromStr for ChannelAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("expected SCHEME:ADDRESS, got '{}'", s))?;
        match scheme {
            "vsock" => {
                let (cid, port) = rest
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("expected vsock:CID:PORT, got '{}'", s))?;
                let cid = cid
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid vsock CID: '{}'", cid))?;
                let port = port
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid vsock port: '{}'", port))?;
                Ok(ChannelAddress::Vsock { cid, port })
            }
            "unix" if !rest.is_empty() => Ok(ChannelAddress::Unix(PathBuf::from(rest))),
            "tcp" if rest.contains(':') => Ok(ChannelAddress::Tcp(rest.to_string())),
            _ => anyhow::bail!("unsupported channel address: '{}'", s),
        }
    }
}

impl std::fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelAddress::Vsock { cid, port } => write!(f, "vsock:{}:{}", cid, port),
            ChannelAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            ChannelAddress::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

enum Transport {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Transport {
    fn connect(address: &ChannelAddress) -> std::io::Result<Transport> {
        match address {
            ChannelAddress::Vsock { cid, port } => connect_vsock(*cid, *port).map(Transport::Unix),
            ChannelAddress::Unix(path) => UnixStream::connect(path).map(Transport::Unix),
            ChannelAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str())?;
                stream.set_nodelay(true)?;
                Ok(Transport::Tcp(stream))
            }
        }
    }

    fn try_clone(&self) -> std::io::Result<Transport> {
        match self {
            Transport::Unix(s) => s.try_clone().map(Transport::Unix),
            Transport::Tcp(s) => s.try_clone().map(Transport::Tcp),
        }
    }

    fn shutdown(&self) {
        let result = match self {
            Transport::Unix(s) => s.shutdown(Shutdown::Both),
            Transport::Tcp(s) => s.shutdown(Shutdown::Both),
        };
        if let Err(e) = result {
            tracing::debug!("transport shutdown: {}", e);
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Unix(s) => s.read(buf),
            Transport::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Unix(s) => s.write(buf),
            Transport::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Unix(s) => s.flush(),
            Transport::Tcp(s) => s.flush(),
        }
    }
}

#[cfg(target_os = "linux")]
fn connect_vsock(cid: u32, port: u32) -> std::io::Result<UnixStream> {
    #[repr(C)]
    struct SockaddrVm {
        svm_family: libc::sa_family_t,
        svm_reserved1: u16,
        svm_port: u32,
        svm_cid: u32,
        svm_flags: u8,
        svm_zero: [u8; 3],
    }

    unsafe {
        let fd = libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let addr = SockaddrVm {
            svm_family: libc::AF_VSOCK as libc::sa_family_t,
            svm_reserved1: 0,
            svm_port: port,
            svm_cid: cid,
            svm_flags: 0,
            svm_zero: [0; 3],
        };

        let ret = libc::connect(
            fd,
            &addr as *const SockaddrVm as *const libc::sockaddr,
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        );
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        // SAFETY: fd is a connected stream socket we exclusively own
        Ok(UnixStream::from_raw_fd(fd))
    }
}

#[cfg(not(target_os = "linux"))]
fn connect_vsock(_cid: u32, _port: u32) -> std::io::Result<UnixStream> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "vsock is only available on Linux guests",
    ))
}

struct Pending {
    waiters: Mutex<HashMap<u64, Sender<ResponseFrame>>>,
    closed: AtomicBool,
}

impl Pending {
    fn close(&self) {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders fails every blocked caller.
        waiters.clear();
    }
}

/// Host channel speaking JSON lines over a stream socket.
///
/// A reader thread routes responses by sequence number, so one thread may
/// block in `peek_wait` while another cancels it.
pub struct StreamChannel {
    client_id: u32,
    writer: Mutex<Transport>,
    pending: Arc<Pending>,
    next_seq: AtomicU64,
    reader: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl StreamChannel {
    pub fn connect(address: &ChannelAddress) -> Result<StreamChannel> {
        let mut last_err = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match Transport::connect(address) {
                Ok(transport) => return StreamChannel::handshake(transport),
                Err(e) => {
                    tracing::debug!("connect attempt {} to {} failed: {}", attempt, address, e);
                    last_err = Some(e);
                    if attempt < CONNECT_ATTEMPTS {
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        }
        let err = last_err.map(ErrorCode::from).unwrap_or(ErrorCode::Disconnected);
        tracing::warn!(
            "failed to connect to {} after {} attempts: {}",
            address,
            CONNECT_ATTEMPTS,
            err
        );
        Err(err)
    }

    fn handshake(transport: Transport) -> Result<StreamChannel> {
        let read_half = transport.try_clone()?;
        let pending = Arc::new(Pending {
            waiters: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        let reader_pending = pending.clone();
        let reader = std::thread::Builder::new()
            .name("host-channel-rx".into())
            .spawn(move || read_responses(read_half, reader_pending))?;

        let mut channel = StreamChannel {
            client_id: 0,
            writer: Mutex::new(transport),
            pending,
            next_seq: AtomicU64::new(1),
            reader: Mutex::new(Some(reader)),
        };

        let data: ConnectData = channel.call_data(GuestCall::Connect)?;
        channel.client_id = data.client_id;
        tracing::debug!("connected to host as client {}", data.client_id);
        Ok(channel)
    }

    fn call(&self, call: GuestCall) -> Result<ResponseFrame> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        {
            let mut waiters = self
                .pending
                .waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.pending.closed.load(Ordering::SeqCst) {
                return Err(ErrorCode::Disconnected);
            }
            waiters.insert(seq, tx);
        }

        let line = serde_json::to_string(&CallFrame { seq, call: &call }).map_err(|e| {
            tracing::error!("failed to encode guest call: {}", e);
            ErrorCode::Internal
        })?;

        let written = {
            let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
            writeln!(writer, "{}", line).and_then(|_| writer.flush())
        };
        if let Err(e) = written {
            tracing::debug!("host channel write failed: {}", e);
            self.pending.close();
            return Err(ErrorCode::Disconnected);
        }

        rx.recv().map_err(|_| ErrorCode::Disconnected)
    }

    fn call_ok(&self, call: GuestCall) -> Result<serde_json::Value> {
        let frame = self.call(call)?;
        match ErrorCode::from_raw(frame.rc) {
            None => Ok(frame.data),
            Some(code) => Err(code),
        }
    }

    fn call_data<T: DeserializeOwned>(&self, call: GuestCall) -> Result<T> {
        decode(self.call_ok(call)?)
    }
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        tracing::warn!("malformed host response: {}", e);
        ErrorCode::Internal
    })
}

fn read_responses(transport: Transport, pending: Arc<Pending>) {
    let reader = BufReader::new(transport);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.is_empty() {
            continue;
        }

        let frame: ResponseFrame = match serde_json::from_str(&line) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("dropping malformed host line: {}", e);
                continue;
            }
        };

        let waiter = pending
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&frame.seq);
        match waiter {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    tracing::debug!("caller gave up waiting for a response");
                }
            }
            None => tracing::debug!("response for unknown call seq={}", frame.seq),
        }
    }
    tracing::debug!("host channel closed");
    pending.close();
}

impl HostChannel for StreamChannel {
    fn client_id(&self) -> u32 {
        self.client_id
    }

    fn make_master(&self) -> Result<()> {
        self.call_ok(GuestCall::MakeMaster).map(|_| ())
    }

    fn report_features(&self, guest_features: u64) -> Result<u64> {
        let data: FeaturesData = self.call_data(GuestCall::ReportFeatures {
            guest: guest_features,
        })?;
        Ok(data.host)
    }

    fn query_features(&self) -> Result<u64> {
        let data: FeaturesData = self.call_data(GuestCall::QueryFeatures)?;
        Ok(data.host)
    }

    fn query_session_id(&self) -> Result<u64> {
        let data: SessionIdData = self.call_data(GuestCall::QuerySessionId)?;
        Ok(data.session_id)
    }

    fn peek_wait(&self, restore_check: &mut u64) -> Result<Peeked> {
        let frame = self.call(GuestCall::PeekWait {
            restore_check: *restore_check,
        })?;
        match ErrorCode::from_raw(frame.rc) {
            None => {
                let data: PeekData = decode(frame.data)?;
                Ok(Peeked {
                    msg: data.msg,
                    num_parms: data.num_parms,
                })
            }
            Some(ErrorCode::VmRestored) => {
                let data: RestoredData = decode(frame.data)?;
                *restore_check = data.restore_id;
                Err(ErrorCode::VmRestored)
            }
            Some(code) => Err(code),
        }
    }

    fn get(&self, msg: u32, max_payload: usize) -> Result<Fetched> {
        let frame = self.call(GuestCall::Get {
            msg,
            max_payload: max_payload as u64,
        })?;
        match ErrorCode::from_raw(frame.rc) {
            None => {
                let data: GetData = decode(frame.data)?;
                Ok(Fetched::Message {
                    context_id: data.context_id,
                    message: data.message,
                })
            }
            Some(ErrorCode::BufferOverflow) => {
                let data: OverflowData = decode(frame.data)?;
                Ok(Fetched::Overflow {
                    needed: data.needed as usize,
                })
            }
            Some(code) => Err(code),
        }
    }

    fn reply(&self, context_id: u32, reply: GuestReply) -> Result<()> {
        self.call_ok(GuestCall::Reply { context_id, reply }).map(|_| ())
    }

    fn skip(&self, rc: i32, msg: u32) -> Result<()> {
        self.call_ok(GuestCall::Skip { rc, msg }).map(|_| ())
    }

    fn skip_old(&self) -> Result<()> {
        self.call_ok(GuestCall::SkipOld).map(|_| ())
    }

    fn cancel_pending_waits(&self) -> Result<()> {
        self.call_ok(GuestCall::CancelPendingWaits).map(|_| ())
    }

    fn set_filter(&self, value: u32, mask_add: u32, mask_remove: u32) -> Result<()> {
        self.call_ok(GuestCall::FilterSet {
            value,
            mask_add,
            mask_remove,
        })
        .map(|_| ())
    }

    fn session_prepare(&self, session_id: u32, key: &[u8]) -> Result<()> {
        self.call_ok(GuestCall::SessionPrepare {
            session_id,
            key: key.to_vec(),
        })
        .map(|_| ())
    }

    fn session_accept(&self, session_id: u32, key: &[u8]) -> Result<()> {
        self.call_ok(GuestCall::SessionAccept {
            session_id,
            key: key.to_vec(),
        })
        .map(|_| ())
    }

    fn session_cancel_prepared(&self, session_id: u32) -> Result<()> {
        self.call_ok(GuestCall::SessionCancelPrepared { session_id })
            .map(|_| ())
    }

    fn session_has_changed(&self, new_session: u64) -> Result<()> {
        self.call_ok(GuestCall::SessionHasChanged {
            new_id: new_session,
        })
        .map(|_| ())
    }

    fn session_close(&self, context_id: u32, flags: u32) -> Result<()> {
        self.call_ok(GuestCall::SessionClose { context_id, flags })
            .map(|_| ())
    }

    fn session_notify(&self, context_id: u32, kind: SessionNotifyType, result: i32) -> Result<()> {
        self.call_ok(GuestCall::SessionNotify {
            context_id,
            kind,
            result,
        })
        .map(|_| ())
    }

    fn disconnect(&self) -> Result<()> {
        let result = self.call_ok(GuestCall::Disconnect).map(|_| ());
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
        result
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            if handle.join().is_err() {
                tracing::warn!("channel reader thread panicked");
            }
        }
    }
}

/// Opens [`StreamChannel`] clients for one address.
pub struct StreamConnector {
    address: ChannelAddress,
}

impl StreamConnector {
    pub fn new(address: ChannelAddress) -> Self {
        StreamConnector { address }
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }
}

impl Connector for StreamConnector {
    fn connect(&self) -> Result<Arc<dyn HostChannel>> {
        let channel: Arc<dyn HostChannel> = Arc::new(StreamChannel::connect(&self.address)?);
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::HostMsgKind;
    use crate::params::HostMessage;
    use std::io::BufRead;

    fn respond(stream: &mut UnixStream, line: &str) {
        writeln!(stream, "{}", line).unwrap();
        stream.flush().unwrap();
    }

    #[test]
    fn test_address_parsing() {
        assert_eq!(
            "vsock:2:1024".parse::<ChannelAddress>().unwrap(),
            ChannelAddress::Vsock { cid: 2, port: 1024 }
        );
        assert_eq!(
            "unix:/run/guestctl.sock".parse::<ChannelAddress>().unwrap(),
            ChannelAddress::Unix(PathBuf::from("/run/guestctl.sock"))
        );
        assert_eq!(
            "tcp:127.0.0.1:9000".parse::<ChannelAddress>().unwrap(),
            ChannelAddress::Tcp("127.0.0.1:9000".into())
        );
        assert!("vsock:x:1".parse::<ChannelAddress>().is_err());
        assert!("pipe:/x".parse::<ChannelAddress>().is_err());
        assert_eq!(ChannelAddress::default().to_string(), "vsock:2:1024");
    }

    #[test]
    fn test_handshake_peek_and_get() {
        let (guest, host) = UnixStream::pair().unwrap();
        let host_thread = std::thread::spawn(move || {
            let mut writer = host.try_clone().unwrap();
            let mut lines = BufReader::new(host).lines();

            let connect = lines.next().unwrap().unwrap();
            assert!(connect.contains("\"connect\""));
            respond(&mut writer, r#"{"seq":1,"rc":0,"data":{"client_id":42}}"#);

            let peek = lines.next().unwrap().unwrap();
            assert!(peek.contains("\"peek_wait\""));
            respond(&mut writer, r#"{"seq":2,"rc":0,"data":{"msg":241,"num_parms":2}}"#);

            let get = lines.next().unwrap().unwrap();
            assert!(get.contains("\"get\""));
            respond(
                &mut writer,
                r#"{"seq":3,"rc":0,"data":{"context_id":7,"message":{"kind":"file_close","handle":9}}}"#,
            );

            let get = lines.next().unwrap().unwrap();
            assert!(get.contains("\"max_payload\":16"));
            respond(&mut writer, r#"{"seq":4,"rc":-41,"data":{"needed":4096}}"#);
        });

        let channel = StreamChannel::handshake(Transport::Unix(guest)).unwrap();
        assert_eq!(channel.client_id(), 42);

        let mut restore = 0;
        let peeked = channel.peek_wait(&mut restore).unwrap();
        assert_eq!(peeked.msg, HostMsgKind::FileClose as u32);

        let fetched = channel.get(peeked.msg, usize::MAX).unwrap();
        assert_eq!(
            fetched,
            Fetched::Message {
                context_id: 7,
                message: HostMessage::FileClose { handle: 9 }
            }
        );

        let fetched = channel.get(HostMsgKind::FileWrite as u32, 16).unwrap();
        assert_eq!(fetched, Fetched::Overflow { needed: 4096 });

        host_thread.join().unwrap();
    }

    #[test]
    fn test_restore_updates_epoch() {
        let (guest, host) = UnixStream::pair().unwrap();
        let host_thread = std::thread::spawn(move || {
            let mut writer = host.try_clone().unwrap();
            let mut lines = BufReader::new(host).lines();
            lines.next();
            respond(&mut writer, r#"{"seq":1,"rc":0,"data":{"client_id":1}}"#);
            lines.next();
            respond(&mut writer, r#"{"seq":2,"rc":-4710,"data":{"restore_id":77}}"#);
        });

        let channel = StreamChannel::handshake(Transport::Unix(guest)).unwrap();
        let mut restore = 5;
        assert_eq!(channel.peek_wait(&mut restore), Err(ErrorCode::VmRestored));
        assert_eq!(restore, 77);
        host_thread.join().unwrap();
    }

    #[test]
    fn test_peer_close_fails_pending_calls() {
        let (guest, host) = UnixStream::pair().unwrap();
        let host_thread = std::thread::spawn(move || {
            let mut writer = host.try_clone().unwrap();
            let mut lines = BufReader::new(host).lines();
            lines.next();
            respond(&mut writer, r#"{"seq":1,"rc":0,"data":{"client_id":1}}"#);
            // Read the peek, then hang up without answering.
            lines.next();
        });

        let channel = StreamChannel::handshake(Transport::Unix(guest)).unwrap();
        let mut restore = 0;
        assert_eq!(channel.peek_wait(&mut restore), Err(ErrorCode::Disconnected));
        assert_eq!(channel.query_features(), Err(ErrorCode::Disconnected));
        host_thread.join().unwrap();
    }
}
