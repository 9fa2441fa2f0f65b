use serde::{Deserialize, Serialize};

use crate::msg::{HostMsgKind, InputStatus, ProcStatus};

/// Serde adapter carrying byte payloads as base64 strings.
pub mod base64_bytes {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Parameters of a process start request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcStartupInfo {
    /// Executable, or an alias of the agent binary.
    pub cmd: String,
    #[serde(default)]
    pub flags: u32,
    /// Bourne-shell quoted argument string.
    #[serde(default)]
    pub args: String,
    /// NUL separated `KEY=VALUE` block.
    #[serde(default, with = "base64_bytes")]
    pub env: Vec<u8>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub domain: String,
    /// 0 and `u32::MAX` mean no limit.
    #[serde(default)]
    pub timeout_ms: u32,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub affinity: Vec<u64>,
}

/// Parameters of a session open request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartupInfo {
    pub protocol: u32,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub domain: String,
    pub session_id: u32,
    #[serde(default)]
    pub flags: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOpenParams {
    pub file_name: String,
    pub access: String,
    pub disposition: String,
    #[serde(default)]
    pub sharing: String,
    #[serde(default)]
    pub creation_mode: u32,
    #[serde(default)]
    pub offset: u64,
}

/// A fully fetched host message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostMessage {
    CancelPendingWaits,
    SessionCreate(SessionStartupInfo),
    SessionClose {
        flags: u32,
        session_id: u32,
    },
    ExecCmd(ProcStartupInfo),
    ExecSetInput {
        pid: u32,
        flags: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    ExecGetOutput {
        pid: u32,
        handle: u32,
        flags: u32,
    },
    ExecTerminate {
        pid: u32,
    },
    ExecWaitFor {
        pid: u32,
        wait_flags: u32,
        timeout_ms: u32,
    },
    FileOpen(FileOpenParams),
    FileClose {
        handle: u32,
    },
    FileRead {
        handle: u32,
        to_read: u32,
    },
    FileReadAt {
        handle: u32,
        to_read: u32,
        offset: u64,
    },
    FileWrite {
        handle: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    FileWriteAt {
        handle: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        offset: u64,
    },
    FileSeek {
        handle: u32,
        method: u32,
        offset: i64,
    },
    FileTell {
        handle: u32,
    },
    FileSetSize {
        handle: u32,
        size: u64,
    },
    DirRemove {
        path: String,
        flags: u32,
    },
    PathRename {
        source: String,
        dest: String,
        flags: u32,
    },
    PathUserDocuments,
    PathUserHome,
    Shutdown {
        action: u32,
    },
}

impl HostMessage {
    pub fn kind(&self) -> HostMsgKind {
        match self {
            HostMessage::CancelPendingWaits => HostMsgKind::CancelPendingWaits,
            HostMessage::SessionCreate(_) => HostMsgKind::SessionCreate,
            HostMessage::SessionClose { .. } => HostMsgKind::SessionClose,
            HostMessage::ExecCmd(_) => HostMsgKind::ExecCmd,
            HostMessage::ExecSetInput { .. } => HostMsgKind::ExecSetInput,
            HostMessage::ExecGetOutput { .. } => HostMsgKind::ExecGetOutput,
            HostMessage::ExecTerminate { .. } => HostMsgKind::ExecTerminate,
            HostMessage::ExecWaitFor { .. } => HostMsgKind::ExecWaitFor,
            HostMessage::FileOpen(_) => HostMsgKind::FileOpen,
            HostMessage::FileClose { .. } => HostMsgKind::FileClose,
            HostMessage::FileRead { .. } => HostMsgKind::FileRead,
            HostMessage::FileReadAt { .. } => HostMsgKind::FileReadAt,
            HostMessage::FileWrite { .. } => HostMsgKind::FileWrite,
            HostMessage::FileWriteAt { .. } => HostMsgKind::FileWriteAt,
            HostMessage::FileSeek { .. } => HostMsgKind::FileSeek,
            HostMessage::FileTell { .. } => HostMsgKind::FileTell,
            HostMessage::FileSetSize { .. } => HostMsgKind::FileSetSize,
            HostMessage::DirRemove { .. } => HostMsgKind::DirRemove,
            HostMessage::PathRename { .. } => HostMsgKind::PathRename,
            HostMessage::PathUserDocuments => HostMsgKind::PathUserDocuments,
            HostMessage::PathUserHome => HostMsgKind::PathUserHome,
            HostMessage::Shutdown { .. } => HostMsgKind::Shutdown,
        }
    }

    /// Number of parameters the message occupies on the wire, context ID included.
    pub fn num_parms(&self) -> u32 {
        match self {
            HostMessage::CancelPendingWaits => 0,
            HostMessage::PathUserDocuments | HostMessage::PathUserHome => 1,
            HostMessage::ExecTerminate { .. }
            | HostMessage::FileClose { .. }
            | HostMessage::FileTell { .. }
            | HostMessage::Shutdown { .. } => 2,
            HostMessage::SessionClose { .. }
            | HostMessage::FileRead { .. }
            | HostMessage::FileWrite { .. }
            | HostMessage::FileSetSize { .. }
            | HostMessage::DirRemove { .. } => 3,
            HostMessage::ExecGetOutput { .. }
            | HostMessage::ExecWaitFor { .. }
            | HostMessage::FileReadAt { .. }
            | HostMessage::FileWriteAt { .. }
            | HostMessage::FileSeek { .. }
            | HostMessage::PathRename { .. } => 4,
            HostMessage::ExecSetInput { .. } => 5,
            HostMessage::SessionCreate(_) => 6,
            HostMessage::FileOpen(_) => 7,
            HostMessage::ExecCmd(_) => 12,
        }
    }

    /// Size of the variable-length body the guest must buffer.
    pub fn payload_len(&self) -> usize {
        match self {
            HostMessage::ExecSetInput { data, .. }
            | HostMessage::FileWrite { data, .. }
            | HostMessage::FileWriteAt { data, .. } => data.len(),
            _ => 0,
        }
    }
}

/// File operation results, each a single combined reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "notify", rename_all = "snake_case")]
pub enum FileReply {
    Open {
        rc: i32,
        handle: u32,
    },
    Close {
        rc: i32,
    },
    Error {
        rc: i32,
    },
    Read {
        rc: i32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    ReadOffset {
        rc: i32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        offset: i64,
    },
    Write {
        rc: i32,
        written: u32,
    },
    WriteOffset {
        rc: i32,
        written: u32,
        offset: i64,
    },
    Seek {
        rc: i32,
        offset: u64,
    },
    Tell {
        rc: i32,
        offset: u64,
    },
    SetSize {
        rc: i32,
        size: u64,
    },
}

impl FileReply {
    pub fn rc(&self) -> i32 {
        match self {
            FileReply::Open { rc, .. }
            | FileReply::Close { rc }
            | FileReply::Error { rc }
            | FileReply::Read { rc, .. }
            | FileReply::ReadOffset { rc, .. }
            | FileReply::Write { rc, .. }
            | FileReply::WriteOffset { rc, .. }
            | FileReply::Seek { rc, .. }
            | FileReply::Tell { rc, .. }
            | FileReply::SetSize { rc, .. } => *rc,
        }
    }
}

/// Guest to host replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestReply {
    Generic {
        rc: i32,
        #[serde(default)]
        kind: u32,
        #[serde(default, with = "base64_bytes")]
        payload: Vec<u8>,
    },
    ProcStatus {
        pid: u32,
        status: ProcStatus,
        flags: u32,
        #[serde(default, with = "base64_bytes")]
        data: Vec<u8>,
    },
    ProcOutput {
        pid: u32,
        handle: u32,
        flags: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    ProcInputStatus {
        pid: u32,
        status: InputStatus,
        flags: u32,
        written: u32,
    },
    File(FileReply),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_travels_as_base64() {
        let msg = HostMessage::FileWrite {
            handle: 4,
            data: b"hello".to_vec(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"file_write\""));
        assert!(json.contains("aGVsbG8="));
        let back: HostMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload_len(), 5);
        assert_eq!(back.kind(), HostMsgKind::FileWrite);
    }

    #[test]
    fn test_startup_info_defaults() {
        let msg: HostMessage =
            serde_json::from_str(r#"{"kind":"exec_cmd","cmd":"/bin/true"}"#).unwrap();
        let HostMessage::ExecCmd(info) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(info.cmd, "/bin/true");
        assert_eq!(info.timeout_ms, 0);
        assert!(info.env.is_empty());
    }

    #[test]
    fn test_file_reply_nests_under_reply() {
        let reply = GuestReply::File(FileReply::Open { rc: 0, handle: 7 });
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"type\":\"file\""));
        assert!(json.contains("\"notify\":\"open\""));
        let back: GuestReply = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reply);
    }
}
