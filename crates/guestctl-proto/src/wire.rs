//! JSON-lines framing of guest calls and host responses.

use serde::{Deserialize, Serialize};

use crate::msg::SessionNotifyType;
use crate::params::{base64_bytes, GuestReply, HostMessage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestCall {
    Connect,
    Disconnect,
    MakeMaster,
    ReportFeatures {
        guest: u64,
    },
    QueryFeatures,
    QuerySessionId,
    PeekWait {
        restore_check: u64,
    },
    Get {
        msg: u32,
        max_payload: u64,
    },
    Skip {
        rc: i32,
        msg: u32,
    },
    SkipOld,
    Reply {
        context_id: u32,
        reply: GuestReply,
    },
    CancelPendingWaits,
    FilterSet {
        value: u32,
        mask_add: u32,
        mask_remove: u32,
    },
    SessionPrepare {
        session_id: u32,
        #[serde(with = "base64_bytes")]
        key: Vec<u8>,
    },
    SessionAccept {
        session_id: u32,
        #[serde(with = "base64_bytes")]
        key: Vec<u8>,
    },
    SessionCancelPrepared {
        session_id: u32,
    },
    SessionHasChanged {
        new_id: u64,
    },
    SessionClose {
        context_id: u32,
        flags: u32,
    },
    SessionNotify {
        context_id: u32,
        kind: SessionNotifyType,
        result: i32,
    },
}

#[derive(Debug, Serialize)]
pub struct CallFrame<'a> {
    pub seq: u64,
    pub call: &'a GuestCall,
}

#[derive(Debug, Deserialize)]
pub struct ResponseFrame {
    pub seq: u64,
    pub rc: i32,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ConnectData {
    pub client_id: u32,
}

#[derive(Debug, Deserialize)]
pub struct FeaturesData {
    pub host: u64,
}

#[derive(Debug, Deserialize)]
pub struct SessionIdData {
    pub session_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct PeekData {
    pub msg: u32,
    pub num_parms: u32,
}

#[derive(Debug, Deserialize)]
pub struct RestoredData {
    pub restore_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct GetData {
    pub context_id: u32,
    pub message: HostMessage,
}

#[derive(Debug, Deserialize)]
pub struct OverflowData {
    pub needed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_frame_shape() {
        let call = GuestCall::PeekWait { restore_check: 9 };
        let line = serde_json::to_string(&CallFrame { seq: 3, call: &call }).unwrap();
        assert_eq!(
            line,
            r#"{"seq":3,"call":{"type":"peek_wait","restore_check":9}}"#
        );
    }

    #[test]
    fn test_response_without_data() {
        let frame: ResponseFrame = serde_json::from_str(r#"{"seq":1,"rc":-78}"#).unwrap();
        assert_eq!(frame.rc, -78);
        assert!(frame.data.is_null());
    }
}
