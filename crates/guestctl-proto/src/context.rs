//! Context ID layout: `session:5 | object:11 | count:16`.

pub const MAX_SESSION_ID: u32 = 0x1f;
pub const MAX_OBJECT_ID: u32 = 0x7ff;

pub fn make(session: u32, object: u32, count: u32) -> u32 {
    ((session & MAX_SESSION_ID) << 27) | ((object & MAX_OBJECT_ID) << 16) | (count & 0xffff)
}

pub fn session_context(session: u32) -> u32 {
    make(session, 0, 0)
}

pub fn session_id_of(context_id: u32) -> u32 {
    (context_id >> 27) & MAX_SESSION_ID
}

pub fn object_id_of(context_id: u32) -> u32 {
    (context_id >> 16) & MAX_OBJECT_ID
}

pub fn count_of(context_id: u32) -> u32 {
    context_id & 0xffff
}
