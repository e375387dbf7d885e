use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static CALL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
const HEX: &[u8; 16] = b"0123456789abcdef";

#[inline]
pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

/// Process-unique id for a synthesized tool call.
#[inline]
pub(crate) fn next_call_id() -> String {
    next_generated_id("call_", &CALL_ID_COUNTER)
}

/// Process-unique fallback id for a session whose upstream never sent one.
#[inline]
pub(crate) fn next_session_id() -> String {
    next_generated_id("chatcmpl-", &SESSION_ID_COUNTER)
}

fn next_generated_id(prefix: &str, counter: &AtomicU64) -> String {
    let id = counter.fetch_add(1, Ordering::Relaxed);
    let mut out = String::with_capacity(prefix.len() + 16);
    out.push_str(prefix);
    push_u64_hex_16(&mut out, id);
    out
}

fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        let nibble = usize::try_from(value & 0x0f).unwrap_or(0);
        buf[idx] = HEX[nibble];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of
/// `needle`, clamped to a char boundary of `text`.
///
/// Used to hold back text that may turn into a marker once the next
/// fragment arrives.
#[must_use]
pub(crate) fn partial_suffix_len(text: &str, needle: &str) -> usize {
    let max = needle.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        let start = text.len() - len;
        if text.is_char_boundary(start) && needle.as_bytes().starts_with(&text.as_bytes()[start..])
        {
            return len;
        }
    }
    0
}
