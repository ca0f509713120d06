use std::sync::atomic::{AtomicI32, Ordering};

use lazy_static::lazy_static;

/// Obtain a new, unique request id. Ids are strictly increasing across the
/// whole process, so replies can always be correlated to their sender.
pub(crate) fn next_request_id() -> i32 {
    lazy_static! {
        static ref REQUEST_ID: AtomicI32 = AtomicI32::new(1);
    }

    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Appends `string` and a null terminator to `buf`.
pub(crate) fn write_cstring_buf(buf: &mut Vec<u8>, string: &str) {
    debug_assert!(!string.contains('\0'));
    buf.extend_from_slice(string.as_bytes());
    buf.push(0);
}

/// Splits a null-terminated string off the front of `slice`.
pub(crate) fn read_cstring(slice: &mut &[u8]) -> Option<String> {
    let nul = slice.iter().position(|&b| b == 0)?;
    let (bytes, rest) = slice.split_at(nul);
    *slice = &rest[1..];
    String::from_utf8(bytes.to_vec()).ok()
}

#[cfg(test)]
mod test {
    use super::next_request_id;

    #[test]
    fn request_ids_are_strictly_increasing() {
        let first = next_request_id();
        let second = next_request_id();
        let third = next_request_id();
        assert!(first < second && second < third);
    }
}
