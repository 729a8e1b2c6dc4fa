//! C1 — Identity/Hash: map a Message-ID to a stable 32-hex fingerprint.

/// Derives the engine's content-address for a message: MD5 over the raw
/// bytes of `message_id`, lowercase hex. Angle brackets and internal
/// whitespace are preserved exactly as received so that re-derivation from
/// a re-fetched envelope is stable (invariant 5); only a leading run of
/// whitespace is trimmed, matching how `Message-ID:` header values are
/// typically handed to us already split from the header name.
///
/// Total and pure: this function never fails. The fingerprint of an empty
/// input is well-defined but per invariant 3 is never stored.
pub fn fingerprint(message_id: &str) -> String {
    let trimmed = message_id.trim_start();
    format!("{:x}", md5::compute(trimmed.as_bytes()))
}
