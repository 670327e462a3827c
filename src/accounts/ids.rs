use rand::Rng;
use time::OffsetDateTime;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Width of a base-36 encoded `u64`.
const SUFFIX_LEN: usize = 13;

/// Opaque account id: base-36 epoch millis followed by a random base-36
/// suffix. Unique in practice, not unguessable.
pub fn new_id() -> String {
    let millis =
        u128::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(0);
    let suffix: u64 = rand::thread_rng().gen();
    format!(
        "{}{:0>width$}",
        base36(millis),
        base36(u128::from(suffix)),
        width = SUFFIX_LEN
    )
}

fn base36(mut n: u128) -> String {
    if n == 0 {
        return "0".into();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}
