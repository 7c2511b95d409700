use crate::notify::types::{Job, Recipient, RecipientKind};

// 64-bit FNV-1a. The platform dedupes sends carrying the same random_id,
// which is what makes a retried delivery idempotent: equal inputs must
// yield equal ids across processes and restarts.
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Self {
        Self(FNV_OFFSET)
    }

    /// Each field enters the hash as a little-endian 8-byte block.
    fn write_u64(&mut self, value: u64) {
        for byte in value.to_le_bytes() {
            self.0 ^= byte as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    /// Telegram rejects random_id 0, and negative ids read poorly in
    /// session logs, so the result is masked to 63 bits with 0 mapped to 1.
    fn finish(self) -> i64 {
        match (self.0 & 0x7fff_ffff_ffff_ffff) as i64 {
            0 => 1,
            id => id,
        }
    }
}

fn base_hasher(job: &Job, recipient: &Recipient) -> Fnv1a {
    let mut hasher = Fnv1a::new();
    hasher.write_u64(job.id as u64);
    hasher.write_u64(job.created_at_ns() as u64);
    hasher.write_u64(recipient.kind.code());
    hasher.write_u64(recipient.peer_id as u64);
    hasher
}

/// Deterministic platform-visible id for the job's text message.
pub fn for_message(job: &Job, recipient: &Recipient) -> i64 {
    base_hasher(job, recipient).finish()
}

/// Deterministic id for one forwarded message within a job's batch.
/// `index` distinguishes forwards of the same source message id.
pub fn for_forward(
    job: &Job,
    recipient: &Recipient,
    from_kind: RecipientKind,
    from_peer_id: i64,
    message_id: i32,
    index: usize,
) -> i64 {
    let mut hasher = base_hasher(job, recipient);
    hasher.write_u64(from_kind.code());
    hasher.write_u64(from_peer_id as u64);
    hasher.write_u64(message_id as u64);
    hasher.write_u64(index as u64);
    hasher.finish()
}
