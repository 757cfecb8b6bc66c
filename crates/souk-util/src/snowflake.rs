use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Custom epoch: 2024-01-01T00:00:00Z
const SOUK_EPOCH: u64 = 1_704_067_200_000;

static LAST_ID: AtomicI64 = AtomicI64::new(0);

/// Generate a Snowflake ID.
/// Format: 42 bits timestamp | 10 bits worker | 12 bits sequence
///
/// Ids are strictly increasing within the process, even if the wall clock
/// steps backwards or more than 4096 ids are requested in one millisecond
/// (the sequence then borrows from the timestamp bits). Message ordering
/// relies on this.
pub fn generate(worker_id: u16) -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(SOUK_EPOCH);
    let timestamp = now.saturating_sub(SOUK_EPOCH);
    let candidate = ((timestamp << 22) | ((worker_id as u64 & 0x3FF) << 12)) as i64;

    let mut last = LAST_ID.load(Ordering::SeqCst);
    loop {
        let next = if candidate > last { candidate } else { last + 1 };
        match LAST_ID.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// Extract the Unix timestamp (ms) from a snowflake.
pub fn timestamp_millis(id: i64) -> u64 {
    ((id as u64) >> 22) + SOUK_EPOCH
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_strictly_increasing() {
        let mut prev = generate(1);
        for _ in 0..10_000 {
            let next = generate(1);
            assert!(next > prev, "{next} should be greater than {prev}");
            prev = next;
        }
    }

    #[test]
    fn ids_are_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..2_000).map(|_| generate(1)).collect::<Vec<_>>()))
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
    }

    #[test]
    fn timestamp_roughly_matches_now() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let ts = timestamp_millis(generate(1));
        assert!(ts >= now - 1_000);
    }
}
