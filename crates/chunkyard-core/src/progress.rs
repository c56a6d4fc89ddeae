//! Completion math shared by the progress endpoint and the assembler.

/// Completion percentage, rounded half up.
///
/// Returns 0 when `total` is 0 instead of dividing by zero.
pub fn percentage(received: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let received = received.min(total);
    ((received * 200 + total) / (total * 2)) as u8
}

/// Indices in `0..total` not present in `received` (which must be sorted).
pub fn missing_indices(total: u32, received: &[u32]) -> Vec<u32> {
    let mut missing = Vec::new();
    let mut it = received.iter().peekable();
    for index in 0..total {
        while it.peek().is_some_and(|r| **r < index) {
            it.next();
        }
        if it.peek() != Some(&&index) {
            missing.push(index);
        }
    }
    missing
}

/// True when `received` (sorted) is exactly `{0..total-1}`.
pub fn is_complete(total: u32, received: &[u32]) -> bool {
    received.len() == total as usize && received.iter().enumerate().all(|(i, r)| *r == i as u32)
}
