//! Constant-fill detection for decompressed grains.
//!
//! Stream-optimized images routinely compress grains that are a single
//! repeated byte (freshly formatted or wiped regions). Detecting this once
//! per grain lets the read path serve such grains without keeping the
//! buffer around.

use std::mem::size_of;

/// Return the fill byte if `data` consists of one repeated byte value.
///
/// Returns `None` for an empty buffer or one with at least two distinct
/// values. The scan widens to machine words in the middle of the buffer;
/// the result is identical to comparing `data[0]` against every later byte.
pub fn detect_fill(data: &[u8]) -> Option<u8> {
    let (&first, rest) = data.split_first()?;
    let pattern = usize::from_ne_bytes([first; size_of::<usize>()]);
    let mut words = rest.chunks_exact(size_of::<usize>());
    for word in &mut words {
        let word = usize::from_ne_bytes(word.try_into().expect("chunk is word sized"));
        if word != pattern {
            return None;
        }
    }
    if words.remainder().iter().any(|&b| b != first) {
        return None;
    }
    Some(first)
}
