//! Download payload generation.
//!
//! A [`PatternBuffer`] is filled with random bytes once, at startup, and then
//! shared read-only by every download. Each download owns a
//! [`PatternSource`] that replays the buffer cyclically from its own cursor,
//! which is far cheaper than drawing fresh random bytes for every chunk.

use crate::{Error, Result};
use log::warn;
use rand::rngs::OsRng;
use rand::RngCore;
use std::io;
use std::sync::Arc;

/// Immutable byte pattern shared by all downloads.
#[derive(Debug, Clone)]
pub struct PatternBuffer {
    data: Arc<[u8]>,
}

impl PatternBuffer {
    /// Generates a pattern of `size` bytes from the operating system's
    /// cryptographically strong random source.
    ///
    /// If the random source fails the pattern degrades to zeroes and a
    /// warning is logged; the server still starts.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `size` is zero.
    pub fn generate(size: usize) -> Result<Self> {
        Self::generate_with(size, &mut OsRng)
    }

    /// Like [`generate`](Self::generate), drawing from the given generator.
    pub fn generate_with<R: RngCore + ?Sized>(size: usize, rng: &mut R) -> Result<Self> {
        let mut data = vec![0u8; size];
        if let Err(e) = rng.try_fill_bytes(&mut data) {
            warn!("Failed to pre-generate random data, using zeros: {}", e);
            data.fill(0);
        }
        Self::from_vec(data)
    }

    /// Uses `data` verbatim as the pattern.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `data` is empty.
    pub fn from_vec(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Config(
                "pattern buffer size must be positive".to_string(),
            ));
        }
        Ok(Self { data: data.into() })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Starts a new reader positioned at the beginning of the pattern.
    pub fn source(&self) -> PatternSource {
        PatternSource::new(self.clone())
    }
}

/// Endless reader over a [`PatternBuffer`].
///
/// Reads always fill the whole destination. The bytes produced depend only
/// on how many bytes were read before, never on how the reads were sized.
///
/// # Examples
///
/// ```
/// use rspeed::pattern::PatternBuffer;
///
/// let pattern = PatternBuffer::from_vec(vec![1, 2, 3, 4]).unwrap();
/// let mut source = pattern.source();
///
/// let mut buf = [0u8; 10];
/// source.fill(&mut buf);
/// assert_eq!(buf, [1, 2, 3, 4, 1, 2, 3, 4, 1, 2]);
/// ```
#[derive(Debug, Clone)]
pub struct PatternSource {
    pattern: PatternBuffer,
    // Always < pattern.len().
    cursor: usize,
}

impl PatternSource {
    pub fn new(pattern: PatternBuffer) -> Self {
        Self { pattern, cursor: 0 }
    }

    /// Fills `buf` completely and returns its length.
    pub fn fill(&mut self, buf: &mut [u8]) -> usize {
        let data = self.pattern.as_bytes();
        let mut copied = 0;

        while copied < buf.len() {
            let to_copy = (buf.len() - copied).min(data.len() - self.cursor);
            buf[copied..copied + to_copy]
                .copy_from_slice(&data[self.cursor..self.cursor + to_copy]);
            copied += to_copy;
            self.cursor += to_copy;
            if self.cursor == data.len() {
                self.cursor = 0;
            }
        }

        copied
    }

    /// Current offset into the pattern.
    pub fn position(&self) -> usize {
        self.cursor
    }
}

impl io::Read for PatternSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.fill(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    struct FailingRng;

    impl RngCore for FailingRng {
        fn next_u32(&mut self) -> u32 {
            0
        }

        fn next_u64(&mut self) -> u64 {
            0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0xAA);
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
            // Leave garbage behind to prove the fallback zeroes it.
            dest.fill(0xAA);
            Err(rand::Error::new(io::Error::new(
                io::ErrorKind::Other,
                "entropy source unavailable",
            )))
        }
    }

    fn sample() -> PatternBuffer {
        PatternBuffer::from_vec(vec![0x01, 0x02, 0x03, 0x04]).unwrap()
    }

    #[test]
    fn test_read_wraps_around() {
        let mut source = sample().source();
        let mut buf = [0u8; 10];

        assert_eq!(source.fill(&mut buf), 10);
        assert_eq!(buf, [1, 2, 3, 4, 1, 2, 3, 4, 1, 2]);
        assert_eq!(source.position(), 2);
    }

    #[test]
    fn test_read_exact_pattern_length_resets_cursor() {
        let mut source = sample().source();
        let mut buf = [0u8; 4];

        source.fill(&mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(source.position(), 0);
    }

    #[test]
    fn test_continues_across_calls() {
        let mut source = sample().source();
        let mut a = [0u8; 3];
        let mut b = [0u8; 3];

        source.fill(&mut a);
        source.fill(&mut b);
        assert_eq!(a, [1, 2, 3]);
        assert_eq!(b, [4, 1, 2]);
    }

    #[test]
    fn test_empty_read_is_noop() {
        let mut source = sample().source();
        assert_eq!(source.fill(&mut []), 0);
        assert_eq!(source.position(), 0);
    }

    #[test]
    fn test_io_read_never_short() {
        let mut source = sample().source();
        let mut buf = vec![0u8; 1000];
        assert_eq!(source.read(&mut buf).unwrap(), 1000);
    }

    #[test]
    fn test_sources_have_independent_cursors() {
        let pattern = sample();
        let mut first = pattern.source();
        let mut second = pattern.source();

        let mut buf = [0u8; 3];
        first.fill(&mut buf);

        let mut buf = [0u8; 2];
        second.fill(&mut buf);
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn test_empty_pattern_rejected() {
        assert!(matches!(
            PatternBuffer::from_vec(Vec::new()),
            Err(Error::Config(_))
        ));
        assert!(PatternBuffer::generate(0).is_err());
    }

    #[test]
    fn test_generate_has_requested_size() {
        let pattern = PatternBuffer::generate(65536).unwrap();
        assert_eq!(pattern.len(), 65536);
    }

    #[test]
    fn test_generation_failure_degrades_to_zeros() {
        let pattern = PatternBuffer::generate_with(16, &mut FailingRng).unwrap();
        assert_eq!(pattern.len(), 16);
        assert!(pattern.as_bytes().iter().all(|&b| b == 0));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Any read returns the pattern cycled from the cumulative offset.
            #[test]
            fn prop_read_matches_cycled_pattern(
                pattern in proptest::collection::vec(any::<u8>(), 1..64),
                skip in 0usize..500,
                len in 0usize..2000,
            ) {
                let buffer = PatternBuffer::from_vec(pattern.clone()).unwrap();
                let mut source = buffer.source();

                let mut prefix = vec![0u8; skip];
                source.fill(&mut prefix);

                let mut buf = vec![0u8; len];
                prop_assert_eq!(source.fill(&mut buf), len);

                let expected: Vec<u8> = pattern.iter().copied().cycle().skip(skip).take(len).collect();
                prop_assert_eq!(buf, expected);
                prop_assert!(source.position() < pattern.len());
            }

            /// Splitting a read into pieces yields the same bytes as one read.
            #[test]
            fn prop_chunking_is_transparent(
                pattern in proptest::collection::vec(any::<u8>(), 1..64),
                sizes in proptest::collection::vec(0usize..300, 0..20),
            ) {
                let buffer = PatternBuffer::from_vec(pattern).unwrap();

                let mut pieces = Vec::new();
                let mut chunked = buffer.source();
                for size in &sizes {
                    let mut buf = vec![0u8; *size];
                    chunked.fill(&mut buf);
                    pieces.extend_from_slice(&buf);
                }

                let mut whole = vec![0u8; sizes.iter().sum()];
                buffer.source().fill(&mut whole);

                prop_assert_eq!(pieces, whole);
            }
        }
    }
}
