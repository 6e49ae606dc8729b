//! Streaming permessage-deflate plumbing on top of flate2.
//!
//! A compressed message is carried as a raw deflate stream. The sender ends
//! every message with a sync flush and strips the `00 00 FF FF` marker the
//! flush produces, and the receiver appends those four bytes back before
//! signaling end of message to the decompressor. With context takeover the
//! same stream (and its sliding window) lives for the whole connection,
//! otherwise it is reset between messages.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io;

pub(crate) const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

// Scratch sizing: big enough to swallow a typical frame in one call without
// holding a large buffer per connection.
const SCRATCH_SIZE: usize = 8 * 1024;

pub(crate) struct Inflater {
    decompressor: Decompress,
    reset_context: bool,
}

impl Inflater {
    pub(crate) fn new(reset_context: bool) -> Self {
        Self {
            // Raw deflate, no zlib header, full 15-bit window.
            decompressor: Decompress::new(false),
            reset_context,
        }
    }

    /// Feeds one chunk of compressed payload, appending whatever inflates out
    /// of it to `out`. Chunks may split the deflate stream at any byte.
    ///
    /// The loop is driven by `total_in`: when context takeover is on, the
    /// decompressor keeps absolute counters for the connection lifetime, so
    /// progress is measured against the count captured on entry.
    pub(crate) fn inflate(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        let before_in = self.decompressor.total_in();
        let mut scratch: Vec<u8> = Vec::with_capacity(SCRATCH_SIZE);

        while self.decompressor.total_in() - before_in < input.len() as u64 {
            let consumed = (self.decompressor.total_in() - before_in) as usize;
            let round_in = self.decompressor.total_in();
            scratch.clear();

            let status =
                self.decompressor
                    .decompress_vec(&input[consumed..], &mut scratch, FlushDecompress::Sync)?;
            out.extend_from_slice(&scratch);

            if status == Status::StreamEnd {
                break;
            }
            if self.decompressor.total_in() == round_in && scratch.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "deflate stream made no progress",
                ));
            }
        }
        Ok(())
    }

    /// Ends the current message: replays the four tail bytes the sender
    /// stripped, then resets the sliding window if takeover is off.
    pub(crate) fn finish_message(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        self.inflate(&DEFLATE_TRAILER, out)?;
        if self.reset_context {
            self.decompressor.reset(false);
        }
        Ok(())
    }
}

pub(crate) struct Deflater {
    compressor: Compress,
    reset_context: bool,
}

impl Deflater {
    pub(crate) fn new(reset_context: bool) -> Self {
        Self {
            compressor: Compress::new(Compression::default(), false),
            reset_context,
        }
    }

    /// Feeds one chunk of plaintext. Output may lag behind input, the
    /// compressor is free to sit on bytes until the end-of-message flush.
    pub(crate) fn deflate(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        let before_in = self.compressor.total_in();
        let mut scratch: Vec<u8> = Vec::with_capacity(SCRATCH_SIZE);

        while self.compressor.total_in() - before_in < input.len() as u64 {
            let consumed = (self.compressor.total_in() - before_in) as usize;
            let round_in = self.compressor.total_in();
            scratch.clear();

            self.compressor
                .compress_vec(&input[consumed..], &mut scratch, FlushCompress::None)
                .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
            out.extend_from_slice(&scratch);

            if self.compressor.total_in() == round_in && scratch.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "deflate compressor made no progress",
                ));
            }
        }
        Ok(())
    }

    /// Ends the current message: sync-flushes everything still buffered,
    /// strips the `00 00 FF FF` flush marker so it never hits the wire, and
    /// resets the sliding window if takeover is off.
    pub(crate) fn finish_message(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        let mut scratch: Vec<u8> = Vec::with_capacity(SCRATCH_SIZE);
        loop {
            scratch.clear();
            self.compressor
                .compress_vec(&[], &mut scratch, FlushCompress::Sync)
                .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
            out.extend_from_slice(&scratch);
            // A flush that didn't fill the scratch buffer is complete.
            if scratch.len() < scratch.capacity() {
                break;
            }
        }

        if out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - DEFLATE_TRAILER.len());
        }

        if self.reset_context {
            self.compressor.reset();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(reset_context: bool, messages: &[&[u8]]) {
        let mut deflater = Deflater::new(reset_context);
        let mut inflater = Inflater::new(reset_context);

        for message in messages {
            let mut wire = Vec::new();
            deflater.deflate(message, &mut wire).unwrap();
            deflater.finish_message(&mut wire).unwrap();

            let mut plain = Vec::new();
            inflater.inflate(&wire, &mut plain).unwrap();
            inflater.finish_message(&mut plain).unwrap();
            assert_eq!(&plain, message);
        }
    }

    #[test]
    fn round_trips_with_context_takeover() {
        round_trip(
            false,
            &[b"hello websocket", b"hello websocket", b"something else entirely"],
        );
    }

    #[test]
    fn round_trips_without_context_takeover() {
        round_trip(true, &[b"hello websocket", b"hello websocket"]);
    }

    #[test]
    fn round_trips_empty_and_large_messages() {
        let large: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        round_trip(false, &[b"", &large, b"x"]);
    }

    #[test]
    fn chunked_input_matches_whole_input() {
        let message = b"a message long enough to be split into several pieces".repeat(50);

        let mut deflater = Deflater::new(false);
        let mut wire = Vec::new();
        for chunk in message.chunks(97) {
            deflater.deflate(chunk, &mut wire).unwrap();
        }
        deflater.finish_message(&mut wire).unwrap();

        let mut inflater = Inflater::new(false);
        let mut plain = Vec::new();
        for chunk in wire.chunks(13) {
            inflater.inflate(chunk, &mut plain).unwrap();
        }
        inflater.finish_message(&mut plain).unwrap();
        assert_eq!(plain, message);
    }

    #[test]
    fn flush_marker_is_stripped() {
        let mut deflater = Deflater::new(false);
        let mut wire = Vec::new();
        deflater.deflate(b"tail check", &mut wire).unwrap();
        deflater.finish_message(&mut wire).unwrap();
        assert!(!wire.ends_with(&DEFLATE_TRAILER));
    }
}
