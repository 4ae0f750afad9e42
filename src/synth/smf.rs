//! Streaming Standard MIDI File reader.
//!
//! The header and chunk table are read when a session opens. Track data is
//! decoded lazily through one [`TrackCursor`] per track, each holding a small
//! block of the track in memory; refilling a block is a single `read_at`.
//! A [`Sequencer`] merges the cursors in tick order and keeps the tempo clock.

use crate::source::{InputSource, SourceError};

/// Bytes of track data each cursor keeps in memory.
const BLOCK_SIZE: usize = 4096;

/// Tempo in effect until the file sets one (120 BPM).
const DEFAULT_TEMPO_US: u32 = 500_000;

/// Errors raised while decoding a MIDI file.
#[derive(Debug, thiserror::Error)]
pub enum SmfError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("{0}")]
    Malformed(String),
}

/// How the file measures time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timing {
    /// Ticks per quarter note.
    Metrical(u16),
    /// SMPTE frames per second and ticks per frame.
    Timecode(u8, u8),
}

/// The chunk table of a MIDI file.
#[derive(Debug, Clone)]
pub struct SmfLayout {
    pub timing: Timing,
    /// Absolute `[start, end)` byte ranges of the track chunks.
    tracks: Vec<(u64, u64)>,
}

/// One decoded track event. Only what playback needs is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmfEvent {
    /// A channel message with its status byte restored.
    Channel { bytes: [u8; 3], len: u8 },
    /// Microseconds per quarter note.
    Tempo(u32),
    EndOfTrack,
    /// Any other meta event or a SysEx message.
    Skipped,
}

impl SmfEvent {
    /// The raw channel message, if this is one.
    pub fn channel_bytes(&self) -> Option<&[u8]> {
        match self {
            SmfEvent::Channel { bytes, len } => Some(&bytes[..*len as usize]),
            _ => None,
        }
    }
}

fn read_exact_at(source: &mut InputSource, buf: &mut [u8], offset: u64) -> Result<(), SmfError> {
    let read = source.read_at(buf, offset)?;
    if read < buf.len() {
        return Err(SmfError::Malformed(format!(
            "unexpected end of data at offset {}",
            offset + read as u64
        )));
    }
    Ok(())
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl SmfLayout {
    /// Reads the header and locates every track chunk.
    ///
    /// A RIFF `RMID` wrapper is unwrapped. Chunks other than `MTrk` are
    /// skipped; a track running past the end of the data is cut short.
    ///
    /// # Errors
    ///
    /// Returns [`SmfError::Malformed`] if there is no valid header, no track,
    /// or the file is format 2.
    pub fn parse(source: &mut InputSource) -> Result<Self, SmfError> {
        let (base, end) = Self::locate_smf(source)?;

        let mut header = [0u8; 14];
        if end < base + 14 {
            return Err(SmfError::Malformed("file too short for a MIDI header".into()));
        }
        read_exact_at(source, &mut header, base)?;
        if &header[..4] != b"MThd" {
            return Err(SmfError::Malformed("missing MThd header".into()));
        }
        let header_len = be_u32(&header[4..8]) as u64;
        if header_len < 6 {
            return Err(SmfError::Malformed(format!(
                "header chunk of {} bytes",
                header_len
            )));
        }
        let format = be_u16(&header[8..10]);
        let track_count = be_u16(&header[10..12]) as usize;
        let division = be_u16(&header[12..14]);

        if format > 1 {
            return Err(SmfError::Malformed(format!(
                "MIDI format {} is not supported",
                format
            )));
        }

        let timing = if division & 0x8000 != 0 {
            let fps = ((division >> 8) as u8 as i8).wrapping_neg() as u8;
            let ticks_per_frame = (division & 0xFF) as u8;
            if fps == 0 || ticks_per_frame == 0 {
                return Err(SmfError::Malformed("invalid SMPTE division".into()));
            }
            Timing::Timecode(fps, ticks_per_frame)
        } else {
            if division == 0 {
                return Err(SmfError::Malformed("zero ticks per quarter note".into()));
            }
            Timing::Metrical(division)
        };

        let mut tracks = Vec::with_capacity(track_count);
        let mut offset = base + 8 + header_len;
        while tracks.len() < track_count && offset + 8 <= end {
            let mut chunk_header = [0u8; 8];
            read_exact_at(source, &mut chunk_header, offset)?;
            let len = be_u32(&chunk_header[4..8]) as u64;
            let start = offset + 8;
            let mut chunk_end = start + len;
            if chunk_end > end {
                tracing::warn!(offset, len, "track chunk runs past end of file");
                chunk_end = end;
            }
            if &chunk_header[..4] == b"MTrk" {
                tracks.push((start, chunk_end));
            }
            offset = chunk_end;
        }

        if tracks.is_empty() {
            return Err(SmfError::Malformed("no track chunks".into()));
        }
        if tracks.len() < track_count {
            tracing::warn!(
                expected = track_count,
                found = tracks.len(),
                "MIDI file is missing tracks"
            );
        }

        Ok(Self { timing, tracks })
    }

    /// Returns the byte range holding the SMF data.
    fn locate_smf(source: &mut InputSource) -> Result<(u64, u64), SmfError> {
        let len = source.len();
        if len < 12 {
            return Ok((0, len));
        }
        let mut riff = [0u8; 12];
        read_exact_at(source, &mut riff, 0)?;
        if &riff[..4] != b"RIFF" || &riff[8..12] != b"RMID" {
            return Ok((0, len));
        }

        let mut offset = 12;
        while offset + 8 <= len {
            let mut chunk_header = [0u8; 8];
            read_exact_at(source, &mut chunk_header, offset)?;
            let chunk_len = be_u32(&chunk_header[4..8]) as u64;
            if &chunk_header[..4] == b"data" {
                return Ok((offset + 8, (offset + 8 + chunk_len).min(len)));
            }
            offset += 8 + chunk_len + (chunk_len & 1);
        }
        Err(SmfError::Malformed("RMID file without a data chunk".into()))
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

/// Decodes the events of one track.
///
/// Decoding an event either commits completely or leaves the cursor where it
/// was, so a failed read can be retried on the next call.
pub struct TrackCursor {
    pos: u64,
    end: u64,
    tick: u64,
    running_status: Option<u8>,
    done: bool,
    block: Box<[u8]>,
    block_start: u64,
    block_len: usize,
}

impl TrackCursor {
    fn new(start: u64, end: u64) -> Self {
        Self {
            pos: start,
            end,
            tick: 0,
            running_status: None,
            done: start >= end,
            block: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
            block_start: 0,
            block_len: 0,
        }
    }

    fn byte(&mut self, source: &mut InputSource, pos: u64) -> Result<u8, SmfError> {
        if pos >= self.end {
            return Err(SmfError::Malformed("track ends mid-event".into()));
        }
        if pos < self.block_start || pos >= self.block_start + self.block_len as u64 {
            let want = (self.end - pos).min(BLOCK_SIZE as u64) as usize;
            match source.read_at(&mut self.block[..want], pos) {
                Ok(0) => {
                    self.block_len = 0;
                    return Err(SmfError::Malformed("track ends mid-event".into()));
                }
                Ok(read) => {
                    self.block_start = pos;
                    self.block_len = read;
                }
                Err(e) => {
                    self.block_len = 0;
                    return Err(e.into());
                }
            }
        }
        Ok(self.block[(pos - self.block_start) as usize])
    }

    fn variable_length(&mut self, source: &mut InputSource, pos: &mut u64) -> Result<u32, SmfError> {
        let mut value = 0u32;
        for _ in 0..4 {
            let b = self.byte(source, *pos)?;
            *pos += 1;
            value = (value << 7) | (b & 0x7F) as u32;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(SmfError::Malformed("variable-length quantity over 4 bytes".into()))
    }

    /// Decodes the next event and its absolute tick.
    pub fn next_event(&mut self, source: &mut InputSource) -> Result<Option<(u64, SmfEvent)>, SmfError> {
        if self.done {
            return Ok(None);
        }
        if self.pos >= self.end {
            self.done = true;
            return Ok(None);
        }

        let mut pos = self.pos;
        let delta = self.variable_length(source, &mut pos)?;
        let first = self.byte(source, pos)?;
        let status = if first & 0x80 != 0 {
            pos += 1;
            first
        } else {
            self.running_status.ok_or_else(|| {
                SmfError::Malformed("data byte without running status".into())
            })?
        };

        let mut running_status = self.running_status;
        let event = match status {
            0xFF => {
                let kind = self.byte(source, pos)?;
                pos += 1;
                let len = self.variable_length(source, &mut pos)?;
                let event = match kind {
                    0x51 if len == 3 => {
                        let a = self.byte(source, pos)? as u32;
                        let b = self.byte(source, pos + 1)? as u32;
                        let c = self.byte(source, pos + 2)? as u32;
                        SmfEvent::Tempo((a << 16) | (b << 8) | c)
                    }
                    0x2F => SmfEvent::EndOfTrack,
                    _ => SmfEvent::Skipped,
                };
                pos += len as u64;
                running_status = None;
                event
            }
            0xF0 | 0xF7 => {
                let len = self.variable_length(source, &mut pos)?;
                pos += len as u64;
                running_status = None;
                SmfEvent::Skipped
            }
            0x80..=0xEF => {
                let data_len = match status & 0xF0 {
                    0xC0 | 0xD0 => 1,
                    _ => 2,
                };
                let mut bytes = [status, 0, 0];
                for slot in bytes.iter_mut().skip(1).take(data_len) {
                    *slot = self.byte(source, pos)?;
                    pos += 1;
                }
                running_status = Some(status);
                SmfEvent::Channel {
                    bytes,
                    len: data_len as u8 + 1,
                }
            }
            other => {
                return Err(SmfError::Malformed(format!(
                    "unexpected status byte {:#04x}",
                    other
                )))
            }
        };

        self.pos = pos.min(self.end);
        self.tick += delta as u64;
        self.running_status = running_status;
        if event == SmfEvent::EndOfTrack {
            self.done = true;
        }
        Ok(Some((self.tick, event)))
    }
}

/// Merges all tracks in tick order and converts ticks to seconds.
pub struct Sequencer {
    timing: Timing,
    tracks: Vec<TrackCursor>,
    pending: Vec<Option<(u64, SmfEvent)>>,
    tempo_us: u32,
    last_tick: u64,
    elapsed: f64,
}

impl Sequencer {
    /// Creates a sequencer positioned at the start of every track.
    pub fn new(layout: &SmfLayout) -> Self {
        let tracks: Vec<_> = layout
            .tracks
            .iter()
            .map(|&(start, end)| TrackCursor::new(start, end))
            .collect();
        Self {
            timing: layout.timing,
            pending: vec![None; tracks.len()],
            tracks,
            tempo_us: DEFAULT_TEMPO_US,
            last_tick: 0,
            elapsed: 0.0,
        }
    }

    /// Seconds from the start of the file to the last event returned.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    fn ticks_to_seconds(&self, ticks: u64) -> f64 {
        match self.timing {
            Timing::Metrical(ticks_per_quarter) => {
                ticks as f64 * self.tempo_us as f64 / (ticks_per_quarter as f64 * 1_000_000.0)
            }
            Timing::Timecode(fps, ticks_per_frame) => {
                ticks as f64 / (fps as f64 * ticks_per_frame as f64)
            }
        }
    }

    /// Returns the next event across all tracks with its time in seconds.
    ///
    /// A malformed track is ended with a warning. Only source errors are
    /// returned, and the sequencer is unchanged by them.
    pub fn next_event(&mut self, source: &mut InputSource) -> Result<Option<(f64, SmfEvent)>, SourceError> {
        for (index, track) in self.tracks.iter_mut().enumerate() {
            if self.pending[index].is_some() {
                continue;
            }
            match track.next_event(source) {
                Ok(event) => self.pending[index] = event,
                Err(SmfError::Source(e)) => return Err(e),
                Err(SmfError::Malformed(reason)) => {
                    tracing::warn!(track = index, %reason, "ending malformed track");
                    track.done = true;
                }
            }
        }

        // Ties go to the lower track so tempo maps in track 0 apply first.
        let next = self
            .pending
            .iter()
            .enumerate()
            .filter_map(|(index, event)| event.as_ref().map(|&(tick, _)| (tick, index)))
            .min();
        let Some((tick, index)) = next else {
            return Ok(None);
        };
        let Some((_, event)) = self.pending[index].take() else {
            return Ok(None);
        };

        self.elapsed += self.ticks_to_seconds(tick.saturating_sub(self.last_tick));
        self.last_tick = tick;
        if let SmfEvent::Tempo(tempo) = event {
            if tempo > 0 {
                self.tempo_us = tempo;
            }
        }
        Ok(Some((self.elapsed, event)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encodes a variable-length quantity.
    pub(crate) fn vlq(mut value: u32) -> Vec<u8> {
        let mut out = vec![(value & 0x7F) as u8];
        value >>= 7;
        while value > 0 {
            out.insert(0, (value & 0x7F) as u8 | 0x80);
            value >>= 7;
        }
        out
    }

    /// Builds a MIDI file from raw track bodies (without end-of-track).
    pub(crate) fn smf(format: u16, division: u16, tracks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = b"MThd".to_vec();
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&format.to_be_bytes());
        out.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        out.extend_from_slice(&division.to_be_bytes());
        for body in tracks {
            let mut body = body.clone();
            body.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
            out.extend_from_slice(b"MTrk");
            out.extend_from_slice(&(body.len() as u32).to_be_bytes());
            out.extend_from_slice(&body);
        }
        out
    }

    /// One note of `ticks` length on channel 0.
    pub(crate) fn note_track(key: u8, ticks: u32) -> Vec<u8> {
        let mut body = vec![0x00, 0x90, key, 100];
        body.extend(vlq(ticks));
        body.extend_from_slice(&[0x80, key, 0]);
        body
    }

    fn collect(bytes: &[u8]) -> Vec<(f64, SmfEvent)> {
        let mut source = InputSource::from_bytes(bytes);
        let layout = SmfLayout::parse(&mut source).unwrap();
        let mut sequencer = Sequencer::new(&layout);
        let mut events = Vec::new();
        while let Some(event) = sequencer.next_event(&mut source).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_vlq_helper() {
        assert_eq!(vlq(0), vec![0x00]);
        assert_eq!(vlq(0x7F), vec![0x7F]);
        assert_eq!(vlq(0x80), vec![0x81, 0x00]);
        assert_eq!(vlq(0x0FFF_FFFF), vec![0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn test_single_note_timing() {
        // 480 ticks at 120 BPM is half a second.
        let events = collect(&smf(0, 480, &[note_track(60, 480)]));
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].1.channel_bytes(), Some(&[0x90, 60, 100][..]));
        assert!((events[1].0 - 0.5).abs() < 1e-9);
        assert_eq!(events[1].1.channel_bytes(), Some(&[0x80, 60, 0][..]));
        assert_eq!(events[2].1, SmfEvent::EndOfTrack);
    }

    #[test]
    fn test_running_status() {
        let body = vec![0x00, 0x90, 60, 100, 0x10, 64, 100, 0x10, 67, 100];
        let events = collect(&smf(0, 96, &[body]));
        let keys: Vec<u8> = events
            .iter()
            .filter_map(|(_, e)| e.channel_bytes().map(|b| b[1]))
            .collect();
        assert_eq!(keys, vec![60, 64, 67]);
    }

    #[test]
    fn test_program_change_has_one_data_byte() {
        let body = vec![0x00, 0xC0, 5, 0x00, 0x90, 60, 100];
        let events = collect(&smf(0, 96, &[body]));
        assert_eq!(events[0].1.channel_bytes(), Some(&[0xC0, 5][..]));
        assert_eq!(events[1].1.channel_bytes(), Some(&[0x90, 60, 100][..]));
    }

    #[test]
    fn test_tempo_track_applies_to_other_tracks() {
        // 60 BPM in the tempo track doubles the length of the note.
        let tempo = vec![0x00, 0xFF, 0x51, 0x03, 0x0F, 0x42, 0x40];
        let events = collect(&smf(1, 480, &[tempo, note_track(60, 480)]));
        let last = events.last().unwrap();
        assert!((last.0 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_sysex_and_meta_are_skipped() {
        let mut body = vec![0x00, 0xF0, 0x03, 0x7E, 0x7F, 0xF7];
        body.extend_from_slice(&[0x00, 0xFF, 0x03, 0x04, b'n', b'a', b'm', b'e']);
        body.extend(note_track(60, 10));
        let events = collect(&smf(0, 96, &[body]));
        assert_eq!(events[0].1, SmfEvent::Skipped);
        assert_eq!(events[1].1, SmfEvent::Skipped);
        assert_eq!(events[2].1.channel_bytes(), Some(&[0x90, 60, 100][..]));
    }

    #[test]
    fn test_smpte_division() {
        // 25 fps, 40 ticks per frame: 1000 ticks per second.
        let division = (((-25i8) as u8 as u16) << 8) | 40;
        let events = collect(&smf(0, division, &[note_track(60, 1000)]));
        assert!((events.last().unwrap().0 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rmid_wrapper() {
        let inner = smf(0, 480, &[note_track(60, 480)]);
        let mut riff = b"RIFF".to_vec();
        riff.extend_from_slice(&((inner.len() + 12) as u32).to_le_bytes());
        riff.extend_from_slice(b"RMID");
        riff.extend_from_slice(b"data");
        riff.extend_from_slice(&(inner.len() as u32).to_le_bytes());
        riff.extend_from_slice(&inner);
        assert_eq!(collect(&riff).len(), 3);
    }

    #[test]
    fn test_rejects_bad_header() {
        let mut source = InputSource::from_bytes(b"not a midi file at all");
        assert!(matches!(
            SmfLayout::parse(&mut source),
            Err(SmfError::Malformed(_))
        ));

        let mut source = InputSource::from_bytes(&smf(2, 96, &[note_track(60, 10)]));
        assert!(matches!(
            SmfLayout::parse(&mut source),
            Err(SmfError::Malformed(_))
        ));
    }

    #[test]
    fn test_truncated_track_ends_quietly() {
        let mut bytes = smf(0, 96, &[note_track(60, 96)]);
        // Drop the end-of-track and half of the note-off.
        bytes.truncate(bytes.len() - 5);
        let events = collect(&bytes);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_blocks_span_large_tracks() {
        let mut body = Vec::new();
        for i in 0..2000u32 {
            body.extend_from_slice(&[0x01, 0x90, (i % 100) as u8, 64]);
        }
        let events = collect(&smf(0, 96, &[body]));
        // 2000 notes plus end-of-track; the track spans two blocks.
        assert_eq!(events.len(), 2001);
    }
}
