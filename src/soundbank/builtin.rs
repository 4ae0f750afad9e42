//! The built-in sound bank.
//!
//! A minimal SoundFont 2 image generated on demand: one looping single-cycle
//! wave, one instrument and one preset at bank 0, program 0. The synthesizer
//! falls back to that preset for every program, so any MIDI file plays.

use std::f64::consts::PI;

const WAVE_SAMPLE_RATE: u32 = 44100;

/// One cycle at 44.1 kHz is 441 Hz, close to A4.
const CYCLE_LEN: u32 = 100;
const ROOT_KEY: u8 = 69;
/// 441 Hz is about 4 cents sharp of A4.
const PITCH_CORRECTION: i8 = -4;

/// SoundFont 2 requires 46 zero samples after each sample.
const SAMPLE_PADDING: usize = 46;

// Generator operators.
const GEN_RELEASE_VOL_ENV: u16 = 38;
const GEN_INSTRUMENT: u16 = 41;
const GEN_SAMPLE_ID: u16 = 53;
const GEN_SAMPLE_MODES: u16 = 54;

/// About 100 ms, in timecents.
const RELEASE_TIMECENTS: i16 = -3986;

const MONO_SAMPLE: u16 = 1;
const LOOP_CONTINUOUSLY: i16 = 1;

/// Builds the bytes of the built-in SoundFont.
pub fn builtin_sound_bank_bytes() -> Vec<u8> {
    let info = list(
        b"INFO",
        &[
            chunk(b"ifil", &[2, 0, 1, 0]),
            chunk(b"isng", b"EMU8000\0"),
            chunk(b"INAM", b"midiplay builtin\0\0"),
        ],
    );

    let sdta = list(b"sdta", &[chunk(b"smpl", &wave_data())]);

    let mut phdr = Vec::new();
    preset_header(&mut phdr, "Sine", 0, 0, 0);
    preset_header(&mut phdr, "EOP", 0, 0, 1);

    let mut pbag = Vec::new();
    bag(&mut pbag, 0, 0);
    bag(&mut pbag, 1, 0);

    let mut pgen = Vec::new();
    generator(&mut pgen, GEN_INSTRUMENT, 0);
    generator(&mut pgen, 0, 0);

    let mut inst = Vec::new();
    instrument_header(&mut inst, "Sine", 0);
    instrument_header(&mut inst, "EOI", 1);

    let mut ibag = Vec::new();
    bag(&mut ibag, 0, 0);
    bag(&mut ibag, 3, 0);

    let mut igen = Vec::new();
    generator(&mut igen, GEN_SAMPLE_MODES, LOOP_CONTINUOUSLY);
    generator(&mut igen, GEN_RELEASE_VOL_ENV, RELEASE_TIMECENTS);
    generator(&mut igen, GEN_SAMPLE_ID, 0);
    generator(&mut igen, 0, 0);

    let mut shdr = Vec::new();
    sample_header(
        &mut shdr,
        "Sine",
        SampleHeader {
            end: CYCLE_LEN,
            loop_end: CYCLE_LEN,
            sample_rate: WAVE_SAMPLE_RATE,
            root_key: ROOT_KEY,
            correction: PITCH_CORRECTION,
            kind: MONO_SAMPLE,
        },
    );
    sample_header(&mut shdr, "EOS", SampleHeader::default());

    // Modulator lists only carry their terminal record.
    let terminal_modulator = [0u8; 10];

    let pdta = list(
        b"pdta",
        &[
            chunk(b"phdr", &phdr),
            chunk(b"pbag", &pbag),
            chunk(b"pmod", &terminal_modulator),
            chunk(b"pgen", &pgen),
            chunk(b"inst", &inst),
            chunk(b"ibag", &ibag),
            chunk(b"imod", &terminal_modulator),
            chunk(b"igen", &igen),
            chunk(b"shdr", &shdr),
        ],
    );

    let mut body = b"sfbk".to_vec();
    body.extend_from_slice(&info);
    body.extend_from_slice(&sdta);
    body.extend_from_slice(&pdta);
    chunk(b"RIFF", &body)
}

/// One cycle of a soft organ-like wave followed by the required padding.
fn wave_data() -> Vec<u8> {
    let mut data = Vec::with_capacity((CYCLE_LEN as usize + SAMPLE_PADDING) * 2);
    for i in 0..CYCLE_LEN {
        let phase = 2.0 * PI * i as f64 / CYCLE_LEN as f64;
        let value = 0.8 * phase.sin() + 0.2 * (3.0 * phase).sin();
        let sample = (value * 0.6 * i16::MAX as f64) as i16;
        data.extend_from_slice(&sample.to_le_bytes());
    }
    data.resize(data.len() + SAMPLE_PADDING * 2, 0);
    data
}

fn chunk(id: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len() + 1);
    out.extend_from_slice(id);
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(0);
    }
    out
}

fn list(kind: &[u8; 4], chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut body = kind.to_vec();
    for c in chunks {
        body.extend_from_slice(c);
    }
    chunk(b"LIST", &body)
}

fn name20(out: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; 20];
    let bytes = name.as_bytes();
    let len = bytes.len().min(19);
    field[..len].copy_from_slice(&bytes[..len]);
    out.extend_from_slice(&field);
}

fn preset_header(out: &mut Vec<u8>, name: &str, preset: u16, bank: u16, bag_index: u16) {
    name20(out, name);
    out.extend_from_slice(&preset.to_le_bytes());
    out.extend_from_slice(&bank.to_le_bytes());
    out.extend_from_slice(&bag_index.to_le_bytes());
    // library, genre, morphology
    out.extend_from_slice(&[0u8; 12]);
}

fn instrument_header(out: &mut Vec<u8>, name: &str, bag_index: u16) {
    name20(out, name);
    out.extend_from_slice(&bag_index.to_le_bytes());
}

fn bag(out: &mut Vec<u8>, generator_index: u16, modulator_index: u16) {
    out.extend_from_slice(&generator_index.to_le_bytes());
    out.extend_from_slice(&modulator_index.to_le_bytes());
}

fn generator(out: &mut Vec<u8>, operator: u16, amount: i16) {
    out.extend_from_slice(&operator.to_le_bytes());
    out.extend_from_slice(&amount.to_le_bytes());
}

#[derive(Default)]
struct SampleHeader {
    end: u32,
    loop_end: u32,
    sample_rate: u32,
    root_key: u8,
    correction: i8,
    kind: u16,
}

fn sample_header(out: &mut Vec<u8>, name: &str, header: SampleHeader) {
    name20(out, name);
    // start
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&header.end.to_le_bytes());
    // loop start
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&header.loop_end.to_le_bytes());
    out.extend_from_slice(&header.sample_rate.to_le_bytes());
    out.push(header.root_key);
    out.push(header.correction as u8);
    // sample link
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&header.kind.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        let mut phdr = Vec::new();
        preset_header(&mut phdr, "Sine", 0, 0, 0);
        assert_eq!(phdr.len(), 38);

        let mut inst = Vec::new();
        instrument_header(&mut inst, "Sine", 0);
        assert_eq!(inst.len(), 22);

        let mut shdr = Vec::new();
        sample_header(&mut shdr, "EOS", SampleHeader::default());
        assert_eq!(shdr.len(), 46);
    }

    #[test]
    fn test_riff_size_matches() {
        let bytes = builtin_sound_bank_bytes();
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"sfbk");
        let size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        assert_eq!(size + 8, bytes.len());
    }
}
