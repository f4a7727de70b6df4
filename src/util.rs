use std::time::Duration;

const MICROSECONDS_PER_MINUTE: f64 = 60_000_000.0;

/// Pitch-bend units per semitone, assuming the synth's bend range is +/-2 semitones.
pub const BEND_PER_SEMITONE: f64 = 4096.0;

/// Splits a floating pitch (60.0 = middle C) into the nearest MIDI note and the signed
/// 14-bit pitch bend that makes up the difference.
pub fn pitch_to_midi(pitch: f64) -> (u8, i16) {
    let note = pitch.round().clamp(0.0, 127.0);
    let bend = ((pitch - note) * BEND_PER_SEMITONE)
        .round()
        .clamp(-8192.0, 8191.0);

    (note as u8, bend as i16)
}

/// Wall-clock length of `ticks` at a constant tempo.
pub fn ticks_to_duration(ticks: i64, ticks_per_beat: i64, bpm: f64) -> Duration {
    if ticks <= 0 || ticks_per_beat <= 0 || !(bpm.is_finite() && bpm > 0.0) {
        return Duration::ZERO;
    }

    Duration::from_secs_f64(ticks as f64 / ticks_per_beat as f64 * 60.0 / bpm)
}

pub fn bpm_to_micros_per_beat(bpm: f64) -> u32 {
    (MICROSECONDS_PER_MINUTE / bpm).round().clamp(1.0, 0xFF_FFFF as f64) as u32
}

pub fn micros_per_beat_to_bpm(micros: u32) -> f64 {
    MICROSECONDS_PER_MINUTE / micros.max(1) as f64
}

/// Converts a tick from a file's resolution to ours, rounding to the nearest tick.
pub fn rescale_tick(tick: u64, from_ticks_per_beat: u64, to_ticks_per_beat: i64) -> i64 {
    if from_ticks_per_beat == 0 {
        return 0;
    }

    let to = to_ticks_per_beat.max(0) as u128;
    let from = from_ticks_per_beat as u128;
    let scaled = (tick as u128 * to + from / 2) / from;
    i64::try_from(scaled).unwrap_or(i64::MAX)
}
