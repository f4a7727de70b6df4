use crate::model::interval::Interval;
use anyhow::bail;
use log::debug;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NoteOn,
    NoteOff,
    DrumNoteOn,
    Controller,
    Program,
    Tempo,

    /// Anything a newer or damaged song file carries that this build does not understand.
    #[serde(other)]
    Unknown,
}

/// A single timestamped event on a track.
///
/// Payload meaning depends on `kind`:
/// - `NoteOn`: `float_payload` is the absolute pitch in semitones (60.0 = middle C),
///   `byte_payload_1` the velocity.
/// - `DrumNoteOn`: `byte_payload_1`/`byte_payload_2` are the literal MIDI note and velocity.
/// - `Controller`: `byte_payload_1` is the controller index, `byte_payload_2` its value.
/// - `Program`: `byte_payload_1` is the program number.
/// - `Tempo`: `float_payload` is the tempo in BPM.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub tick: i64,
    pub kind: EventKind,
    pub float_payload: f64,
    pub byte_payload_1: u8,
    pub byte_payload_2: u8,
}

impl Event {
    fn new(tick: i64, kind: EventKind) -> Self {
        Self {
            tick,
            kind,
            float_payload: 0.0,
            byte_payload_1: 0,
            byte_payload_2: 0,
        }
    }

    pub fn note_on(tick: i64, pitch: Interval, velocity: u8) -> Self {
        Self {
            float_payload: pitch.semitones(),
            byte_payload_1: velocity,
            ..Self::new(tick, EventKind::NoteOn)
        }
    }

    pub fn note_off(tick: i64) -> Self {
        Self::new(tick, EventKind::NoteOff)
    }

    pub fn drum_note_on(tick: i64, note: u8, velocity: u8) -> Self {
        Self {
            byte_payload_1: note,
            byte_payload_2: velocity,
            ..Self::new(tick, EventKind::DrumNoteOn)
        }
    }

    pub fn controller(tick: i64, index: u8, value: u8) -> Self {
        Self {
            byte_payload_1: index,
            byte_payload_2: value,
            ..Self::new(tick, EventKind::Controller)
        }
    }

    pub fn program(tick: i64, program: u8) -> Self {
        Self {
            byte_payload_1: program,
            ..Self::new(tick, EventKind::Program)
        }
    }

    pub fn tempo(tick: i64, bpm: f64) -> Self {
        Self {
            float_payload: bpm,
            ..Self::new(tick, EventKind::Tempo)
        }
    }

    pub fn pitch(&self) -> Interval {
        Interval::Semitone(self.float_payload)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Track {
    pub virtual_channel: u8,
    pub events: Vec<Event>,
}

impl Track {
    pub fn new(virtual_channel: u8) -> Self {
        Self {
            virtual_channel,
            events: Vec::new(),
        }
    }

    pub fn event_at(&self, tick: i64) -> Option<&Event> {
        self.events.iter().find(|event| event.tick == tick)
    }

    /// Writes `event`, replacing whatever was at the same tick. New ticks are inserted
    /// before the first later event so a sorted track stays sorted.
    pub fn write_event(&mut self, event: Event) {
        if let Some(existing) = self.events.iter_mut().find(|e| e.tick == event.tick) {
            *existing = event;
            return;
        }

        let index = self.events.partition_point(|e| e.tick < event.tick);
        self.events.insert(index, event);
    }

    /// Earliest tick strictly after `tick` that holds an event.
    pub fn next_tick_after(&self, tick: i64) -> Option<i64> {
        self.events
            .iter()
            .map(|event| event.tick)
            .filter(|&t| t > tick)
            .min()
    }

    pub fn last_tick(&self) -> Option<i64> {
        self.events.iter().map(|event| event.tick).max()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Song {
    pub title: String,
    pub tracks: Vec<Track>,
}

impl Song {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            tracks: Vec::new(),
        }
    }

    /// Appends an empty track and returns its index.
    pub fn add_track(&mut self, virtual_channel: u8) -> usize {
        self.tracks.push(Track::new(virtual_channel));
        self.tracks.len() - 1
    }

    pub fn write_event(&mut self, track: usize, event: Event) -> anyhow::Result<()> {
        if event.tick < 0 {
            bail!("Cannot write an event at negative tick {}..!", event.tick);
        }

        let track_count = self.tracks.len();
        let Some(target) = self.tracks.get_mut(track) else {
            bail!("Track {} does not exist (song has {} tracks)..!", track, track_count);
        };

        target.write_event(event);
        Ok(())
    }

    /// Removes every event on `tracks` whose tick lies in `ticks`. Returns how many were removed.
    pub fn delete_area(&mut self, tracks: RangeInclusive<usize>, ticks: RangeInclusive<i64>) -> usize {
        let mut removed = 0;
        for track in self.tracks_in(tracks) {
            let before = track.events.len();
            track.events.retain(|event| !ticks.contains(&event.tick));
            removed += before - track.events.len();
        }

        removed
    }

    /// Fills the gap between two same-kind events at `tick_min` and `tick_max` with events every
    /// `division` ticks, linearly interpolating their payloads. Tracks without a matching pair of
    /// endpoints are left alone. Returns how many events were written.
    pub fn interpolate(
        &mut self,
        tracks: RangeInclusive<usize>,
        tick_min: i64,
        tick_max: i64,
        division: i64,
    ) -> usize {
        if division <= 0 || tick_min < 0 || tick_max <= tick_min {
            return 0;
        }

        let mut written = 0;
        for track in self.tracks_in(tracks) {
            let (Some(start), Some(end)) =
                (track.event_at(tick_min).copied(), track.event_at(tick_max).copied())
            else {
                continue;
            };

            if start.kind != end.kind {
                debug!(
                    "Not interpolating between {:?} and {:?}: kinds differ..!",
                    start.kind, end.kind
                );
                continue;
            }

            // Different controllers can't be blended into one another.
            let keep_index = start.kind == EventKind::Controller;
            if keep_index && start.byte_payload_1 != end.byte_payload_1 {
                continue;
            }

            let span = (tick_max - tick_min) as f64;
            let mut tick = tick_min + division;
            while tick < tick_max {
                let t = (tick - tick_min) as f64 / span;
                track.write_event(Event {
                    tick,
                    kind: start.kind,
                    float_payload: start.float_payload + (end.float_payload - start.float_payload) * t,
                    byte_payload_1: if keep_index {
                        start.byte_payload_1
                    } else {
                        lerp_byte(start.byte_payload_1, end.byte_payload_1, t)
                    },
                    byte_payload_2: lerp_byte(start.byte_payload_2, end.byte_payload_2, t),
                });

                written += 1;
                tick += division;
            }
        }

        written
    }

    /// Tick of the last event on any track, or 0 for an empty song.
    pub fn last_tick(&self) -> i64 {
        self.tracks
            .iter()
            .filter_map(|track| track.last_tick())
            .max()
            .unwrap_or(0)
    }

    pub fn event_count(&self) -> usize {
        self.tracks.iter().map(|track| track.events.len()).sum()
    }

    fn tracks_in(&mut self, tracks: RangeInclusive<usize>) -> impl Iterator<Item = &mut Track> {
        self.tracks
            .iter_mut()
            .enumerate()
            .filter(move |(index, _)| tracks.contains(index))
            .map(|(_, track)| track)
    }
}

fn lerp_byte(a: u8, b: u8, t: f64) -> u8 {
    (a as f64 + (b as f64 - a as f64) * t).round().clamp(0.0, 255.0) as u8
}
