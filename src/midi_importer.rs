use crate::model::config::{PERCUSSION_CHANNEL, TICKS_PER_BEAT};
use crate::model::interval::{Interval, OCTAVE};
use crate::model::song::{Event, Song};
use crate::util::{micros_per_beat_to_bpm, rescale_tick};
use anyhow::{Result, anyhow, bail};
use log::{debug, info, warn};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

const MIDDLE_C: u8 = 60;

/// How imported keys become pitches.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImportOptions {
    /// Added to every pitched note.
    pub transpose: Interval,

    /// Re-read each key as one step of this many equal divisions of the octave, counted from
    /// middle C, instead of a semitone.
    pub edo: Option<i64>,
}

impl ImportOptions {
    fn pitch_for(&self, key: u8) -> Interval {
        let offset = key as i64 - MIDDLE_C as i64;
        let retuned = match self.edo {
            Some(edo) => Interval::EdoStep(OCTAVE, offset, edo),
            None => Interval::Semitone(offset as f64),
        };

        Interval::Semitone(MIDDLE_C as f64)
            .add(&retuned)
            .add(&self.transpose)
    }
}

struct NoteSpan {
    key: u8,
    channel: u8,
    start_tick: u64,
    end_tick: u64,
    velocity: u8,
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Controller(u8, u8),
    Program(u8),
}

/// Everything read from one MIDI channel, in source ticks.
#[derive(Default)]
struct ChannelParts {
    notes: Vec<NoteSpan>,
    controls: Vec<(u64, Control)>,
}

pub fn import_midi_file<P: AsRef<Path>>(path: P, options: ImportOptions) -> Result<Song> {
    let path = path.as_ref();
    let bytes = fs::read(path)
        .map_err(|e| anyhow!("Failed to read MIDI file {}: {}", path.display(), e))?;

    let fallback_title = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("Untitled");

    midi_bytes_to_song(&bytes, fallback_title, options)
}

pub fn midi_bytes_to_song(bytes: &[u8], fallback_title: &str, options: ImportOptions) -> Result<Song> {
    if let Some(edo) = options.edo
        && edo <= 0
    {
        bail!("Can't divide the octave into {} steps..!", edo);
    }

    let smf = Smf::parse(bytes).map_err(|e| anyhow!("Failed to parse MIDI: {:?}", e))?;

    let ticks_per_quarter = match smf.header.timing {
        Timing::Metrical(t) if t.as_int() > 0 => t.as_int() as u64,
        Timing::Metrical(_) => bail!("MIDI file declares zero ticks per quarter note..!"),
        Timing::Timecode(_fps, _subframe) => {
            bail!("SMPTE timecode midi timing is not currently supported..!")
        }
    };

    debug!("Ticks per quarter note: {}", ticks_per_quarter);
    debug!(
        "MIDI format: {:?}, tracks: {}",
        smf.header.format,
        smf.tracks.len()
    );

    let mut title: Option<String> = None;
    let mut tempos: Vec<(u64, u32)> = Vec::new();
    let mut channels: BTreeMap<u8, ChannelParts> = BTreeMap::new();
    let mut open_notes: HashMap<(u8, u8), Vec<(u64, u8)>> = HashMap::new();
    let mut last_tick: u64 = 0;
    let mut skipped = 0usize;

    for (track_idx, track) in smf.tracks.iter().enumerate() {
        let mut abs_tick: u64 = 0;
        for event in track.iter() {
            abs_tick = abs_tick.saturating_add(event.delta.as_int() as u64);
            last_tick = last_tick.max(abs_tick);

            match &event.kind {
                TrackEventKind::Meta(MetaMessage::Tempo(micro)) => {
                    tempos.push((abs_tick, micro.as_int()));
                    debug!(
                        "Tempo change at tick {} -> {} us/qn (track {})",
                        abs_tick,
                        micro.as_int(),
                        track_idx
                    );
                }
                TrackEventKind::Meta(MetaMessage::TrackName(name)) if title.is_none() => {
                    let name = String::from_utf8_lossy(name).trim().to_string();
                    if !name.is_empty() {
                        debug!("Track name: {}", name);
                        title = Some(name);
                    }
                }
                TrackEventKind::Midi { channel, message } => {
                    let ch: u8 = channel.as_int();

                    match message {
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            open_notes
                                .entry((ch, key.as_int()))
                                .or_default()
                                .push((abs_tick, vel.as_int()));
                        }
                        MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                            close_note(&mut open_notes, &mut channels, ch, key.as_int(), abs_tick);
                        }
                        MidiMessage::Controller { controller, value } => {
                            channels.entry(ch).or_default().controls.push((
                                abs_tick,
                                Control::Controller(controller.as_int(), value.as_int()),
                            ));
                        }
                        MidiMessage::ProgramChange { program } => {
                            channels
                                .entry(ch)
                                .or_default()
                                .controls
                                .push((abs_tick, Control::Program(program.as_int())));
                        }
                        _ => skipped += 1,
                    }
                }
                _ => {}
            }
        }
    }

    if skipped > 0 {
        debug!("Skipped {} MIDI messages with no timeline counterpart..!", skipped);
    }

    for ((ch, key), stack) in open_notes.into_iter() {
        for (start_tick, velocity) in stack {
            let end_tick = if last_tick > start_tick {
                last_tick
            } else {
                start_tick + ticks_per_quarter
            };

            warn!(
                "Unclosed NoteOn for {}, channel: {} at tick: {} auto-closing at: {}..!",
                key, ch, start_tick, end_tick
            );

            channels.entry(ch).or_default().notes.push(NoteSpan {
                key,
                channel: ch,
                start_tick,
                end_tick,
                velocity,
            });
        }
    }

    let rescale = |tick: u64| rescale_tick(tick, ticks_per_quarter, TICKS_PER_BEAT);
    let mut song = Song::new(title.unwrap_or_else(|| fallback_title.to_string()));

    if !tempos.is_empty() {
        let track = song.add_track(0);
        tempos.sort_by_key(|(tick, _)| *tick);
        for (tick, micros) in tempos {
            song.write_event(track, Event::tempo(rescale(tick), micros_per_beat_to_bpm(micros)))?;
        }
    }

    for (ch, parts) in channels {
        write_controls(&mut song, ch, parts.controls, &rescale)?;
        write_voices(&mut song, parts.notes, &rescale, &options)?;
    }

    info!(
        "Imported '{}': {} events on {} tracks..!",
        song.title,
        song.event_count(),
        song.tracks.len()
    );

    Ok(song)
}

fn close_note(
    open_notes: &mut HashMap<(u8, u8), Vec<(u64, u8)>>,
    channels: &mut BTreeMap<u8, ChannelParts>,
    ch: u8,
    key: u8,
    abs_tick: u64,
) {
    let Some((start_tick, velocity)) = open_notes.get_mut(&(ch, key)).and_then(|stack| stack.pop())
    else {
        debug!("Orphaned NoteOff for {} ch{} at tick {}..!", key, ch, abs_tick);
        return;
    };

    channels.entry(ch).or_default().notes.push(NoteSpan {
        key,
        channel: ch,
        start_tick,
        end_tick: abs_tick,
        velocity,
    });
}

/// Spreads a channel's controller and program changes over as few control tracks as possible,
/// opening another one whenever a tick is already taken.
fn write_controls(
    song: &mut Song,
    ch: u8,
    mut controls: Vec<(u64, Control)>,
    rescale: &impl Fn(u64) -> i64,
) -> Result<()> {
    controls.sort_by_key(|(tick, _)| *tick);
    let mut control_tracks: Vec<usize> = Vec::new();

    for (tick, control) in controls {
        let tick = rescale(tick);
        let event = match control {
            Control::Controller(index, value) => Event::controller(tick, index, value),
            Control::Program(program) => Event::program(tick, program),
        };

        let free = control_tracks
            .iter()
            .copied()
            .find(|&track| song.tracks[track].event_at(tick).is_none());
        let track = match free {
            Some(track) => track,
            None => {
                let track = song.add_track(ch);
                control_tracks.push(track);
                track
            }
        };

        song.write_event(track, event)?;
    }

    Ok(())
}

/// Lays a channel's notes out on voice tracks so no two notes on one track overlap.
fn write_voices(
    song: &mut Song,
    mut notes: Vec<NoteSpan>,
    rescale: &impl Fn(u64) -> i64,
    options: &ImportOptions,
) -> Result<()> {
    notes.sort_by_key(|note| (note.start_tick, note.end_tick, note.key));

    // (track, tick its last note ends)
    let mut voices: Vec<(usize, i64)> = Vec::new();

    for note in notes {
        let (start, end) = (rescale(note.start_tick), rescale(note.end_tick));
        if end <= start {
            debug!(
                "Skipping zero-length note {} ch{} at tick {}..!",
                note.key, note.channel, start
            );
            continue;
        }

        let free = voices.iter_mut().find(|(_, busy_until)| *busy_until <= start);
        let track = match free {
            Some(voice) => {
                voice.1 = end;
                voice.0
            }
            None => {
                let track = song.add_track(note.channel);
                voices.push((track, end));
                track
            }
        };

        let on = if note.channel as usize == PERCUSSION_CHANNEL {
            Event::drum_note_on(start, note.key, note.velocity)
        } else {
            Event::note_on(start, options.pitch_for(note.key), note.velocity)
        };

        song.write_event(track, on)?;
        song.write_event(track, Event::note_off(end))?;
    }

    Ok(())
}
