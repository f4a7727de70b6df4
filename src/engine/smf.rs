use crate::engine::MidiSink;
use crate::util::bpm_to_micros_per_beat;
use anyhow::{Result, anyhow, bail};
use log::{debug, info};
use midly::num::{u4, u14, u15, u24, u28};
use midly::{Format, Header, MetaMessage, MidiMessage, PitchBend, Smf, Timing, TrackEvent, TrackEventKind};
use std::path::Path;

/// Collects scheduler output into a single-track Standard MIDI File.
///
/// Messages are stamped with whatever delta has piled up through `advance_delta` since the
/// previous message, so the scheduler alone decides where every event lands in time.
#[derive(Debug)]
pub struct SmfWriter {
    timing: u15,
    channel: u4,
    pending: u32,
    events: Vec<TrackEvent<'static>>,
}

impl SmfWriter {
    pub fn new(ticks_per_beat: i64) -> Result<Self> {
        let timing = u16::try_from(ticks_per_beat)
            .ok()
            .filter(|&tpb| tpb > 0)
            .and_then(u15::try_from)
            .ok_or_else(|| anyhow!("{} ticks per beat can't be stored in a MIDI file..!", ticks_per_beat))?;

        Ok(Self {
            timing,
            channel: 0.into(),
            pending: 0,
            events: Vec::new(),
        })
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Closes the track with an end-of-track marker carrying any leftover delta.
    pub fn finish(mut self) -> Result<Smf<'static>> {
        self.push(TrackEventKind::Meta(MetaMessage::EndOfTrack))?;

        let header = Header::new(Format::SingleTrack, Timing::Metrical(self.timing));
        debug!("Finished MIDI track with {} events..!", self.events.len());

        Ok(Smf {
            header,
            tracks: vec![self.events],
        })
    }

    pub fn to_bytes(self) -> Result<Vec<u8>> {
        let smf = self.finish()?;
        let mut bytes = Vec::new();
        smf.write_std(&mut bytes)?;
        Ok(bytes)
    }

    pub fn save(self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let smf = self.finish()?;
        smf.save(path)
            .map_err(|why| anyhow!("Failed to write '{}': {}", path.display(), why))?;

        info!("MIDI output written to '{}'..!", path.display());
        Ok(())
    }

    fn push(&mut self, kind: TrackEventKind<'static>) -> Result<()> {
        let Some(delta) = u28::try_from(self.pending) else {
            bail!("Delta of {} ticks is too long for a MIDI file..!", self.pending);
        };

        self.events.push(TrackEvent { delta, kind });
        self.pending = 0;
        Ok(())
    }

    fn midi(&mut self, message: MidiMessage) -> Result<()> {
        self.push(TrackEventKind::Midi {
            channel: self.channel,
            message,
        })
    }
}

impl MidiSink for SmfWriter {
    fn set_channel(&mut self, channel: u8) -> Result<()> {
        if channel > 15 {
            bail!("MIDI channel {} is out of range..!", channel);
        }

        self.channel = channel.into();
        Ok(())
    }

    fn note_on(&mut self, note: u8, velocity: u8) -> Result<()> {
        self.midi(MidiMessage::NoteOn {
            key: note.into(),
            vel: velocity.into(),
        })
    }

    fn note_off(&mut self, note: u8) -> Result<()> {
        self.midi(MidiMessage::NoteOff {
            key: note.into(),
            vel: 0.into(),
        })
    }

    fn pitch_bend(&mut self, bend: i16) -> Result<()> {
        let raw = (bend.clamp(-8192, 8191) as i32 + 0x2000) as u16;
        self.midi(MidiMessage::PitchBend {
            bend: PitchBend(u14::from(raw)),
        })
    }

    fn program_change(&mut self, program: u8) -> Result<()> {
        self.midi(MidiMessage::ProgramChange {
            program: program.into(),
        })
    }

    fn control_change(&mut self, index: u8, value: u8) -> Result<()> {
        self.midi(MidiMessage::Controller {
            controller: index.into(),
            value: value.into(),
        })
    }

    fn tempo_bpm(&mut self, bpm: f64) -> Result<()> {
        let micros = u24::from(bpm_to_micros_per_beat(bpm));
        self.push(TrackEventKind::Meta(MetaMessage::Tempo(micros)))
    }

    fn advance_delta(&mut self, ticks: u32) -> Result<()> {
        self.pending = self
            .pending
            .checked_add(ticks)
            .ok_or_else(|| anyhow!("Delta overflow after {} more ticks..!", ticks))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::scheduler::render_song;
    use crate::model::config::SchedulerConfig;
    use crate::model::interval::Interval;
    use crate::model::song::{Event, Song};

    #[test]
    fn writes_deltas_and_end_of_track() {
        let mut writer = SmfWriter::new(960).unwrap();
        writer.tempo_bpm(120.0).unwrap();
        writer.set_channel(3).unwrap();
        writer.note_on(60, 100).unwrap();
        writer.advance_delta(480).unwrap();
        writer.advance_delta(480).unwrap();
        writer.note_off(60).unwrap();
        writer.advance_delta(10).unwrap();

        let bytes = writer.to_bytes().unwrap();
        let smf = Smf::parse(&bytes).unwrap();
        assert_eq!(smf.header.format, Format::SingleTrack);
        assert_eq!(smf.header.timing, Timing::Metrical(960.into()));
        assert_eq!(smf.tracks.len(), 1);

        let track = &smf.tracks[0];
        let deltas: Vec<u32> = track.iter().map(|e| e.delta.as_int()).collect();
        assert_eq!(deltas, vec![0, 0, 960, 10]);

        assert_eq!(track[0].kind, TrackEventKind::Meta(MetaMessage::Tempo(500_000.into())));
        assert_eq!(
            track[1].kind,
            TrackEventKind::Midi {
                channel: 3.into(),
                message: MidiMessage::NoteOn {
                    key: 60.into(),
                    vel: 100.into()
                },
            }
        );
        assert_eq!(track[3].kind, TrackEventKind::Meta(MetaMessage::EndOfTrack));
    }

    #[test]
    fn pitch_bend_is_centred() {
        let mut writer = SmfWriter::new(960).unwrap();
        writer.pitch_bend(0).unwrap();
        writer.pitch_bend(-8192).unwrap();
        writer.pitch_bend(i16::MAX).unwrap();

        let smf = writer.finish().unwrap();
        let bends: Vec<u16> = smf.tracks[0]
            .iter()
            .filter_map(|event| match event.kind {
                TrackEventKind::Midi {
                    message: MidiMessage::PitchBend { bend },
                    ..
                } => Some(bend.0.as_int()),
                _ => None,
            })
            .collect();
        assert_eq!(bends, vec![0x2000, 0, 0x3FFF]);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(SmfWriter::new(0).is_err());
        assert!(SmfWriter::new(40_000).is_err());

        let mut writer = SmfWriter::new(960).unwrap();
        assert!(writer.set_channel(16).is_err());
        writer.advance_delta(u32::MAX).unwrap();
        assert!(writer.advance_delta(1).is_err());
        assert!(writer.note_on(60, 100).is_err());
    }

    #[test]
    fn renders_a_microtonal_song() {
        env_logger::try_init().unwrap_or(());

        let mut song = Song::new("Quarter tones");
        let track = song.add_track(0);
        song.write_event(track, Event::note_on(0, Interval::Semitone(60.25), 90)).unwrap();
        song.write_event(track, Event::tempo(480, 60.0)).unwrap();
        song.write_event(track, Event::note_off(960)).unwrap();

        let writer = render_song(&song, SmfWriter::new(960).unwrap(), SchedulerConfig::default()).unwrap();
        let bytes = writer.to_bytes().unwrap();
        let smf = Smf::parse(&bytes).unwrap();

        let kinds: Vec<(u32, TrackEventKind)> = smf.tracks[0]
            .iter()
            .map(|event| (event.delta.as_int(), event.kind))
            .collect();
        let midi = |message| TrackEventKind::Midi {
            channel: 0.into(),
            message,
        };

        assert_eq!(
            kinds,
            vec![
                (0, TrackEventKind::Meta(MetaMessage::Tempo(500_000.into()))),
                (0, midi(MidiMessage::PitchBend { bend: PitchBend((0x2000 + 1024).into()) })),
                (0, midi(MidiMessage::NoteOn { key: 60.into(), vel: 90.into() })),
                (480, TrackEventKind::Meta(MetaMessage::Tempo(1_000_000.into()))),
                (480, midi(MidiMessage::NoteOff { key: 60.into(), vel: 0.into() })),
                (0, TrackEventKind::Meta(MetaMessage::EndOfTrack)),
            ]
        );
    }
}
