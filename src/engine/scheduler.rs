use crate::engine::MidiSink;
use crate::engine::channels::{
    CONTROLLER_COUNT, ChannelState, pick_physical_channel, sync_controller,
    update_virtual_to_physical,
};
use crate::model::config::SchedulerConfig;
use crate::model::song::{Event, EventKind, Song};
use crate::util::{pitch_to_midi, ticks_to_duration};
use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

/// Everything the scheduler reacts to. `Continue` is posted back by the scheduler itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Start(i64),
    Continue { tick: i64, world: u64 },
    Stop,
    SongChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running(u64),
}

/// A signal the scheduler wants delivered after `delay` of wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub signal: Signal,
    pub delay: Duration,
}

/// Per-track playback state, indexed like `Song::tracks`. Never saved with the song.
#[derive(Debug, Clone, Copy, Default)]
struct TrackPlayback {
    active_note: Option<u8>,
    physical_channel: Option<usize>,
}

/// Order of the two passes over the events sharing a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Control,
    Notes,
}

/// Discrete-event playback of a `Song` into a `MidiSink`.
///
/// The scheduler only reacts to signals; whoever drives it decides whether the delay attached
/// to each follow-up `Continue` is slept through (live output) or skipped (file export).
pub struct Scheduler<S: MidiSink> {
    config: SchedulerConfig,
    sink: S,
    physical: Vec<ChannelState>,
    virtuals: Vec<ChannelState>,
    tracks: Vec<TrackPlayback>,
    state: State,
    world: u64,
    last_tick: i64,
    horizon: Option<i64>,
    bpm: f64,
    failure: Option<anyhow::Error>,
}

impl<S: MidiSink> Scheduler<S> {
    pub fn new(sink: S, config: SchedulerConfig) -> Self {
        Self {
            config,
            sink,
            physical: vec![ChannelState::default(); config.physical_channels],
            virtuals: vec![ChannelState::default(); config.virtual_channels],
            tracks: Vec::new(),
            state: State::Idle,
            world: 0,
            last_tick: 0,
            horizon: None,
            bpm: config.default_bpm,
            failure: None,
        }
    }

    /// Processes one signal and returns the follow-up the driver must deliver, if any.
    pub fn handle(&mut self, song: &Song, signal: Signal) -> Option<Scheduled> {
        self.forget_removed_tracks(song.tracks.len());
        self.tracks.resize(song.tracks.len(), TrackPlayback::default());

        match signal {
            Signal::Start(tick) => self.start(song, tick),
            Signal::Continue { tick, world } => self.advance(song, tick, world),
            Signal::Stop => {
                self.stop();
                None
            }
            Signal::SongChanged => {
                self.horizon = horizon(song, self.last_tick);
                None
            }
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running(_))
    }

    pub fn world(&self) -> u64 {
        self.world
    }

    pub fn last_tick(&self) -> i64 {
        self.last_tick
    }

    pub fn horizon(&self) -> Option<i64> {
        self.horizon
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn physical_channels(&self) -> &[ChannelState] {
        &self.physical
    }

    pub fn virtual_channel(&self, channel: usize) -> Option<&ChannelState> {
        self.virtuals.get(channel)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// First sink failure recorded since the last call. The step that hit it still ran to
    /// completion.
    pub fn take_failure(&mut self) -> Option<anyhow::Error> {
        self.failure.take()
    }

    fn start(&mut self, song: &Song, tick: i64) -> Option<Scheduled> {
        let tick = tick.max(0);
        if self.is_running() {
            self.release_all();
        }

        self.world += 1;
        self.state = State::Running(self.world);

        for channel in &mut self.physical {
            channel.last_note_off = Some(0);
            channel.owner = None;
        }
        self.tracks = vec![TrackPlayback::default(); song.tracks.len()];
        self.virtuals = vec![ChannelState::default(); self.config.virtual_channels];
        self.bpm = self.config.default_bpm;

        self.replay(song, tick);
        self.last_tick = tick;
        info!(
            "Starting '{}' at tick {} ({:.2} bpm, world {})..!",
            song.title, tick, self.bpm, self.world
        );

        let tempo_at_start = song
            .tracks
            .iter()
            .any(|track| matches!(track.event_at(tick), Some(e) if e.kind == EventKind::Tempo));
        if !tempo_at_start {
            let result = self.sink.tempo_bpm(self.bpm);
            note_failure(&mut self.failure, result);
        }

        self.play_tick(song, tick);
        self.horizon = horizon(song, tick);
        self.schedule_next(tick)
    }

    fn advance(&mut self, song: &Song, tick: i64, world: u64) -> Option<Scheduled> {
        if self.state != State::Running(world) {
            debug!(
                "Dropping stale continuation for tick {} (world {}, current {})..!",
                tick, world, self.world
            );
            return None;
        }

        let due: BTreeSet<i64> = song
            .tracks
            .iter()
            .flat_map(|track| track.events.iter().map(|event| event.tick))
            .filter(|&t| t > self.last_tick && t <= tick)
            .collect();

        let mut cursor = self.last_tick;
        for t in due {
            self.advance_delta(t - cursor);
            self.play_tick(song, t);
            cursor = t;
        }
        if tick > cursor {
            self.advance_delta(tick - cursor);
        }

        self.last_tick = self.last_tick.max(tick);
        self.horizon = horizon(song, self.last_tick);
        self.schedule_next(self.last_tick)
    }

    fn stop(&mut self) {
        if self.is_running() {
            self.release_all();
            info!("Playback stopped at tick {}..!", self.last_tick);
        }

        self.world += 1;
        self.state = State::Idle;
    }

    fn schedule_next(&mut self, from: i64) -> Option<Scheduled> {
        let Some(next) = self.horizon else {
            debug!("Nothing after tick {}, stopping..!", from);
            self.stop();
            return None;
        };

        let delay = ticks_to_duration(next - from, self.config.ticks_per_beat, self.bpm);
        debug!(
            "Next horizon at tick {} in {:.3}ms (world {})..!",
            next,
            delay.as_secs_f64() * 1000.0,
            self.world
        );

        Some(Scheduled {
            signal: Signal::Continue {
                tick: next,
                world: self.world,
            },
            delay,
        })
    }

    fn advance_delta(&mut self, ticks: i64) {
        let result = u32::try_from(ticks)
            .map_err(|_| anyhow!("Tick delta {} does not fit the output..!", ticks))
            .and_then(|ticks| self.sink.advance_delta(ticks));
        note_failure(&mut self.failure, result);
    }

    /// Rebuilds the controller, program and tempo state in force just before `tick`,
    /// without sending anything.
    fn replay(&mut self, song: &Song, tick: i64) {
        let mut earlier: Vec<(usize, &Event)> = song
            .tracks
            .iter()
            .enumerate()
            .flat_map(|(index, track)| track.events.iter().map(move |event| (index, event)))
            .filter(|(_, event)| event.tick >= 0 && event.tick < tick)
            .collect();
        earlier.sort_by_key(|(index, event)| (event.tick, *index));

        for (index, event) in earlier {
            let channel = song.tracks[index].virtual_channel as usize;
            match event.kind {
                EventKind::Controller => {
                    let controller = event.byte_payload_1 as usize;
                    if let Some(state) = self.virtuals.get_mut(channel)
                        && controller < CONTROLLER_COUNT
                    {
                        state.controllers[controller] = event.byte_payload_2 & 0x7F;
                    }
                }
                EventKind::Program => {
                    if let Some(state) = self.virtuals.get_mut(channel) {
                        state.program = event.byte_payload_1 & 0x7F;
                    }
                }
                EventKind::Tempo if valid_bpm(event.float_payload) => {
                    self.bpm = event.float_payload;
                }
                _ => {}
            }
        }
    }

    fn play_tick(&mut self, song: &Song, tick: i64) {
        for pass in [Pass::Control, Pass::Notes] {
            for (index, track) in song.tracks.iter().enumerate() {
                let Some(event) = track.event_at(tick) else {
                    continue;
                };

                let is_note = matches!(event.kind, EventKind::NoteOn | EventKind::DrumNoteOn);
                if is_note == (pass == Pass::Notes) {
                    self.play_event(song, index, event);
                }
            }
        }
    }

    fn play_event(&mut self, song: &Song, track: usize, event: &Event) {
        let channel = song.tracks[track].virtual_channel as usize;
        if channel >= self.virtuals.len() {
            warn!(
                "Track {} uses virtual channel {} which doesn't exist, skipping event at tick {}..!",
                track, channel, event.tick
            );
            return;
        }

        match event.kind {
            EventKind::NoteOn => self.note_on(track, channel, event),
            EventKind::DrumNoteOn => self.drum_note_on(track, channel, event),
            EventKind::NoteOff => self.release(track, event.tick),
            EventKind::Controller => {
                self.controller(song, channel, event.byte_payload_1, event.byte_payload_2)
            }
            // Sent with the next note on this channel so it lands in order with it.
            EventKind::Program => self.virtuals[channel].program = event.byte_payload_1 & 0x7F,
            EventKind::Tempo => self.tempo(event.float_payload),
            EventKind::Unknown => warn!(
                "Skipping unrecognized event on track {} at tick {}..!",
                track, event.tick
            ),
        }
    }

    fn note_on(&mut self, track: usize, channel: usize, event: &Event) {
        self.release(track, event.tick);

        let reserved = [self.config.percussion_channel];
        let Some(physical) = pick_physical_channel(&self.physical, &reserved) else {
            warn!("No physical channel available for track {}..!", track);
            return;
        };

        if let Some(owner) = self.physical[physical].sounding_owner() {
            warn!(
                "Stealing channel {} from track {} for track {} at tick {}..!",
                physical, owner, track, event.tick
            );
            self.release(owner, event.tick);
        }

        let (note, bend) = pitch_to_midi(event.float_payload);
        debug!(
            "Track {} note {} bend {} on channel {} at tick {}",
            track, note, bend, physical, event.tick
        );

        let result = self.sink.set_channel(physical as u8).and_then(|_| {
            update_virtual_to_physical(
                &mut self.sink,
                &self.virtuals[channel],
                &mut self.physical[physical],
                Some(bend),
            )
        });
        note_failure(&mut self.failure, result);

        let result = self.sink.note_on(note, event.byte_payload_1 & 0x7F);
        note_failure(&mut self.failure, result);

        self.physical[physical].mark_sounding(event.tick, track);
        self.tracks[track] = TrackPlayback {
            active_note: Some(note),
            physical_channel: Some(physical),
        };
    }

    fn drum_note_on(&mut self, track: usize, channel: usize, event: &Event) {
        self.release(track, event.tick);

        let percussion = self.config.percussion_channel;
        if percussion >= self.physical.len() {
            warn!("Percussion channel {} doesn't exist, skipping drum note..!", percussion);
            return;
        }

        let (note, velocity) = (event.byte_payload_1 & 0x7F, event.byte_payload_2 & 0x7F);
        let result = self.sink.set_channel(percussion as u8).and_then(|_| {
            update_virtual_to_physical(
                &mut self.sink,
                &self.virtuals[channel],
                &mut self.physical[percussion],
                None,
            )
        });
        note_failure(&mut self.failure, result);

        let result = self.sink.play_note(percussion as u8, note, velocity);
        note_failure(&mut self.failure, result);

        self.physical[percussion].owner = Some(track);
        self.tracks[track] = TrackPlayback {
            active_note: Some(note),
            physical_channel: Some(percussion),
        };
    }

    /// Ends the note sounding on `track`, if any.
    fn release(&mut self, track: usize, tick: i64) {
        let Some(playback) = self.tracks.get_mut(track) else {
            return;
        };
        let (Some(note), Some(channel)) = (playback.active_note.take(), playback.physical_channel)
        else {
            return;
        };

        let result = self
            .sink
            .set_channel(channel as u8)
            .and_then(|_| self.sink.note_off(note));
        note_failure(&mut self.failure, result);

        if channel != self.config.percussion_channel
            && let Some(state) = self.physical.get_mut(channel)
            && state.sounding_owner() == Some(track)
        {
            state.mark_idle(tick);
        }
    }

    /// Silences tracks an edit removed and frees the channels they held.
    fn forget_removed_tracks(&mut self, track_count: usize) {
        if self.tracks.len() <= track_count {
            return;
        }

        let tick = self.last_tick;
        for track in track_count..self.tracks.len() {
            self.release(track, tick);
        }

        for channel in &mut self.physical {
            if channel.owner.is_some_and(|owner| owner >= track_count) {
                if channel.is_sounding() {
                    channel.mark_idle(tick);
                }
                channel.owner = None;
            }
        }

        debug!(
            "Dropped playback state for {} removed tracks..!",
            self.tracks.len() - track_count
        );
    }

    fn release_all(&mut self) {
        let tick = self.last_tick;
        for track in 0..self.tracks.len() {
            self.release(track, tick);
        }
    }

    fn controller(&mut self, song: &Song, channel: usize, index: u8, value: u8) {
        let index = index as usize;
        if index >= CONTROLLER_COUNT {
            warn!("Skipping controller {} on virtual channel {}..!", index, channel);
            return;
        }

        let value = value & 0x7F;
        self.virtuals[channel].controllers[index] = value;

        let mut bound: Vec<usize> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(track, _)| song.tracks[*track].virtual_channel as usize == channel)
            .filter_map(|(track, playback)| {
                let physical = playback.physical_channel?;
                (self.physical.get(physical)?.owner == Some(track)).then_some(physical)
            })
            .collect();
        bound.sort_unstable();
        bound.dedup();

        for physical in bound {
            let result = self.sink.set_channel(physical as u8).and_then(|_| {
                sync_controller(&mut self.sink, &mut self.physical[physical], index, value)
            });
            note_failure(&mut self.failure, result);
        }
    }

    fn tempo(&mut self, bpm: f64) {
        if !valid_bpm(bpm) {
            warn!("Ignoring invalid tempo {}..!", bpm);
            return;
        }

        self.bpm = bpm;
        let result = self.sink.tempo_bpm(bpm);
        note_failure(&mut self.failure, result);
    }
}

/// Earliest tick after `tick` holding an event on any track.
fn horizon(song: &Song, tick: i64) -> Option<i64> {
    song.tracks
        .iter()
        .filter_map(|track| track.next_tick_after(tick))
        .min()
}

fn valid_bpm(bpm: f64) -> bool {
    bpm.is_finite() && bpm > 0.0
}

fn note_failure(slot: &mut Option<anyhow::Error>, result: Result<()>) {
    if let Err(why) = result {
        warn!("MIDI output failed: {:?}", why);
        if slot.is_none() {
            *slot = Some(why);
        }
    }
}

/// Plays `song` from the top into `sink` as fast as possible, for file export.
pub fn render_song<S: MidiSink>(song: &Song, sink: S, config: SchedulerConfig) -> Result<S> {
    let mut scheduler = Scheduler::new(sink, config);
    let mut queue = VecDeque::from([Signal::Start(0)]);

    while let Some(signal) = queue.pop_front() {
        let next = scheduler.handle(song, signal);
        if let Some(why) = scheduler.take_failure() {
            return Err(why.context(format!("Failed to render '{}'", song.title)));
        }

        if let Some(next) = next {
            queue.push_back(next.signal);
        }
    }

    Ok(scheduler.into_sink())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::testing::{Output, RecordingSink};
    use crate::model::interval::Interval;

    fn note(tick: i64, pitch: f64) -> Event {
        Event::note_on(tick, Interval::Semitone(pitch), 100)
    }

    fn scheduler(sink: &RecordingSink) -> Scheduler<RecordingSink> {
        Scheduler::new(sink.clone(), SchedulerConfig::default())
    }

    /// Delivers every follow-up immediately until the scheduler goes idle.
    fn run_to_end(scheduler: &mut Scheduler<RecordingSink>, song: &Song, start: i64) {
        let mut next = scheduler.handle(song, Signal::Start(start));
        while let Some(scheduled) = next {
            next = scheduler.handle(song, scheduled.signal);
        }
    }

    #[test]
    fn starts_mid_song_without_replaying_notes() {
        env_logger::try_init().unwrap_or(());

        let mut song = Song::new("Seek");
        let track = song.add_track(0);
        song.write_event(track, note(0, 57.0)).unwrap();
        song.write_event(track, Event::note_off(480)).unwrap();
        song.write_event(track, note(960, 59.0)).unwrap();

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);

        let next = scheduler.handle(&song, Signal::Start(500)).unwrap();
        assert!(sink.note_ons().is_empty());
        assert_eq!(next.signal, Signal::Continue { tick: 960, world: 1 });
        assert_eq!(next.delay, ticks_to_duration(460, 960, 120.0));
        assert!((next.delay.as_secs_f64() - 0.2395833333).abs() < 1e-6);

        let after = scheduler.handle(&song, next.signal);
        assert_eq!(after, None);
        assert_eq!(sink.note_ons(), vec![(0, 59)]);
        assert_eq!(scheduler.state(), State::Idle);
        assert_eq!(*sink.outputs().last().unwrap(), Output::NoteOff(59));
    }

    #[test]
    fn stale_continuations_are_dropped() {
        let mut song = Song::new("Stale");
        let track = song.add_track(0);
        song.write_event(track, note(0, 60.0)).unwrap();
        song.write_event(track, note(960, 62.0)).unwrap();
        song.write_event(track, note(1920, 64.0)).unwrap();

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);

        let stale = scheduler.handle(&song, Signal::Start(0)).unwrap();
        scheduler.handle(&song, Signal::Stop);
        let fresh = scheduler.handle(&song, Signal::Start(960)).unwrap();
        sink.clear();

        assert_eq!(scheduler.handle(&song, stale.signal), None);
        assert!(sink.outputs().is_empty());
        assert!(scheduler.is_running());

        assert_eq!(fresh.signal, Signal::Continue { tick: 1920, world: 3 });
        scheduler.handle(&song, fresh.signal);
        assert_eq!(sink.note_ons(), vec![(1, 64)]);
    }

    #[test]
    fn replay_restores_controllers_programs_and_tempo() {
        let mut song = Song::new("Replay");
        let control = song.add_track(2);
        let notes = song.add_track(2);
        song.write_event(control, Event::program(0, 19)).unwrap();
        song.write_event(control, Event::tempo(10, 90.0)).unwrap();
        song.write_event(control, Event::controller(20, 7, 64)).unwrap();
        song.write_event(notes, note(0, 60.0)).unwrap();
        song.write_event(notes, note(960, 60.5)).unwrap();

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);
        scheduler.handle(&song, Signal::Start(960));

        assert_eq!(scheduler.bpm(), 90.0);
        assert_eq!(scheduler.virtual_channel(2).unwrap().program, 19);
        assert_eq!(
            sink.on_channels(),
            vec![
                (0, Output::Tempo(90.0)),
                (0, Output::Control(7, 64)),
                (0, Output::Program(19)),
                (0, Output::PitchBend(-2048)),
                (0, Output::NoteOn(61, 100)),
                (0, Output::NoteOff(61)),
            ]
        );
    }

    #[test]
    fn allocates_channels_round_robin_by_idleness() {
        let mut song = Song::new("Round robin");
        for index in 0..16i64 {
            let track = song.add_track(0);
            song.write_event(track, note(index * 100, 60.0)).unwrap();
            song.write_event(track, Event::note_off(index * 100 + 50)).unwrap();
        }

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);
        run_to_end(&mut scheduler, &song, 0);

        let channels: Vec<u8> = sink.note_ons().into_iter().map(|(channel, _)| channel).collect();
        let expected: Vec<u8> = (0..16).filter(|&c| c != 9).chain([0]).collect();
        assert_eq!(channels, expected);
    }

    #[test]
    fn program_changes_wait_for_the_next_note() {
        let mut song = Song::new("Programs");
        let notes = song.add_track(0);
        let control = song.add_track(0);
        song.write_event(notes, note(0, 60.0)).unwrap();
        song.write_event(control, Event::program(0, 5)).unwrap();
        song.write_event(control, Event::program(480, 6)).unwrap();
        song.write_event(notes, Event::note_off(960)).unwrap();

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);
        run_to_end(&mut scheduler, &song, 0);

        let outputs: Vec<Output> = sink.on_channels().into_iter().map(|(_, o)| o).collect();
        assert_eq!(
            outputs,
            vec![
                Output::Tempo(120.0),
                Output::Program(5),
                Output::NoteOn(60, 100),
                Output::Delta(480),
                Output::Delta(480),
                Output::NoteOff(60),
            ]
        );
    }

    #[test]
    fn controllers_follow_sounding_notes() {
        let mut song = Song::new("Controllers");
        let first = song.add_track(3);
        let second = song.add_track(3);
        let other = song.add_track(4);
        song.write_event(first, note(0, 60.0)).unwrap();
        song.write_event(second, note(0, 64.0)).unwrap();
        song.write_event(other, note(0, 67.0)).unwrap();
        song.write_event(other, Event::controller(480, 1, 90)).unwrap();

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);
        let next = scheduler.handle(&song, Signal::Start(0)).unwrap();
        sink.clear();

        let mut controller_song = song.clone();
        controller_song.tracks[other].events.clear();
        controller_song.write_event(first, Event::controller(480, 1, 90)).unwrap();
        scheduler.handle(&controller_song, next.signal);

        let outputs = sink.on_channels();
        assert!(outputs.contains(&(0, Output::Control(1, 90))));
        assert!(outputs.contains(&(1, Output::Control(1, 90))));
        assert!(!outputs.contains(&(2, Output::Control(1, 90))));
        assert_eq!(scheduler.virtual_channel(3).unwrap().controllers[1], 90);
    }

    #[test]
    fn drums_use_percussion_channel() {
        let mut song = Song::new("Drums");
        let track = song.add_track(9);
        song.write_event(track, Event::drum_note_on(0, 36, 110)).unwrap();
        song.write_event(track, Event::drum_note_on(480, 38, 90)).unwrap();

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);
        run_to_end(&mut scheduler, &song, 0);

        let outputs = sink.on_channels();
        assert!(outputs.contains(&(9, Output::NoteOn(36, 110))));
        assert!(outputs.contains(&(9, Output::NoteOff(36))));
        assert!(outputs.contains(&(9, Output::NoteOn(38, 90))));
        assert!(!outputs.iter().any(|(_, o)| matches!(o, Output::PitchBend(_))));
    }

    #[test]
    fn steals_when_every_channel_sounds() {
        let mut song = Song::new("Crowded");
        for index in 0..16i64 {
            let track = song.add_track(0);
            song.write_event(track, note(index, 40.0 + index as f64)).unwrap();
        }

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);
        run_to_end(&mut scheduler, &song, 0);

        let outputs = sink.on_channels();
        let steal = outputs
            .iter()
            .position(|o| *o == (0, Output::NoteOn(55, 100)))
            .unwrap();
        assert_eq!(outputs[steal - 1], (0, Output::NoteOff(40)));
    }

    #[test]
    fn unknown_events_are_skipped() {
        let mut song = Song::new("Damaged");
        let track = song.add_track(0);
        song.write_event(track, note(0, 60.0)).unwrap();
        let mut broken = Event::note_off(480);
        broken.kind = EventKind::Unknown;
        song.write_event(track, broken).unwrap();
        song.write_event(track, note(960, 62.0)).unwrap();

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);
        run_to_end(&mut scheduler, &song, 0);

        assert_eq!(sink.note_ons(), vec![(0, 60), (1, 62)]);
    }

    #[test]
    fn sink_failures_do_not_stop_playback() {
        let mut song = Song::new("Flaky");
        let track = song.add_track(0);
        song.write_event(track, note(0, 60.0)).unwrap();
        song.write_event(track, note(960, 62.0)).unwrap();

        let mut scheduler = Scheduler::new(RecordingSink::failing(), SchedulerConfig::default());
        let next = scheduler.handle(&song, Signal::Start(0));
        assert!(scheduler.take_failure().is_some());
        assert!(scheduler.take_failure().is_none());

        let next = next.unwrap();
        assert_eq!(next.signal, Signal::Continue { tick: 960, world: 1 });
        scheduler.handle(&song, next.signal);
        assert!(scheduler.take_failure().is_some());
        assert_eq!(scheduler.last_tick(), 960);
    }

    #[test]
    fn tempo_changes_pace_the_next_wait() {
        let mut song = Song::new("Tempo");
        let track = song.add_track(0);
        song.write_event(track, Event::tempo(0, 60.0)).unwrap();
        song.write_event(track, Event::tempo(960, 240.0)).unwrap();
        song.write_event(track, Event::note_off(1920)).unwrap();

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);
        let first = scheduler.handle(&song, Signal::Start(0)).unwrap();
        assert_eq!(first.delay, Duration::from_secs(1));
        let second = scheduler.handle(&song, first.signal).unwrap();
        assert_eq!(second.delay, Duration::from_millis(250));
        assert_eq!(
            sink.outputs(),
            vec![Output::Tempo(60.0), Output::Delta(960), Output::Tempo(240.0)]
        );
    }

    #[test]
    fn song_changes_move_the_horizon() {
        let mut song = Song::new("Edited");
        let track = song.add_track(0);
        song.write_event(track, note(0, 60.0)).unwrap();

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);
        scheduler.handle(&song, Signal::Stop);
        assert_eq!(scheduler.horizon(), None);

        song.write_event(track, note(480, 62.0)).unwrap();
        scheduler.handle(&song, Signal::SongChanged);
        assert_eq!(scheduler.horizon(), Some(480));
    }

    #[test]
    fn removed_tracks_are_silenced() {
        env_logger::try_init().unwrap_or(());

        let mut song = Song::new("Shrinking");
        let kept = song.add_track(0);
        let removed = song.add_track(0);
        song.write_event(kept, note(0, 60.0)).unwrap();
        song.write_event(kept, Event::note_off(960)).unwrap();
        song.write_event(removed, note(0, 64.0)).unwrap();

        let sink = RecordingSink::default();
        let mut scheduler = scheduler(&sink);
        scheduler.handle(&song, Signal::Start(0)).unwrap();
        assert_eq!(sink.note_ons(), vec![(0, 60), (1, 64)]);
        sink.clear();

        song.tracks.pop();
        scheduler.handle(&song, Signal::SongChanged);
        assert_eq!(sink.on_channels(), vec![(1, Output::NoteOff(64))]);
        assert!(!scheduler.physical_channels()[1].is_sounding());
        assert_eq!(scheduler.physical_channels()[1].owner, None);
        assert!(scheduler.physical_channels()[0].is_sounding());

        scheduler.handle(&song, Signal::Stop);
        assert_eq!(
            sink.on_channels(),
            vec![(1, Output::NoteOff(64)), (0, Output::NoteOff(60))]
        );
        assert!(scheduler.physical_channels().iter().all(|c| !c.is_sounding()));
    }

    #[test]
    fn render_stops_at_the_end() {
        let mut song = Song::new("Render");
        let track = song.add_track(0);
        song.write_event(track, note(0, 60.0)).unwrap();
        song.write_event(track, Event::note_off(960)).unwrap();

        let sink = render_song(&song, RecordingSink::default(), SchedulerConfig::default()).unwrap();
        assert_eq!(
            sink.on_channels(),
            vec![
                (0, Output::Tempo(120.0)),
                (0, Output::NoteOn(60, 100)),
                (0, Output::Delta(960)),
                (0, Output::NoteOff(60)),
            ]
        );

        let failed = render_song(&song, RecordingSink::failing(), SchedulerConfig::default());
        assert!(failed.is_err());
    }
}
