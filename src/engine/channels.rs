use crate::engine::MidiSink;
use anyhow::Result;

pub const CONTROLLER_COUNT: usize = 128;

pub const CC_VOLUME: usize = 7;
pub const CC_PAN: usize = 10;
pub const CC_EXPRESSION: usize = 11;
pub const CC_RPN_LSB: usize = 100;
pub const CC_RPN_MSB: usize = 101;

/// Last known state of one MIDI channel, physical or virtual.
///
/// Physical channels use the whole record; virtual channels only track what the song asked
/// for (program and controllers) and leave the note bookkeeping untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelState {
    /// Tick the channel last went quiet, or `None` while it is sounding a note.
    pub last_note_off: Option<i64>,
    pub last_note_on: i64,
    /// Track that last played on this channel.
    pub owner: Option<usize>,
    pub program: u8,
    pub controllers: [u8; CONTROLLER_COUNT],
    pub pitch_bend: i16,
}

impl Default for ChannelState {
    /// General MIDI power-on state.
    fn default() -> Self {
        let mut controllers = [0; CONTROLLER_COUNT];
        controllers[CC_VOLUME] = 100;
        controllers[CC_PAN] = 64;
        controllers[CC_EXPRESSION] = 127;
        controllers[CC_RPN_LSB] = 0x7F;
        controllers[CC_RPN_MSB] = 0x7F;

        Self {
            last_note_off: Some(0),
            last_note_on: 0,
            owner: None,
            program: 0,
            controllers,
            pitch_bend: 0,
        }
    }
}

impl ChannelState {
    pub fn is_sounding(&self) -> bool {
        self.last_note_off.is_none()
    }

    pub fn mark_sounding(&mut self, tick: i64, owner: usize) {
        self.last_note_off = None;
        self.last_note_on = tick;
        self.owner = Some(owner);
    }

    pub fn mark_idle(&mut self, tick: i64) {
        self.last_note_off = Some(tick);
    }

    /// Track whose note is currently sounding here, if any.
    pub fn sounding_owner(&self) -> Option<usize> {
        if self.is_sounding() { self.owner } else { None }
    }
}

/// Picks the physical channel for the next note.
///
/// Among the channels that are not `reserved` and not sounding, the one that has been quiet
/// the longest wins, so a channel that has never played beats one that was just released.
/// When every candidate is sounding, the one whose note started first is stolen. Ties go to
/// the lowest index. Returns `None` only when every channel is reserved.
pub fn pick_physical_channel(states: &[ChannelState], reserved: &[usize]) -> Option<usize> {
    let candidates = || {
        states
            .iter()
            .enumerate()
            .filter(|(index, _)| !reserved.contains(index))
    };

    let idle = candidates()
        .filter_map(|(index, state)| state.last_note_off.map(|off| (off, index)))
        .min();

    idle.or_else(|| {
        candidates()
            .map(|(index, state)| (state.last_note_on, index))
            .min()
    })
    .map(|(_, index)| index)
}

/// Brings a physical channel in line with what a virtual channel expects, sending only the
/// controllers, program and bend that differ. The sink must already be on the physical channel.
///
/// Physical state is updated message by message, so a failed write leaves it describing
/// exactly what reached the synth and the next reconcile retries the rest.
pub fn update_virtual_to_physical<S: MidiSink + ?Sized>(
    sink: &mut S,
    virtual_state: &ChannelState,
    physical: &mut ChannelState,
    bend: Option<i16>,
) -> Result<()> {
    for index in 0..CONTROLLER_COUNT {
        sync_controller(sink, physical, index, virtual_state.controllers[index])?;
    }

    if physical.program != virtual_state.program {
        sink.program_change(virtual_state.program)?;
        physical.program = virtual_state.program;
    }

    if let Some(bend) = bend
        && physical.pitch_bend != bend
    {
        sink.pitch_bend(bend)?;
        physical.pitch_bend = bend;
    }

    Ok(())
}

/// Sends one controller value if the physical channel doesn't already have it.
pub fn sync_controller<S: MidiSink + ?Sized>(
    sink: &mut S,
    physical: &mut ChannelState,
    index: usize,
    value: u8,
) -> Result<()> {
    if physical.controllers[index] != value {
        sink.control_change(index as u8, value)?;
        physical.controllers[index] = value;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::testing::{Output, RecordingSink};

    const PERCUSSION: usize = 9;

    #[test]
    fn defaults_follow_general_midi() {
        let state = ChannelState::default();
        assert_eq!(state.controllers[CC_VOLUME], 100);
        assert_eq!(state.controllers[CC_PAN], 64);
        assert_eq!(state.controllers[CC_EXPRESSION], 127);
        assert_eq!(state.controllers[CC_RPN_LSB], 0x7F);
        assert_eq!(state.controllers[CC_RPN_MSB], 0x7F);
        assert_eq!(state.controllers[1], 0);
        assert_eq!(state.last_note_off, Some(0));
        assert!(!state.is_sounding());
    }

    #[test]
    fn picks_longest_idle_channel() {
        let mut states = vec![ChannelState::default(); 16];
        states[0].mark_idle(500);
        states[1].mark_idle(100);
        states[2].mark_sounding(50, 0);
        for state in states.iter_mut().skip(3) {
            state.mark_idle(900);
        }

        assert_eq!(pick_physical_channel(&states, &[PERCUSSION]), Some(1));

        states[1].mark_sounding(600, 1);
        assert_eq!(pick_physical_channel(&states, &[PERCUSSION]), Some(0));
    }

    #[test]
    fn never_played_channels_come_first() {
        let mut states = vec![ChannelState::default(); 16];
        states[0].mark_idle(10);
        assert_eq!(pick_physical_channel(&states, &[PERCUSSION]), Some(1));
    }

    #[test]
    fn percussion_is_never_picked() {
        let mut states = vec![ChannelState::default(); 16];
        for (index, state) in states.iter_mut().enumerate() {
            if index != PERCUSSION {
                state.mark_idle(1000);
            }
        }

        assert_eq!(pick_physical_channel(&states, &[PERCUSSION]), Some(0));
        let everything: Vec<usize> = (0..16).collect();
        assert_eq!(pick_physical_channel(&states, &everything), None);
    }

    #[test]
    fn round_robin_by_idleness() {
        let mut states = vec![ChannelState::default(); 16];
        let mut picks = Vec::new();

        for (track, tick) in (0..16).zip((0..).step_by(10)) {
            let channel = pick_physical_channel(&states, &[PERCUSSION]).unwrap();
            states[channel].mark_sounding(tick, track);
            states[channel].mark_idle(tick + 5);
            picks.push(channel);
        }

        let expected: Vec<usize> = (0..16).filter(|&c| c != PERCUSSION).chain([0]).collect();
        assert_eq!(picks, expected);
    }

    #[test]
    fn steals_oldest_note_when_all_busy() {
        let mut states = vec![ChannelState::default(); 16];
        for (index, state) in states.iter_mut().enumerate() {
            state.mark_sounding(100 - index as i64, index);
        }

        assert_eq!(pick_physical_channel(&states, &[PERCUSSION]), Some(15));
        assert_eq!(states[15].sounding_owner(), Some(15));
    }

    #[test]
    fn reconcile_sends_only_differences() {
        let mut sink = RecordingSink::default();
        let mut virtual_state = ChannelState::default();
        let mut physical = ChannelState::default();

        virtual_state.controllers[CC_VOLUME] = 80;
        virtual_state.controllers[1] = 30;
        virtual_state.program = 41;

        update_virtual_to_physical(&mut sink, &virtual_state, &mut physical, Some(-300)).unwrap();
        assert_eq!(
            sink.outputs(),
            vec![
                Output::Control(1, 30),
                Output::Control(7, 80),
                Output::Program(41),
                Output::PitchBend(-300),
            ]
        );

        sink.clear();
        update_virtual_to_physical(&mut sink, &virtual_state, &mut physical, Some(-300)).unwrap();
        update_virtual_to_physical(&mut sink, &virtual_state, &mut physical, None).unwrap();
        assert!(sink.outputs().is_empty());
    }
}
