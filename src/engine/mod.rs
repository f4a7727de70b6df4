use anyhow::Result;

pub mod channels;
pub mod scheduler;
pub mod smf;

#[cfg(feature = "live")]
pub mod port;

/// Where the scheduler's MIDI output goes.
///
/// The sink is channel-stateful: `set_channel` selects the channel that every following
/// message is sent on.
pub trait MidiSink: Send {
    fn set_channel(&mut self, channel: u8) -> Result<()>;

    fn note_on(&mut self, note: u8, velocity: u8) -> Result<()>;

    fn note_off(&mut self, note: u8) -> Result<()>;

    /// Signed bend around the centre, in `-8192..=8191`.
    fn pitch_bend(&mut self, bend: i16) -> Result<()>;

    fn program_change(&mut self, program: u8) -> Result<()>;

    fn control_change(&mut self, index: u8, value: u8) -> Result<()>;

    /// Only file output records tempo; live ports follow it through their pacing instead.
    fn tempo_bpm(&mut self, _bpm: f64) -> Result<()> {
        Ok(())
    }

    /// Moves the write position forward by `ticks`. Only file output needs this.
    fn advance_delta(&mut self, _ticks: u32) -> Result<()> {
        Ok(())
    }

    /// Sends a note-on on `channel` in one go.
    fn play_note(&mut self, channel: u8, note: u8, velocity: u8) -> Result<()> {
        self.set_channel(channel)?;
        self.note_on(note, velocity)
    }
}
