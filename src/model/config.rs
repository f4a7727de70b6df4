use crate::midi_importer::ImportOptions;
use crate::model::interval::Interval;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Quantization grid for all tick arithmetic.
pub const TICKS_PER_BEAT: i64 = 960;
pub const PERCUSSION_CHANNEL: usize = 9;
pub const VIRTUAL_CHANNELS: usize = 16;
pub const PHYSICAL_CHANNELS: usize = 16;
pub const DEFAULT_BPM: f64 = 120.0;

/// Fixed parameters of a scheduler, handed over at construction and never changed afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub ticks_per_beat: i64,
    pub physical_channels: usize,
    pub virtual_channels: usize,
    pub percussion_channel: usize,
    pub default_bpm: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ticks_per_beat: TICKS_PER_BEAT,
            physical_channels: PHYSICAL_CHANNELS,
            virtual_channels: VIRTUAL_CHANNELS,
            percussion_channel: PERCUSSION_CHANNEL,
            default_bpm: DEFAULT_BPM,
        }
    }
}

impl SchedulerConfig {
    pub fn with_bpm(self, default_bpm: f64) -> Self {
        Self {
            default_bpm,
            ..self
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "microseq",
    about = "Play or render a MIDI file through a microtonal sequencer"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a MIDI file live through a MIDI output port.
    Play {
        #[command(flatten)]
        song: SongArgs,

        /// Name (or part of the name) of the output port. Defaults to the first port.
        #[arg(short, long)]
        port: Option<String>,

        /// Tick to start playback from (960 ticks per beat).
        #[arg(short, long, default_value_t = 0)]
        start_tick: i64,

        /// Prints the playback position while playing.
        #[arg(short, long)]
        verbose: bool,
    },

    /// Render a MIDI file through the sequencer into a single-track Standard MIDI File.
    Export {
        #[command(flatten)]
        song: SongArgs,

        /// Where to write the rendered file.
        out: PathBuf,
    },

    /// Dry run: print the imported timeline and exit.
    Dump {
        #[command(flatten)]
        song: SongArgs,

        /// Maximum events to print.
        #[arg(short, long, default_value_t = 80)]
        max: usize,
    },

    /// List the available MIDI output ports.
    Ports,
}

#[derive(clap::Args, Debug)]
pub struct SongArgs {
    /// Path to the source MIDI file.
    pub midi: PathBuf,

    /// Transpose by an interval: semitones (`-2.5`), a ratio (`3/2`) or EDO steps (`7\31`).
    #[arg(short, long, default_value = "0", allow_hyphen_values = true)]
    pub transpose: Interval,

    /// Retune each key to steps of this many equal divisions of the octave, around middle C.
    #[arg(short, long)]
    pub edo: Option<i64>,

    /// Tempo used until the song's first tempo event.
    #[arg(short, long, default_value_t = DEFAULT_BPM)]
    pub bpm: f64,
}

impl SongArgs {
    pub fn import_options(&self) -> ImportOptions {
        ImportOptions {
            transpose: self.transpose,
            edo: self.edo,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default().with_bpm(self.bpm)
    }
}
