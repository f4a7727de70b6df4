pub mod engine;
pub mod midi_importer;
pub mod model;
pub mod player;
pub mod util;

pub use engine::MidiSink;
pub use engine::scheduler::{Scheduled, Scheduler, Signal, State, render_song};
pub use engine::smf::SmfWriter;
pub use midi_importer::*;
pub use model::config::*;
pub use model::interval::*;
pub use model::song::*;
pub use player::*;
pub use util::*;

#[cfg(feature = "live")]
pub use engine::port::{PortSink, list_ports};
