use crate::engine::MidiSink;
use anyhow::{Result, anyhow, bail};
use log::{debug, info};
use midir::{MidiOutput, MidiOutputConnection};
use midly::live::LiveEvent;
use midly::num::{u4, u14};
use midly::{MidiMessage, PitchBend};

const CLIENT_NAME: &str = "microseq";

/// Names of the MIDI output ports currently visible.
pub fn list_ports() -> Result<Vec<String>> {
    let output = MidiOutput::new(CLIENT_NAME)
        .map_err(|why| anyhow!("Failed to open MIDI output: {}", why))?;

    Ok(output
        .ports()
        .iter()
        .filter_map(|port| output.port_name(port).ok())
        .collect())
}

/// Real-time output through a MIDI port.
pub struct PortSink {
    connection: MidiOutputConnection,
    channel: u4,
    buffer: Vec<u8>,
}

impl PortSink {
    /// Connects to the first port whose name contains `name`, or the first port at all.
    pub fn connect(name: Option<&str>) -> Result<Self> {
        let output = MidiOutput::new(CLIENT_NAME)
            .map_err(|why| anyhow!("Failed to open MIDI output: {}", why))?;

        let ports = output.ports();
        let found = ports.iter().find(|port| match (name, output.port_name(port)) {
            (None, _) => true,
            (Some(wanted), Ok(actual)) => actual.to_lowercase().contains(&wanted.to_lowercase()),
            (Some(_), Err(_)) => false,
        });

        let Some(port) = found else {
            match name {
                Some(wanted) => bail!("No MIDI output port matching '{}'..!", wanted),
                None => bail!("No MIDI output ports available..!"),
            }
        };

        let port_name = output
            .port_name(port)
            .unwrap_or_else(|_| String::from("<unnamed>"));
        let connection = output
            .connect(port, "playback")
            .map_err(|why| anyhow!("Failed to connect to '{}': {}", port_name, why))?;

        info!("Connected to MIDI port: '{}'..!", port_name);
        Ok(Self {
            connection,
            channel: 0.into(),
            buffer: Vec::with_capacity(3),
        })
    }

    fn send(&mut self, message: MidiMessage) -> Result<()> {
        self.buffer.clear();
        LiveEvent::Midi {
            channel: self.channel,
            message,
        }
        .write_std(&mut self.buffer)?;

        debug!("MIDI out: {:02X?}", self.buffer);
        self.connection
            .send(&self.buffer)
            .map_err(|why| anyhow!("MIDI port write failed: {}", why))
    }
}

impl MidiSink for PortSink {
    fn set_channel(&mut self, channel: u8) -> Result<()> {
        if channel > 15 {
            bail!("MIDI channel {} is out of range..!", channel);
        }

        self.channel = channel.into();
        Ok(())
    }

    fn note_on(&mut self, note: u8, velocity: u8) -> Result<()> {
        self.send(MidiMessage::NoteOn {
            key: note.into(),
            vel: velocity.into(),
        })
    }

    fn note_off(&mut self, note: u8) -> Result<()> {
        self.send(MidiMessage::NoteOff {
            key: note.into(),
            vel: 0.into(),
        })
    }

    fn pitch_bend(&mut self, bend: i16) -> Result<()> {
        let raw = (bend.clamp(-8192, 8191) as i32 + 0x2000) as u16;
        self.send(MidiMessage::PitchBend {
            bend: PitchBend(u14::from(raw)),
        })
    }

    fn program_change(&mut self, program: u8) -> Result<()> {
        self.send(MidiMessage::ProgramChange {
            program: program.into(),
        })
    }

    fn control_change(&mut self, index: u8, value: u8) -> Result<()> {
        self.send(MidiMessage::Controller {
            controller: index.into(),
            value: value.into(),
        })
    }
}
