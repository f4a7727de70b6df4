use anyhow::Result;
use clap::Parser;
use log::{debug, info};
use microseq::{Args, Command, SmfWriter, Song, SongArgs, import_midi_file, render_song};

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Dump { song, max } => dump(&load(&song)?, max),
        Command::Export { song: song_args, out } => {
            let song = load(&song_args)?;
            let config = song_args.scheduler_config();
            let writer = render_song(&song, SmfWriter::new(config.ticks_per_beat)?, config)?;
            debug!("Rendered {} MIDI events..!", writer.event_count());
            writer.save(&out)
        }
        Command::Play {
            song,
            port,
            start_tick,
            verbose,
        } => live::play(&song, port.as_deref(), start_tick, verbose),
        Command::Ports => live::ports(),
    }
}

fn load(args: &SongArgs) -> Result<Song> {
    info!("Importing MIDI file: '{}'...", args.midi.display());
    import_midi_file(&args.midi, args.import_options())
}

fn dump(song: &Song, max: usize) -> Result<()> {
    info!(
        "Previewing at most {} of {} events in '{}'..!",
        max,
        song.event_count(),
        song.title
    );

    let mut events: Vec<(usize, u8, &microseq::Event)> = song
        .tracks
        .iter()
        .enumerate()
        .flat_map(|(index, track)| {
            track
                .events
                .iter()
                .map(move |event| (index, track.virtual_channel, event))
        })
        .collect();
    events.sort_by_key(|(index, _, event)| (event.tick, *index));

    for (index, channel, event) in events.into_iter().take(max) {
        info!(
            "tick={:>8} track={:>3} ch={:>2} {:?} float={:.4} bytes=({}, {})",
            event.tick,
            index,
            channel,
            event.kind,
            event.float_payload,
            event.byte_payload_1,
            event.byte_payload_2
        );
    }

    Ok(())
}

#[cfg(feature = "live")]
mod live {
    use super::load;
    use anyhow::Result;
    use log::{info, warn};
    use microseq::{Player, PortSink, SongArgs, list_ports};
    use std::sync::Arc;
    use std::time::Duration;

    pub fn play(args: &SongArgs, port: Option<&str>, start_tick: i64, verbose: bool) -> Result<()> {
        let song = load(args)?;
        let sink = PortSink::connect(port)?;
        let player = Arc::new(Player::new(sink, args.scheduler_config(), song)?);

        let player_for_handler = Arc::clone(&player);
        ctrlc::set_handler(move || {
            warn!("Ctrl-C received, stopping playback..!");
            let _ = player_for_handler.stop();
        })?;

        player.set_cursor(start_tick);
        player.start_from_cursor()?;

        while !player.wait_for_stop_timeout(Duration::from_millis(250))? {
            if verbose {
                info!("Playing at tick {}..!", player.current_tick());
            }
            if let Some(why) = player.take_error() {
                warn!("MIDI output error: {:?}", why);
            }
        }

        if let Some(why) = player.take_error() {
            warn!("MIDI output error: {:?}", why);
        }

        info!("Playback finished at tick {}, exiting..!", player.current_tick());
        Ok(())
    }

    pub fn ports() -> Result<()> {
        let ports = list_ports()?;
        if ports.is_empty() {
            info!("No MIDI output ports found..!");
        }

        for (index, name) in ports.iter().enumerate() {
            println!("{}: {}", index, name);
        }

        Ok(())
    }
}

#[cfg(not(feature = "live"))]
mod live {
    use anyhow::{Result, bail};
    use microseq::SongArgs;

    pub fn play(_args: &SongArgs, _port: Option<&str>, _start_tick: i64, _verbose: bool) -> Result<()> {
        bail!("Live playback needs the `live` feature: rebuild with `--features live`..!")
    }

    pub fn ports() -> Result<()> {
        bail!("Listing MIDI ports needs the `live` feature: rebuild with `--features live`..!")
    }
}
