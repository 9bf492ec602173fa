//! drumline: drum sequencer playback from the command line

mod config;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use drumline_core::{NoteSource, Preferences, Song, TempoPlan, TickFrameConverter};
use drumline_services::{
    ActionMap, AudioEngine, EngineEvent, MidiTrigger, OfflineDriver, OfflineReport, SimulatedTransport,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{AppConfig, load_config, save_config};

const SELF_TEST_SAMPLE_RATES: [u32; 5] = [22050, 44100, 48000, 88200, 96000];
const SELF_TEST_BUFFER_SIZES: [u32; 3] = [64, 1024, 4096];

#[derive(Parser)]
#[command(name = "drumline")]
#[command(about = "Drum sequencer transport and timing engine", long_about = None)]
struct Cli {
    /// Song file (JSON), the built-in demo song when omitted
    #[arg(short, long, global = true)]
    song: Option<PathBuf>,

    /// Sample rate in Hz, overriding the config
    #[arg(long, global = true)]
    sample_rate: Option<u32>,

    /// Frames per process cycle, overriding the config
    #[arg(short, long, global = true)]
    buffer_size: Option<u32>,

    /// Loop the song instead of stopping at its end
    #[arg(long = "loop", global = true)]
    loop_mode: bool,

    /// Click on every beat
    #[arg(short, long, global = true)]
    metronome: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play the song on the default audio device
    Play {
        /// Stop after this many seconds
        #[arg(short, long, default_value = "30.0")]
        duration: f32,

        /// Store the effective preferences in the config file
        #[arg(long)]
        save_config: bool,
    },

    /// Run the engine without an audio device and report what it played
    Simulate {
        /// Number of process cycles, until the song ends when omitted
        #[arg(short, long)]
        cycles: Option<usize>,

        /// Follow the tempo markers of the song
        #[arg(short, long)]
        timeline: bool,

        /// Attach a simulated shared transport, as configured when omitted
        #[arg(long, value_enum)]
        shared: Option<SharedMode>,

        /// Tempo of the foreign leader with `--shared follow`
        #[arg(long, default_value = "100.0")]
        leader_bpm: f32,

        /// MIDI trigger fired before a cycle, as CYCLE:note:N or CYCLE:cc:N
        #[arg(long = "press", value_name = "CYCLE:KIND:NUMBER")]
        presses: Vec<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check frame/tick conversion and playback across driver configurations
    SelfTest,

    /// Show and edit tempo markers and tags
    Markers {
        /// Tempo marker as BAR=BPM, replacing any marker on that bar
        #[arg(short, long = "add", value_name = "BAR=BPM")]
        add: Vec<String>,

        /// Remove the tempo marker on BAR
        #[arg(long = "delete", value_name = "BAR")]
        delete: Vec<u32>,

        /// Tag as BAR=TEXT, replacing any tag on that bar
        #[arg(long = "tag", value_name = "BAR=TEXT")]
        tags: Vec<String>,

        /// Write the edited song to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SharedMode {
    Off,
    /// Register as leader
    Lead,
    /// Follow a foreign leader
    Follow,
}

#[derive(serde::Serialize)]
struct SimulationSummary {
    cycles: usize,
    skipped: u64,
    final_frame: i64,
    final_tick: f64,
    final_bpm: f32,
    role: String,
    notes: usize,
    metronome_clicks: usize,
    columns: Vec<usize>,
    peak: f32,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("drumline=debug".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = load_config();
    apply_overrides(&mut config.preferences, &cli);
    let prefs = config.preferences.clone().validate().context("Invalid preferences")?;
    let song = load_song(cli.song.as_deref())?;

    match cli.command {
        Commands::Play { duration, save_config: save } => {
            if save {
                save_config(&config);
            }
            play(song, prefs, &config, duration)
        }
        Commands::Simulate {
            cycles,
            timeline,
            shared,
            leader_bpm,
            presses,
            json,
        } => {
            let mut song = song;
            song.timeline_activated |= timeline;
            let shared = shared.unwrap_or(match (prefs.external_transport, prefs.timebase_leader) {
                (false, _) => SharedMode::Off,
                (true, true) => SharedMode::Lead,
                (true, false) => SharedMode::Follow,
            });
            simulate(song, prefs, &config, cycles, shared, leader_bpm, &presses, json)
        }
        Commands::SelfTest => self_test(song, &prefs),
        Commands::Markers {
            add,
            delete,
            tags,
            output,
        } => markers(song, prefs, &add, &delete, &tags, output.as_deref()),
    }
}

fn apply_overrides(prefs: &mut Preferences, cli: &Cli) {
    if let Some(sample_rate) = cli.sample_rate {
        prefs.sample_rate = sample_rate;
    }
    if let Some(buffer_size) = cli.buffer_size {
        prefs.buffer_size = buffer_size;
    }
    prefs.loop_mode |= cli.loop_mode;
    prefs.metronome |= cli.metronome;
}

fn load_song(path: Option<&Path>) -> Result<Song> {
    let Some(path) = path else {
        return Ok(Song::demo());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let song: Song = serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
    info!(song = %song.name, columns = song.columns.len(), "Loaded song");
    Ok(song)
}

fn action_map(config: &AppConfig) -> Result<ActionMap> {
    let map = ActionMap::from_entries(config.actions.iter().cloned()).context("Invalid action bindings")?;
    info!(bindings = map.len(), "Action bindings loaded");
    Ok(map)
}

fn play(song: Song, prefs: Preferences, config: &AppConfig, duration: f32) -> Result<()> {
    let actions = action_map(config)?;
    let mut engine = AudioEngine::new(song, prefs);
    let events = engine.events();
    engine.start().context("Failed to start audio output")?;

    let controller = engine.controller();
    if !actions.is_empty() {
        warn!("No MIDI input attached, action bindings stay idle");
    }
    controller.start();

    let started = Instant::now();
    let limit = Duration::from_secs_f32(duration.max(0.0).min(86_400.0));
    let mut ended = false;
    while started.elapsed() < limit && !ended {
        std::thread::sleep(Duration::from_millis(100));
        for event in events.try_iter() {
            match event {
                EngineEvent::SongEnded => ended = true,
                EngineEvent::TempoChanged { bpm } => info!(bpm, "Tempo"),
                EngineEvent::RoleChanged(role) => info!(?role, "Clock role"),
                _ => {}
            }
        }
        print!(
            "\rColumn: {:>3} | Tick: {:>8.2} | BPM: {:>6.2}",
            engine.current_column(),
            engine.current_tick(),
            engine.current_bpm()
        );
        let _ = std::io::stdout().flush();
    }
    println!();

    controller.stop();
    engine.stop()?;
    let skipped = engine.skipped_cycles();
    if skipped > 0 {
        warn!(skipped, "Cycles skipped while the engine was busy");
    }
    println!("Done.");
    Ok(())
}

fn parse_press(press: &str) -> Result<(usize, MidiTrigger)> {
    let mut parts = press.split(':');
    let (Some(cycle), Some(kind), Some(number), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
        bail!("Expected CYCLE:KIND:NUMBER, got {press}");
    };
    let cycle = cycle.parse().with_context(|| format!("Bad cycle in {press}"))?;
    let number: u8 = number.parse().with_context(|| format!("Bad number in {press}"))?;
    let trigger = match kind {
        "note" => MidiTrigger::Note(number),
        "cc" => MidiTrigger::Cc(number),
        other => return Err(anyhow!("Unknown trigger kind {other}")),
    };
    Ok((cycle, trigger))
}

#[allow(clippy::too_many_arguments)]
fn simulate(
    song: Song,
    prefs: Preferences,
    config: &AppConfig,
    cycles: Option<usize>,
    shared: SharedMode,
    leader_bpm: f32,
    presses: &[String],
    json: bool,
) -> Result<()> {
    let actions = action_map(config)?;
    let mut presses = presses.iter().map(|p| parse_press(p)).collect::<Result<Vec<_>>>()?;
    presses.sort_by_key(|(cycle, _)| *cycle);

    let sample_rate = prefs.sample_rate;
    let buffer_size = prefs.buffer_size;
    let engine = AudioEngine::new(song, prefs);
    let controller = engine.controller();

    let mut driver = OfflineDriver::new(&engine, buffer_size, 2);
    if shared != SharedMode::Off {
        let transport = SimulatedTransport::new(sample_rate);
        if shared == SharedMode::Follow {
            transport.install_foreign_leader(leader_bpm);
        }
        let granted = engine.enable_external_transport(Box::new(transport.client()), shared == SharedMode::Lead);
        if shared == SharedMode::Lead && !granted {
            warn!("Leader role not granted");
        }
        driver = driver.with_shared_transport(transport);
    }
    controller.start();

    let max_cycles = cycles.unwrap_or(1_000_000);
    let mut report = OfflineReport::default();
    let mut pending = presses.into_iter().peekable();
    for cycle in 0..max_cycles {
        while let Some((_, trigger)) = pending.next_if(|(at, _)| *at == cycle) {
            if !actions.dispatch(trigger, 127, &controller)? {
                warn!(%trigger, "No action bound");
            }
        }
        report.append(driver.run(1));
        if cycles.is_none() && !engine.is_playing() {
            break;
        }
    }

    let mut columns = Vec::new();
    let mut clicks = 0;
    for note in &report.notes {
        match note.source {
            NoteSource::Metronome { .. } => clicks += 1,
            NoteSource::Instrument(_) => {
                let column = note.column.max(0) as usize;
                if columns.len() <= column {
                    columns.resize(column + 1, 0);
                }
                columns[column] += 1;
            }
        }
    }

    let summary = SimulationSummary {
        cycles: report.cycles,
        skipped: report.skipped,
        final_frame: report.final_frame,
        final_tick: report.final_tick,
        final_bpm: report.final_bpm,
        role: format!("{:?}", report.role),
        notes: report.notes.len() - clicks,
        metronome_clicks: clicks,
        columns,
        peak: report.peak,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Cycles:     {} ({} skipped)", summary.cycles, summary.skipped);
        println!("Position:   frame {} / tick {:.3}", summary.final_frame, summary.final_tick);
        println!("Tempo:      {:.2} BPM ({})", summary.final_bpm, summary.role);
        println!("Notes:      {} (+{} clicks)", summary.notes, summary.metronome_clicks);
        for (column, count) in summary.columns.iter().enumerate() {
            println!("  column {column:>3}: {count} notes");
        }
    }
    Ok(())
}

fn self_test(song: Song, prefs: &Preferences) -> Result<()> {
    let mut failures = 0;

    for sample_rate in SELF_TEST_SAMPLE_RATES {
        for plan in [TempoPlan::Constant(song.bpm), TempoPlan::Timeline] {
            let converter = TickFrameConverter::for_song(&song, sample_rate, plan);
            let ok = converter.self_test(song.size_in_ticks().max(1) as f64 * 2.0);
            println!("conversion  {sample_rate:>6} Hz  {plan:?}: {}", if ok { "ok" } else { "FAILED" });
            failures += usize::from(!ok);
        }
    }

    let mut expected = None;
    for sample_rate in SELF_TEST_SAMPLE_RATES {
        for buffer_size in SELF_TEST_BUFFER_SIZES {
            let mut song = song.clone();
            song.loop_enabled = false;
            let prefs = Preferences {
                sample_rate,
                buffer_size,
                loop_mode: false,
                metronome: false,
                external_transport: false,
                ..prefs.clone()
            };
            let engine = AudioEngine::new(song, prefs);
            let mut driver = OfflineDriver::new(&engine, buffer_size, 2);
            engine.controller().start();
            let report = driver.run_until_stopped(10_000_000);

            let notes = report.notes.len();
            let ok = *expected.get_or_insert(notes) == notes && !engine.is_playing();
            println!("playback    {sample_rate:>6} Hz  {buffer_size:>5} frames: {notes} notes {}", if ok { "ok" } else { "FAILED" });
            failures += usize::from(!ok);
        }
    }

    if failures > 0 {
        bail!("{failures} self test configurations failed");
    }
    println!("All configurations passed.");
    Ok(())
}

fn split_assignment<'a>(arg: &'a str, what: &str) -> Result<(u32, &'a str)> {
    let (bar, value) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected BAR={what}, got {arg}"))?;
    let bar = bar.trim().parse().with_context(|| format!("Bad bar in {arg}"))?;
    Ok((bar, value))
}

fn markers(
    song: Song,
    prefs: Preferences,
    add: &[String],
    delete: &[u32],
    tags: &[String],
    output: Option<&Path>,
) -> Result<()> {
    let engine = AudioEngine::new(song, prefs);
    let controller = engine.controller();

    for &bar in delete {
        controller.delete_tempo_marker(bar);
    }
    for arg in add {
        let (bar, bpm) = split_assignment(arg, "BPM")?;
        let bpm: f32 = bpm.trim().parse().with_context(|| format!("Bad tempo in {arg}"))?;
        controller.add_tempo_marker(bar, bpm);
    }
    for arg in tags {
        let (bar, text) = split_assignment(arg, "TEXT")?;
        controller.add_tag(bar, text);
    }
    if !add.is_empty() {
        controller.activate_timeline(true);
    }

    println!("Tempo markers:");
    for marker in engine.tempo_markers() {
        println!("  bar {:>3}: {:.2} BPM", marker.bar, marker.bpm);
    }

    let bars = engine.with_song(|s| s.columns.len());
    println!("Bars:");
    for bar in 0..bars {
        let tag = engine.tag_at_bar(bar as u32, true).unwrap_or_default();
        println!("  {:>3}: {:>6.2} BPM  {}", bar, engine.tempo_at_bar(bar as i32), tag);
    }

    if let Some(path) = output {
        let text = engine.with_song(serde_json::to_string_pretty)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    Ok(())
}
