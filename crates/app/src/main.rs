use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use clap::{Args, Parser, Subcommand};
use haptic_pulse_core::{
    evaluate, AppConfig, ManualHost, MediaItem, Parameters, PeakHold, PulseError, SampleBlock,
    StreamFormat, TransientDetector, TriggerEngine,
};
use tracing_subscriber::EnvFilter;

fn main() -> haptic_pulse_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Simulate(opts) => {
            let params = load_params(&cli.params, &config)?;
            run_simulate(&config, params, &opts)
        }
        Commands::Analyze { input, block_size } => {
            let params = load_params(&cli.params, &config)?;
            run_analyze(&input, &config, params, block_size)
        }
        Commands::Params { action } => run_params(&cli.params, &config, action),
    }
}

/// Persisted parameters win over the config file; without a persisted file the
/// config's parameters apply.
fn load_params(path: &Path, config: &AppConfig) -> haptic_pulse_core::Result<Parameters> {
    if path.exists() {
        Parameters::load(path)
    } else {
        Ok(config.parameters)
    }
}

fn run_simulate(
    config: &AppConfig,
    params: Parameters,
    opts: &SimulateArgs,
) -> haptic_pulse_core::Result<()> {
    if opts.sample_rate <= 0.0 || opts.block_size == 0 {
        return Err(PulseError::msg("sample rate and block size must be positive"));
    }

    let host = Arc::new(ManualHost::new());
    let item = MediaItem::new(1, "simulated clip");
    host.add_track(&item, StreamFormat::mono(opts.sample_rate));

    let engine = TriggerEngine::new(host.clone(), config.detector, params)?;
    if let Some(sensitivity) = opts.sensitivity {
        engine.set_sensitivity(sensitivity);
    }
    if let Some(delay_ms) = opts.delay_ms {
        engine.set_delay_ms(delay_ms);
    }
    let params = engine.parameters();
    tracing::info!(
        sensitivity = params.sensitivity,
        delay_ms = params.delay_ms,
        sample_rate = opts.sample_rate,
        block_size = opts.block_size,
        "starting simulation"
    );

    engine.setup(&item);
    let updates = engine.updates();

    let silent = vec![0.0_f32; opts.block_size];
    let mut impulse = silent.clone();
    impulse[0] = opts.amplitude;

    let blocks_per_second = opts.sample_rate / opts.block_size as f64;
    let lead_in = (opts.lead_in_secs * blocks_per_second).ceil() as usize;
    let tail = (opts.tail_secs * blocks_per_second).ceil() as usize;
    let block_duration = Duration::from_secs_f64(1.0 / blocks_per_second);

    let start = Instant::now();
    let mut active = false;
    for index in 0..lead_in + 1 + tail {
        let block = if index == lead_in { &impulse } else { &silent };
        if index == lead_in {
            println!("{:>8.3}s  impulse (amplitude {})", secs(start), opts.amplitude);
        }
        host.render(block);

        for snapshot in updates.try_iter() {
            if snapshot.is_active != active {
                active = snapshot.is_active;
                println!(
                    "{:>8.3}s  active={active}  level={:.3}  visual={:.3}",
                    secs(start),
                    snapshot.current_level,
                    snapshot.visual_level
                );
            }
        }

        let due = start + block_duration * (index as u32 + 1);
        thread::sleep(due.saturating_duration_since(Instant::now()));
    }

    // Let the last scheduled deliveries land.
    let settle = Duration::from_secs_f64(params.delay_ms / 1000.0) + Duration::from_millis(100);
    thread::sleep(settle);
    for snapshot in updates.try_iter() {
        if snapshot.is_active != active {
            active = snapshot.is_active;
            println!("{:>8.3}s  active={active}", secs(start));
        }
    }

    engine.stop();
    tracing::info!(final_active = engine.is_active(), "simulation finished");
    Ok(())
}

fn secs(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

fn run_analyze(
    input: &Path,
    config: &AppConfig,
    params: Parameters,
    block_size: usize,
) -> haptic_pulse_core::Result<()> {
    tracing::info!(?input, "analysing file");
    let mut reader = hound::WavReader::open(input)
        .map_err(|err| PulseError::msg(format!("cannot open {}: {err}", input.display())))?;
    let wav = reader.spec();
    let channels = usize::from(wav.channels).max(1);
    let sample_rate = f64::from(wav.sample_rate);

    let samples: Vec<f32> = match wav.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>(),
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (wav.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 / scale))
                .collect::<Result<_, _>>()
        }
    }
    .map_err(|err| PulseError::msg(format!("failed to decode {}: {err}", input.display())))?;

    let mut detector = TransientDetector::new(config.detector);
    let mut peak = PeakHold::new(config.detector.peak_decay);
    let block_len = block_size.max(1) * channels;
    let mut frames = 0_usize;
    let mut active = false;
    let mut onsets = 0_usize;
    let mut loudest = 0.0_f32;

    for chunk in samples.chunks(block_len) {
        let block = SampleBlock::Interleaved {
            data: chunk,
            channels,
        };
        let max_in_batch = block
            .primary_channel()
            .fold(0.0_f32, |max, &sample| max.max(detector.step(sample)));
        let level = peak.update(max_in_batch);
        loudest = loudest.max(max_in_batch);
        let eval = evaluate(level, params.sensitivity, &config.detector);

        if eval.trigger != active {
            active = eval.trigger;
            let at = frames as f64 / sample_rate;
            let delivered = at + params.delay_ms / 1000.0;
            if active {
                onsets += 1;
            }
            println!(
                "{at:>9.3}s  {}  (delivered at {delivered:.3}s, peak {level:.3}, threshold {:.4})",
                if active { "on " } else { "off" },
                eval.threshold
            );
        }
        frames += block.frames();
    }

    println!(
        "{onsets} trigger onsets over {:.2}s (loudest detection {loudest:.3})",
        frames as f64 / sample_rate
    );
    Ok(())
}

fn run_params(
    path: &Path,
    config: &AppConfig,
    action: ParamsAction,
) -> haptic_pulse_core::Result<()> {
    let mut params = load_params(path, config)?;
    match action {
        ParamsAction::Show => {}
        ParamsAction::Set {
            sensitivity,
            intensity_scale,
            delay_ms,
        } => {
            if let Some(value) = sensitivity {
                params.sensitivity = value;
            }
            if let Some(value) = intensity_scale {
                params.intensity_scale = value;
            }
            if let Some(value) = delay_ms {
                params.delay_ms = value;
            }
            params = params.clamped();
            params.save(path)?;
            tracing::info!(?path, "parameters saved");
        }
    }
    println!("{}", format_params(&params));
    Ok(())
}

fn format_params(params: &Parameters) -> String {
    format!(
        "sensitivity     {:.3}\nintensity_scale {:.3}\ndelay_ms        {:.1}",
        params.sensitivity, params.intensity_scale, params.delay_ms
    )
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-reactive haptic trigger engine", long_about = None)]
struct Cli {
    /// JSON configuration with detector tuning and default parameters.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// File the tunable parameters are persisted in.
    #[arg(long, global = true, default_value = "haptic-pulse-params.json")]
    params: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive the engine in real time with silence, one impulse, then silence.
    Simulate(SimulateArgs),
    /// Run the detector over a WAV file and list trigger onsets.
    Analyze {
        /// Path to the WAV file that should be analysed.
        input: PathBuf,
        /// Frames per analysis block.
        #[arg(long, default_value_t = 512)]
        block_size: usize,
    },
    /// Show or change the persisted parameters.
    Params {
        #[command(subcommand)]
        action: ParamsAction,
    },
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Override the sensitivity for this run.
    #[arg(long)]
    sensitivity: Option<f64>,
    /// Override the trigger delay for this run.
    #[arg(long)]
    delay_ms: Option<f64>,
    #[arg(long, default_value_t = 48_000.0)]
    sample_rate: f64,
    #[arg(long, default_value_t = 512)]
    block_size: usize,
    /// Seconds of silence before the impulse.
    #[arg(long, default_value_t = 2.0)]
    lead_in_secs: f64,
    /// Seconds of silence after the impulse.
    #[arg(long, default_value_t = 1.0)]
    tail_secs: f64,
    #[arg(long, default_value_t = 1.0)]
    amplitude: f32,
}

#[derive(Subcommand, Debug)]
enum ParamsAction {
    /// Print the current values.
    Show,
    /// Update one or more values and persist them.
    Set {
        #[arg(long)]
        sensitivity: Option<f64>,
        #[arg(long)]
        intensity_scale: Option<f64>,
        #[arg(long)]
        delay_ms: Option<f64>,
    },
}
