use anyhow::{Error, Result};
use clap::Parser;
use kmsvnc::capture::{CaptureConfig, CaptureLoop, KmsPlatform};
use log::{info, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use encoder::EncoderSettings;
use sink::EncodingSink;
use std::path::PathBuf;
use tokio::{
    io::AsyncWrite,
    time::{self, MissedTickBehavior},
};

mod encoder;
mod sink;

#[derive(Parser)]
#[command(name = "kmsvnc")]
#[command(bin_name = "kmsvnc")]
struct Cli {
    /// Capture device, discovered under /dev/dri when omitted
    #[clap(short, long)]
    device: Option<PathBuf>,

    /// Capture rate in frames per second
    #[clap(long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(1..))]
    fps: u32,

    /// Where to write the H.264 stream, - for stdout
    #[clap(short, long, default_value = "-")]
    output: String,

    /// Encoder to use
    #[clap(short, long, default_value = "libx264")]
    encoder: String,

    /// Encoder option as key=value, may be repeated
    #[clap(short = 'x', long = "encoder-option", default_values_t = [
        String::from("preset=ultrafast"),
        String::from("tune=zerolatency"),
    ])]
    encoder_options: Vec<String>,

    /// Target bitrate in kbit/s
    #[clap(short, long, default_value_t = 5000)]
    bitrate: usize,

    /// Increase log verbosity, multiple occurrences (-vvv) further increase
    #[clap(short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    ffmpeg_next::init()?;

    let args = Cli::parse();
    let level_filter = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        3.. => LevelFilter::Trace,
    };

    // Logs go to stderr, stdout may carry the stream.
    TermLogger::init(
        level_filter,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    let settings = EncoderSettings {
        name: args.encoder,
        options: encoder::parse_options(&args.encoder_options)?,
        bitrate_kbps: args.bitrate,
        fps: args.fps,
    };
    let config = CaptureConfig {
        device: args.device,
        fps: args.fps,
        ..Default::default()
    };

    stream(config, settings, &args.output).await
}

async fn stream(config: CaptureConfig, settings: EncoderSettings, output: &str) -> Result<()> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    let output: Box<dyn AsyncWrite + Unpin + Send> = if output == "-" {
        Box::new(tokio::io::stdout())
    } else {
        Box::new(tokio::fs::File::create(output).await?)
    };
    let writer = tokio::task::spawn(sink::write_packets(rx, output));

    let mut sink = EncodingSink::new(settings, tx);
    let mut capture = CaptureLoop::new(KmsPlatform::new(config.fps), config);

    let mut ticker = time::interval(capture.config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                capture.tick(&mut sink);
            }
            r = &mut interrupt => {
                r?;
                info!("interrupted");
                break;
            }
        }
    }

    capture.shutdown();
    sink.finish()?;
    drop(sink);
    writer.await??;

    info!("delivered {} frames", capture.frames_delivered());
    Ok(())
}
