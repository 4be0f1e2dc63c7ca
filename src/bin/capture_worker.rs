//! `hearth-capture`: the isolated audio capture worker.
//!
//! Spawned by the main process; reads the microphone and writes fixed
//! binary frames to stdout until killed. A driver fault here takes down
//! this process only — the parent's watchdog respawns it.

use anyhow::Result;
use hearth::config::AudioConfig;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = AudioConfig::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sample-rate" => {
                if let Some(v) = args.next() {
                    config.sample_rate = v.parse()?;
                }
            }
            "--frame-samples" => {
                if let Some(v) = args.next() {
                    config.frame_samples = v.parse()?;
                }
            }
            "--device" => {
                config.input_device = args.next();
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    let mut stdout = std::io::stdout().lock();
    hearth::audio::worker::run(&config, &mut stdout)?;
    Ok(())
}
