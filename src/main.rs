use tokio::signal;

use voicewire::{EngineConfig, InterviewEngine, SessionState};

const CONFIG_PATH: &str = "voicewire.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = match EngineConfig::load(CONFIG_PATH) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Using default config ({})", e);
            EngineConfig::default()
        }
    };
    log::info!("Channel endpoint: {}", config.channel_url);

    let mut engine = InterviewEngine::new(config);
    engine.connect();

    let mut mic_started = false;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down...");
                engine.disconnect();
                break;
            }
            _ = engine.step() => {
                // Open the microphone as soon as the channel is up
                if engine.state() == SessionState::Connected && !mic_started {
                    engine.start_recording();
                    mic_started = engine.state() == SessionState::Recording;
                }
                if let Some(message) = engine.messages().last() {
                    println!("[{:?}] {}", message.kind, message.content);
                }
                if engine.state() == SessionState::Disconnected {
                    println!("Session over.");
                    break;
                }
            }
        }
    }

    Ok(())
}
