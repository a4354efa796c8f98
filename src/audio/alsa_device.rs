//! ALSA PCM device wrappers for the capture and playback paths.
//!
//! Both directions are fixed mono S16LE; capture runs at 16 kHz and
//! playback at 24 kHz (per-direction rates, never negotiated on the wire;
//! the hardware may still round the rate, which callers must read back).

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Parameters actually granted by the ALSA hardware.
#[derive(Debug, Clone)]
pub struct DeviceParams {
    /// Granted sample rate after negotiation
    pub sample_rate: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a mono PCM device for capture.
pub fn open_capture(device: &str, sample_rate: u32) -> Result<(PCM, DeviceParams)> {
    open_pcm(device, Direction::Capture, sample_rate, None, "capture")
}

/// Open a mono PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    period_size: Option<usize>,
) -> Result<(PCM, DeviceParams)> {
    open_pcm(
        device,
        Direction::Playback,
        sample_rate,
        period_size,
        "playback",
    )
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    period_size: Option<usize>,
    dir_name: &str,
) -> Result<(PCM, DeviceParams)> {
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open {} device '{}'", dir_name, device))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(1)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        DeviceParams {
            sample_rate: hwp.get_rate()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.period_size,
    );

    Ok((pcm, params))
}
