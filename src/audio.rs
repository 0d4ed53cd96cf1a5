use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const SILENCE_DB: f32 = -127.0;

/// An open default input device.
///
/// cpal streams are not `Send`, so the stream lives on its own thread until
/// this handle is dropped. Only the input level leaves that thread: the PCM
/// is metered and dropped, and outbound audio is written to the microphone
/// track by the embedder as encoded frames.
pub struct MicrophoneCapture {
    device_name: String,
    level_bits: Arc<AtomicU32>,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MicrophoneCapture {
    pub fn open() -> Result<Self> {
        let level_bits = Arc::new(AtomicU32::new(SILENCE_DB.to_bits()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<String>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let level = level_bits.clone();
        let thread = std::thread::Builder::new()
            .name("microphone".into())
            .spawn(move || {
                let stream = match build_stream(level) {
                    Ok((name, stream)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until the handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| Error::DeviceAcquisition(format!("failed to start capture thread: {e}")))?;

        let device_name = ready_rx
            .recv()
            .map_err(|_| Error::DeviceAcquisition("capture thread exited".into()))??;

        Ok(Self {
            device_name,
            level_bits,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Most recent RMS input level in dBFS (-127 is silence).
    pub fn level_db(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!(device = %self.device_name, "microphone released");
    }
}

fn build_stream(level: Arc<AtomicU32>) -> Result<(String, cpal::Stream)> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceAcquisition("no input device available".into()))?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let config = device
        .default_input_config()
        .map_err(|e| Error::DeviceAcquisition(e.to_string()))?;
    debug!(device = %name, ?config, "input config");

    let stream = match config.sample_format() {
        SampleFormat::F32 => input_stream::<f32>(&device, &config.into(), level),
        SampleFormat::I16 => input_stream::<i16>(&device, &config.into(), level),
        SampleFormat::U16 => input_stream::<u16>(&device, &config.into(), level),
        other => Err(Error::DeviceAcquisition(format!(
            "unsupported sample format: {other:?}"
        ))),
    }?;
    stream
        .play()
        .map_err(|e| Error::DeviceAcquisition(e.to_string()))?;
    Ok((name, stream))
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    level: Arc<AtomicU32>,
) -> Result<cpal::Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let err_fn = |err| warn!("input audio stream error: {}", err);
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let db = rms_db(data.iter().map(|s| f32::from_sample(*s)));
                level.store(db.to_bits(), Ordering::Relaxed);
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::DeviceAcquisition(e.to_string()))
}

/// RMS level of normalised samples in dBFS, floored at -127.
pub fn rms_db(samples: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = samples.fold((0.0f64, 0usize), |(sum, n), s| {
        (sum + (s as f64) * (s as f64), n + 1)
    });
    if count == 0 {
        return SILENCE_DB;
    }
    let rms = (sum / count as f64).sqrt();
    if rms <= 0.0 {
        return SILENCE_DB;
    }
    ((20.0 * rms.log10()) as f32).max(SILENCE_DB)
}
