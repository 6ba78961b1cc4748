use crate::error::OutputError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::any::Any;
use std::sync::{mpsc, Arc, Mutex};
use tokio::sync::oneshot;

/// One continuous playback invocation covering exactly one batch.
///
/// `done` resolves when the output reports natural end-of-playback.
/// Dropping the session forcibly stops its output, mid-buffer included.
pub struct PlaybackSession {
    pub(crate) done: oneshot::Receiver<()>,
    _guard: Box<dyn Any + Send>,
}

impl PlaybackSession {
    pub fn new(done: oneshot::Receiver<()>, guard: Box<dyn Any + Send>) -> Self {
        Self {
            done,
            _guard: guard,
        }
    }
}

/// The audio device seam. The playback engine drives exactly one session
/// at a time through this trait; implementations own the device resource.
pub trait AudioOutput: Send {
    /// Start playing one batch of normalized mono samples.
    fn begin(&mut self, samples: Vec<f32>) -> Result<PlaybackSession, OutputError>;
}

enum DeviceCmd {
    Play {
        generation: u64,
        samples: Vec<f32>,
        done: oneshot::Sender<()>,
    },
    Stop {
        generation: u64,
    },
}

/// Default output: a dedicated thread owning a cpal stream, built lazily
/// on the first batch and kept for the life of the output.
pub struct CpalOutput {
    ctrl: mpsc::Sender<DeviceCmd>,
    generation: u64,
}

impl CpalOutput {
    pub fn new(sample_rate: u32) -> Self {
        let (ctrl, rx) = mpsc::channel();
        std::thread::spawn(move || device_thread(rx, sample_rate));
        Self {
            ctrl,
            generation: 0,
        }
    }
}

impl AudioOutput for CpalOutput {
    fn begin(&mut self, samples: Vec<f32>) -> Result<PlaybackSession, OutputError> {
        self.generation += 1;
        let generation = self.generation;
        let (done_tx, done_rx) = oneshot::channel();
        self.ctrl
            .send(DeviceCmd::Play {
                generation,
                samples,
                done: done_tx,
            })
            .map_err(|_| OutputError::DeviceGone)?;
        let guard = StopGuard {
            ctrl: self.ctrl.clone(),
            generation,
        };
        Ok(PlaybackSession::new(done_rx, Box::new(guard)))
    }
}

struct StopGuard {
    ctrl: mpsc::Sender<DeviceCmd>,
    generation: u64,
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        let _ = self.ctrl.send(DeviceCmd::Stop {
            generation: self.generation,
        });
    }
}

/// What the device callback is currently playing.
#[derive(Default)]
struct Playhead {
    generation: u64,
    samples: Vec<f32>,
    pos: usize,
    done: Option<oneshot::Sender<()>>,
}

fn device_thread(rx: mpsc::Receiver<DeviceCmd>, target_rate: u32) {
    let playhead: Arc<Mutex<Playhead>> = Arc::new(Mutex::new(Playhead::default()));
    let mut stream: Option<(cpal::Stream, u32)> = None;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            DeviceCmd::Play {
                generation,
                samples,
                done,
            } => {
                if stream.is_none() {
                    match open_stream(playhead.clone(), target_rate) {
                        Ok(opened) => stream = Some(opened),
                        Err(e) => {
                            // Dropping `done` tells the engine the batch
                            // never played; it stays idle until the next one.
                            log::error!(target: "voicelink::output", "cannot open output stream: {}", e);
                            continue;
                        }
                    }
                }
                let device_rate = match stream.as_ref() {
                    Some((_, rate)) => *rate,
                    None => continue,
                };
                let samples = if device_rate != target_rate {
                    resample_linear(&samples, target_rate, device_rate)
                } else {
                    samples
                };
                if let Ok(mut head) = playhead.lock() {
                    *head = Playhead {
                        generation,
                        samples,
                        pos: 0,
                        done: Some(done),
                    };
                }
            }
            DeviceCmd::Stop { generation } => {
                if let Ok(mut head) = playhead.lock() {
                    // Ignore stops for sessions that already finished or
                    // were replaced.
                    if head.generation == generation {
                        head.samples.clear();
                        head.pos = 0;
                        head.done = None;
                    }
                }
            }
        }
    }
    // Control channel gone: drop the stream and release the device.
}

fn open_stream(
    playhead: Arc<Mutex<Playhead>>,
    target_rate: u32,
) -> Result<(cpal::Stream, u32), String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or("no default output device")?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".into());

    let config = match try_output_config(&device, target_rate) {
        Some(cfg) => cfg,
        None => {
            let default = device
                .default_output_config()
                .map_err(|e| format!("no output config: {}", e))?;
            StreamConfig {
                channels: default.channels(),
                sample_rate: default.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            }
        }
    };
    let rate = config.sample_rate.0;
    let channels = config.channels as usize;
    log::info!(
        target: "voicelink::output",
        "output device: {} ({}Hz, {}ch)",
        device_name,
        rate,
        config.channels
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut filled = 0;
                if let Ok(mut head) = playhead.lock() {
                    while filled + channels <= data.len() && head.pos < head.samples.len() {
                        let sample = head.samples[head.pos];
                        for slot in &mut data[filled..filled + channels] {
                            *slot = sample;
                        }
                        filled += channels;
                        head.pos += 1;
                    }
                    if head.pos >= head.samples.len() {
                        if let Some(done) = head.done.take() {
                            let _ = done.send(());
                        }
                    }
                }
                for slot in &mut data[filled..] {
                    *slot = 0.0;
                }
            },
            |err| {
                log::warn!(target: "voicelink::output", "stream error: {}", err);
            },
            None,
        )
        .map_err(|e| format!("failed to build stream: {}", e))?;
    stream
        .play()
        .map_err(|e| format!("failed to start stream: {}", e))?;
    Ok((stream, rate))
}

/// Prefer a mono f32 config at the target rate, then any channel count the
/// device offers at that rate (samples are duplicated across channels).
fn try_output_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported = device.supported_output_configs().ok()?;
    for range in supported {
        if range.sample_format() == cpal::SampleFormat::F32
            && range.channels() == 1
            && range.min_sample_rate().0 <= rate
            && range.max_sample_rate().0 >= rate
        {
            return Some(StreamConfig {
                channels: 1,
                sample_rate: SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            });
        }
    }
    let supported = device.supported_output_configs().ok()?;
    for range in supported {
        if range.sample_format() == cpal::SampleFormat::F32
            && range.min_sample_rate().0 <= rate
            && range.max_sample_rate().0 >= rate
        {
            return Some(StreamConfig {
                channels: range.channels(),
                sample_rate: SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            });
        }
    }
    None
}

fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == to_rate {
        return samples.to_vec();
    }
    let step = from_rate as f64 / to_rate as f64;
    let mut out = Vec::with_capacity((samples.len() as f64 / step) as usize + 2);
    let mut t = 0.0f64;
    loop {
        let i = t as usize;
        if i + 1 >= samples.len() {
            break;
        }
        let frac = (t - i as f64) as f32;
        out.push(samples[i] + (samples[i + 1] - samples[i]) * frac);
        t += step;
    }
    out
}
