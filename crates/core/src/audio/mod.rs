use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, SampleFormat, SizedSample, StreamConfig,
};
use crossbeam_channel::{Receiver, Sender};

use crate::{config::AudioConfig, BpmOscError, Result};

/// Returned by a [`FrameHandler`] to keep the stream going or end it from
/// inside the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Complete,
}

/// Receives every complete mono frame on the audio callback context.
pub type FrameHandler = Box<dyn FnMut(&[f32]) -> StreamControl + Send + 'static>;

/// Source of fixed-size mono audio frames.
pub trait AudioBackend: Send {
    /// Opens the input and starts delivering frames of `config.frame_size`
    /// samples to `handler`. Fails if the device cannot be opened.
    fn open(&self, config: &AudioConfig, handler: FrameHandler) -> Result<Box<dyn CaptureStream>>;
}

/// An open input stream.
pub trait CaptureStream: Send {
    /// False once the stream ended, either by `close` or because the handler
    /// returned [`StreamControl::Complete`].
    fn is_active(&self) -> bool;

    /// Stops delivery and releases the device.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Re-chunks arbitrarily sized device buffers into exact frames.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    buffer: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            buffer: Vec::with_capacity(frame_size),
        }
    }

    /// Appends samples and hands every completed frame to `on_frame`. Stops
    /// early and reports `Complete` as soon as the handler asks for it.
    pub fn push<I, F>(&mut self, samples: I, mut on_frame: F) -> StreamControl
    where
        I: IntoIterator<Item = f32>,
        F: FnMut(&[f32]) -> StreamControl,
    {
        for sample in samples {
            self.buffer.push(sample);
            if self.buffer.len() == self.frame_size {
                let control = on_frame(&self.buffer);
                self.buffer.clear();
                if control == StreamControl::Complete {
                    return StreamControl::Complete;
                }
            }
        }
        StreamControl::Continue
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Captures from a host input device through `cpal`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open(&self, config: &AudioConfig, handler: FrameHandler) -> Result<Box<dyn CaptureStream>> {
        let config = config.clone();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(2);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let active = Arc::new(AtomicBool::new(true));

        let thread_active = active.clone();
        let callback_stop = stop_tx.clone();
        let thread = std::thread::Builder::new()
            .name("audio-input".into())
            .spawn(move || {
                run_stream(&config, handler, callback_stop, stop_rx, ready_tx);
                thread_active.store(false, Ordering::SeqCst);
            })?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(BpmOscError::Audio("audio thread exited early".into())));
        if let Err(err) = ready {
            let _ = thread.join();
            return Err(err);
        }

        Ok(Box::new(CpalCapture {
            stop: stop_tx,
            active,
            thread: Some(thread),
        }))
    }
}

struct CpalCapture {
    stop: Sender<()>,
    active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalCapture {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        let _ = self.stop.try_send(());
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| BpmOscError::Audio("audio thread panicked".into()))?;
        }
        Ok(())
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Owns the device stream for its whole life. The stream is dropped, which
/// closes the device, as soon as a stop request arrives from either `close`
/// or the frame handler.
fn run_stream(
    config: &AudioConfig,
    handler: FrameHandler,
    callback_stop: Sender<()>,
    stop: Receiver<()>,
    ready: Sender<Result<()>>,
) {
    let stream = match open_stream(config, handler, callback_stop) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    if let Err(err) = stream.play() {
        let _ = ready.send(Err(BpmOscError::Audio(err.to_string())));
        return;
    }
    let _ = ready.send(Ok(()));
    tracing::info!("audio stream started");

    let _ = stop.recv();
    drop(stream);
    tracing::info!("audio stream closed");
}

fn select_device(config: &AudioConfig) -> Result<Device> {
    let host = cpal::default_host();
    let device = match config.device_index {
        Some(index) => host
            .input_devices()
            .map_err(|e| BpmOscError::Audio(e.to_string()))?
            .nth(index)
            .ok_or_else(|| BpmOscError::Audio(format!("input device index {index} not found")))?,
        None => host
            .default_input_device()
            .ok_or_else(|| BpmOscError::Audio("no default input device available".into()))?,
    };
    if let Ok(name) = device.name() {
        tracing::info!(device = %name, "using input device");
    }
    Ok(device)
}

fn open_stream(
    config: &AudioConfig,
    handler: FrameHandler,
    stop: Sender<()>,
) -> Result<cpal::Stream> {
    let device = select_device(config)?;
    let supported = device
        .default_input_config()
        .map_err(|e| BpmOscError::Audio(e.to_string()))?;
    let stream_config = StreamConfig {
        channels: supported.channels(),
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    tracing::info!(
        sample_rate = config.sample_rate,
        channels = stream_config.channels,
        format = ?supported.sample_format(),
        frame_size = config.frame_size,
        "opening input stream"
    );

    match supported.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&device, &stream_config, config.frame_size, handler, stop),
        SampleFormat::I16 => build_input::<i16>(&device, &stream_config, config.frame_size, handler, stop),
        SampleFormat::U16 => build_input::<u16>(&device, &stream_config, config.frame_size, handler, stop),
        other => Err(BpmOscError::Audio(format!("unsupported sample format {other:?}"))),
    }
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    frame_size: usize,
    mut handler: FrameHandler,
    stop: Sender<()>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let mut assembler = FrameAssembler::new(frame_size);
    let mut completed = false;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if completed {
                    return;
                }
                let mono = data.chunks_exact(channels).map(|frame| {
                    let sum: f32 = frame.iter().map(|sample| sample.to_sample::<f32>()).sum();
                    sum / channels as f32
                });
                if assembler.push(mono, &mut handler) == StreamControl::Complete {
                    completed = true;
                    let _ = stop.try_send(());
                }
            },
            |err| tracing::error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| BpmOscError::Audio(e.to_string()))
}
