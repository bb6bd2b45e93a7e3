//! Capture through the platform audio host (ALSA, CoreAudio, WASAPI).

use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{block_until_cancelled, AudioBackend, AudioError, BufferSink, BUFFER_FRAMES, CHANNELS, SAMPLE_RATE};

/// Backend over `cpal::default_host()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn find_device(&self, name: &str) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::Enumerate(e.to_string()))?;

        devices
            .into_iter()
            .find(|device| device.name().is_ok_and(|n| n == name))
            .ok_or_else(|| AudioError::DeviceGone(name.to_string()))
    }
}

fn stream_config(buffer_size: cpal::BufferSize) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: CHANNELS,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size,
    }
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sink: &Arc<Mutex<BufferSink>>,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    let sink = Arc::clone(sink);
    let name = device.name().unwrap_or_default();

    device.build_input_stream(
        config,
        move |data: &[i16], _: &cpal::InputCallbackInfo| {
            if let Ok(mut sink) = sink.lock() {
                sink(data);
            }
        },
        move |err| warn!(device = %name, error = %err, "Audio stream error"),
        None,
    )
}

impl AudioBackend for CpalBackend {
    fn capture_devices(&self) -> Result<Vec<String>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::Enumerate(e.to_string()))?;

        Ok(devices.filter_map(|device| device.name().ok()).collect())
    }

    fn capture(&self, device: &str, sink: BufferSink, stop: CancellationToken)
        -> Result<(), AudioError> {
        let handle = self.find_device(device)?;
        let sink = Arc::new(Mutex::new(sink));

        let stream = match build_stream(&handle, &stream_config(cpal::BufferSize::Fixed(BUFFER_FRAMES)), &sink) {
            Ok(stream) => stream,
            Err(e) => {
                debug!(device, error = %e, "Fixed buffer size rejected, using device default");
                build_stream(&handle, &stream_config(cpal::BufferSize::Default), &sink).map_err(|e| {
                    AudioError::Stream {
                        device: device.to_string(),
                        reason: e.to_string(),
                    }
                })?
            }
        };

        stream.play().map_err(|e| AudioError::Stream {
            device: device.to_string(),
            reason: e.to_string(),
        })?;

        block_until_cancelled(&stop);
        drop(stream);
        Ok(())
    }
}
