//! Shared fixtures for the engine integration tests.
//!
//! Fixtures are written at 1000 Hz so one frame is one millisecond.

#![allow(dead_code)]

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, bounded};
use resound_audio::{AudioConfig, AudioManager, ByteStream, VirtualBackend};

pub const FIXTURE_RATE: u32 = 1000;

/// 16-bit WAV with a quiet sine
pub fn wav_bytes(frames: usize, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate: FIXTURE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for i in 0..frames * channels as usize {
            let value = ((i as f32 * 0.05).sin() * i16::MAX as f32 * 0.5) as i16;
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Stereo WAV stream of `frames` milliseconds
pub fn wav_stream(frames: usize) -> Box<dyn ByteStream> {
    Box::new(Cursor::new(wav_bytes(frames, 2)))
}

/// Stream whose first read blocks until the returned sender fires or drops
pub struct GatedStream {
    inner: Cursor<Vec<u8>>,
    gate: Option<Receiver<()>>,
}

impl Read for GatedStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.recv();
        }
        self.inner.read(buf)
    }
}

impl Seek for GatedStream {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

pub fn gated_stream(frames: usize) -> (Sender<()>, Box<dyn ByteStream>) {
    let (tx, rx) = bounded(1);
    let stream = GatedStream {
        inner: Cursor::new(wav_bytes(frames, 1)),
        gate: Some(rx),
    };
    (tx, Box::new(stream))
}

pub fn engine(chunk_frames: usize) -> (Arc<VirtualBackend>, AudioManager) {
    engine_with(chunk_frames, AudioConfig::default())
}

pub fn engine_with(chunk_frames: usize, config: AudioConfig) -> (Arc<VirtualBackend>, AudioManager) {
    let backend = Arc::new(VirtualBackend::new().with_chunk_frames(chunk_frames));
    let manager = AudioManager::new(backend.clone(), config).unwrap();
    (backend, manager)
}

/// Tick `manager` until `condition` holds or five seconds pass
pub fn wait_until(manager: &AudioManager, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        manager.update();
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Poll `condition` without ticking
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}
