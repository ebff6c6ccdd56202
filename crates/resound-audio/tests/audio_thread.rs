mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, wav_stream};
use resound_audio::{AudioConfig, AudioThread, VirtualBackend};

const TICK_TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn test_operations_from_other_threads() {
    let backend = Arc::new(VirtualBackend::new().with_chunk_frames(100));
    let audio = AudioThread::spawn(backend.clone(), AudioConfig::default()).unwrap();
    let manager = audio.manager().clone();
    assert!(!manager.scheduler().is_owning_thread());

    let track = manager.create_track(wav_stream(500), "bg").unwrap();
    assert!(eventually(|| track.is_fully_loaded()));

    track.start().unwrap();
    assert!(track.is_running());
    assert!(backend.is_track_playing(track.handle().unwrap()));

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let track = track.clone();
            std::thread::spawn(move || {
                for step in 0..25 {
                    track.set_volume(f64::from(i * 25 + step) / 100.0);
                    track.seek_async(f64::from(step * 10));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(audio.wait_for_update(TICK_TIMEOUT));
    assert_eq!(manager.scheduler().pending_tasks(), 0);

    track.set_volume(0.3);
    assert!(audio.wait_for_update(TICK_TIMEOUT));
    assert_eq!(
        backend.track_volume(track.handle().unwrap()),
        Some((0.3, 0.0))
    );

    audio.stop().unwrap();
    assert!(manager.is_disposed());
    assert_eq!(backend.live_tracks(), 0);
    assert_eq!(backend.live_mixers(), 0);
    assert_eq!(backend.stats().invalid_handle_calls, 0);
}

#[test]
fn test_deferred_sample_play_from_other_thread() {
    let backend = Arc::new(VirtualBackend::new());
    let audio = AudioThread::spawn(backend.clone(), AudioConfig::default()).unwrap();
    let manager = audio.manager().clone();

    let factory = manager.create_sample_factory(wav_stream(100), "blip", 2).unwrap();
    let channel = factory.create_channel().unwrap();
    channel.play().unwrap();

    assert!(eventually(|| backend.stats().sample_plays == 1));
    assert!(!channel.is_play_pending());
    assert_eq!(manager.sample_mixer().active_channel_count(), 1);

    channel.dispose();
    assert!(audio.wait_for_update(TICK_TIMEOUT));
    assert_eq!(backend.live_samples(), 0);
}

#[test]
fn test_pending_results_can_be_awaited() {
    let backend = Arc::new(VirtualBackend::new());
    let audio = AudioThread::spawn(backend.clone(), AudioConfig::default()).unwrap();
    let track = audio.manager().create_track(wav_stream(300), "async").unwrap();
    assert!(eventually(|| track.is_fully_loaded()));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let reached = runtime.block_on(async {
        track.start_async().unwrap().await.unwrap();
        track.seek_async(120.0).await.unwrap()
    });

    assert!(reached);
    assert!(track.is_running());
    assert!((track.current_time() - 120.0).abs() < 1e-6);
}

#[test]
fn test_drop_stops_thread() {
    let backend = Arc::new(VirtualBackend::new());
    let audio = AudioThread::spawn(backend.clone(), AudioConfig::default()).unwrap();
    assert!(audio.wait_for_update(TICK_TIMEOUT));
    assert!(audio.ticks() >= 2);

    drop(audio);
    assert_eq!(backend.live_mixers(), 0);
    assert_eq!(backend.stats().managers_destroyed, 1);
}
