mod common;

use std::sync::Arc;

use common::{engine, wav_bytes, wav_stream};
use resound_audio::{MixerChannel, Track};

fn same_mixer(track: &Arc<Track>, expected: &Arc<resound_audio::Mixer>) -> bool {
    track.mixer().is_some_and(|m| Arc::ptr_eq(&m, expected))
}

#[test]
fn test_new_tracks_join_track_mixer() {
    let (backend, manager) = engine(8192);
    let track = manager.create_track(wav_stream(100), "a").unwrap();

    assert!(same_mixer(&track, manager.track_mixer()));
    assert_eq!(manager.track_mixer().active_channels(), vec![track.channel_id()]);
    assert!(backend
        .mixer_tracks(manager.track_mixer().handle().unwrap())
        .contains(&track.handle().unwrap()));
}

#[test]
fn test_remove_hands_channel_to_fallback() {
    let (backend, manager) = engine(8192);
    let track = manager.create_track(wav_stream(100), "a").unwrap();
    let handle = track.handle().unwrap();

    manager.track_mixer().remove(track.clone()).wait().unwrap();

    assert!(!manager.track_mixer().contains(track.channel_id()));
    assert!(manager.global_mixer().contains(track.channel_id()));
    assert!(same_mixer(&track, manager.global_mixer()));
    assert!(backend.mixer_tracks(manager.track_mixer().handle().unwrap()).is_empty());
    assert_eq!(
        backend.mixer_tracks(manager.global_mixer().handle().unwrap()),
        vec![handle]
    );

    // The global mixer has no fallback
    manager.global_mixer().remove(track.clone()).wait().unwrap();
    assert!(track.mixer().is_none());
    assert!(backend.mixer_tracks(manager.global_mixer().handle().unwrap()).is_empty());
}

#[test]
fn test_add_moves_between_mixers() {
    let (backend, manager) = engine(8192);
    let music = manager.create_mixer("music").unwrap();
    let track = manager.create_track(wav_stream(100), "a").unwrap();

    music.add(track.clone()).wait().unwrap();
    assert!(music.contains(track.channel_id()));
    assert!(!manager.track_mixer().contains(track.channel_id()));
    assert!(same_mixer(&track, &music));
    assert!(backend.mixer_tracks(manager.track_mixer().handle().unwrap()).is_empty());

    // Adding twice is a no-op
    music.add(track.clone()).wait().unwrap();
    assert_eq!(music.active_channel_count(), 1);
    assert_eq!(backend.mixer_tracks(music.handle().unwrap()).len(), 1);
}

#[test]
fn test_identical_channels_stay_distinct() {
    let (_backend, manager) = engine(8192);
    let bytes = wav_bytes(100, 2);
    let a = manager
        .create_track(Box::new(std::io::Cursor::new(bytes.clone())), "same")
        .unwrap();
    let b = manager
        .create_track(Box::new(std::io::Cursor::new(bytes)), "same")
        .unwrap();

    assert_ne!(a.channel_id(), b.channel_id());
    assert_eq!(manager.track_mixer().active_channel_count(), 2);

    a.dispose();
    assert_eq!(manager.track_mixer().active_channels(), vec![b.channel_id()]);
}

#[test]
fn test_disposed_channel_is_not_added() {
    let (_backend, manager) = engine(8192);
    let music = manager.create_mixer("music").unwrap();
    let track = manager.create_track(wav_stream(100), "a").unwrap();
    track.dispose();

    music.add(track.clone()).wait().unwrap();
    assert_eq!(music.active_channel_count(), 0);
    assert!(track.mixer().is_none());
}

#[test]
fn test_mixer_dispose_detaches_channels() {
    let (backend, manager) = engine(8192);
    let music = manager.create_mixer("music").unwrap();
    let track = manager.create_track(wav_stream(100), "a").unwrap();
    music.add(track.clone()).wait().unwrap();
    let mixers_before = backend.live_mixers();

    music.dispose();
    music.dispose();
    assert!(music.is_disposed());
    assert!(music.handle().is_none());
    assert_eq!(backend.live_mixers(), mixers_before - 1);
    assert!(track.mixer().is_none());
    assert!(!track.is_disposed());

    // Operations on a disposed mixer are ignored
    music.add(track.clone()).wait().unwrap();
    assert_eq!(music.active_channel_count(), 0);

    manager.global_mixer().add(track.clone()).wait().unwrap();
    assert!(same_mixer(&track, manager.global_mixer()));

    track.dispose();
    assert_eq!(backend.stats().invalid_handle_calls, 0);
}
