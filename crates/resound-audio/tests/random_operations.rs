//! Randomized operation sequences against one track and one pooled sample.

mod common;

use std::time::Duration;

use common::{engine, wait_until, wav_stream};
use proptest::prelude::*;
use resound_audio::MixerChannel;

const VOICES: usize = 2;
const TRACK_MS: usize = 400;
const CHANNELS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Start,
    Stop,
    Seek(f64),
    SetVolume(f64),
    SetLooping(bool),
    Advance(u64),
    Update,
    DisposeTrack,
    Play(usize),
    StopSample(usize),
    DisposeChannel(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Start),
        Just(Op::Stop),
        (-50i32..600).prop_map(|position| Op::Seek(f64::from(position))),
        (0.0f64..1.0).prop_map(Op::SetVolume),
        any::<bool>().prop_map(Op::SetLooping),
        (0u64..200).prop_map(Op::Advance),
        Just(Op::Update),
        Just(Op::DisposeTrack),
        (0..CHANNELS).prop_map(Op::Play),
        (0..CHANNELS).prop_map(Op::StopSample),
        (0..CHANNELS).prop_map(Op::DisposeChannel),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_random_operations_keep_native_state_consistent(
        ops in prop::collection::vec(op_strategy(), 1..60)
    ) {
        let (backend, manager) = engine(50);
        let track = manager.create_track(wav_stream(TRACK_MS), "random").unwrap();
        prop_assert!(wait_until(&manager, || track.is_fully_loaded()));
        let length = track.length();
        prop_assert_eq!(length, TRACK_MS as f64);
        let factory = manager.create_sample_factory(wav_stream(100), "random", VOICES).unwrap();
        prop_assert!(wait_until(&manager, || factory.is_loaded()));
        let channels: Vec<_> = (0..CHANNELS).map(|_| factory.create_channel().unwrap()).collect();

        for op in ops {
            match op {
                Op::Start => drop(track.start()),
                Op::Stop => drop(track.stop()),
                Op::Seek(position) => {
                    let disposed = track.is_disposed();
                    let reached = track.seek(position).unwrap();
                    if !disposed {
                        prop_assert_eq!(reached, (0.0..=length).contains(&position));
                        prop_assert_eq!(track.current_time(), position.clamp(0.0, length));
                    }
                }
                Op::SetVolume(volume) => track.set_volume(volume),
                Op::SetLooping(looping) => track.set_looping(looping),
                Op::Advance(ms) => backend.advance(Duration::from_millis(ms)),
                Op::Update => manager.update(),
                Op::DisposeTrack => track.dispose(),
                Op::Play(i) => drop(channels[i].play()),
                Op::StopSample(i) => channels[i].stop(),
                Op::DisposeChannel(i) => channels[i].dispose(),
            }

            prop_assert!(track.current_time() >= 0.0);
            prop_assert!(track.current_time() <= length);
            prop_assert!(backend.playing_samples() <= VOICES);
            prop_assert!(factory.active_voices() <= VOICES);
            if track.is_disposed() {
                prop_assert!(track.handle().is_none());
                prop_assert!(!track.is_running());
            }
        }

        manager.update();
        prop_assert_eq!(backend.stats().invalid_handle_calls, 0);

        manager.dispose();
        prop_assert_eq!(backend.live_tracks(), 0);
        prop_assert_eq!(backend.live_samples(), 0);
        prop_assert_eq!(backend.live_sample_factories(), 0);
        prop_assert_eq!(backend.live_mixers(), 0);
        prop_assert_eq!(backend.stats().invalid_handle_calls, 0);
    }
}
