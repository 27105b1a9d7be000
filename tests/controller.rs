use std::sync::Arc;

use rand::Rng;

use cmt_rpv2::{
    Controller, ControllerFactory, CwndEvent, NewReno, NewRenoConfig, RpV2, RpV2Config, SubflowId,
};

fn subscribe() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace")),
        )
        .with_test_writer()
        .try_init();
}

/// Multipath controller with two measured paths
fn multipath() -> (Box<dyn Controller>, SubflowId, SubflowId) {
    let factory = Arc::new(RpV2Config::default());
    let mut cc = factory.build();
    let a = cc.add_subflow();
    let b = cc.add_subflow();
    cc.subflow_mut(a).unwrap().set_srtt_us(50_000);
    cc.subflow_mut(b).unwrap().set_srtt_us(100_000);
    cc.update_connection_rtt(50_000);
    (cc, a, b)
}

#[test]
fn factories_build_fresh_controllers() {
    subscribe();
    let rpv2 = Arc::new(RpV2Config::default());
    let reno = Arc::new(NewRenoConfig::default());

    let factories: [&dyn ControllerFactory; 2] = [&rpv2, &reno];
    for factory in factories {
        let mut cc = factory.build();
        assert_eq!(cc.initial_window(), 10);
        let id = cc.add_subflow();
        assert_eq!(cc.subflow(id).unwrap().cwnd(), 10);
    }
}

#[test]
fn metrics_track_window_and_threshold() {
    subscribe();
    let (mut cc, a, _) = multipath();

    let metrics = cc.metrics(a).unwrap();
    assert_eq!(metrics.congestion_window, 10);
    assert_eq!(metrics.ssthresh, None, "no threshold established yet");

    let ssthresh = cc.ssthresh(a).unwrap();
    cc.subflow_mut(a).unwrap().set_ssthresh(ssthresh);
    let metrics = cc.metrics(a).unwrap();
    assert_eq!(metrics.ssthresh, Some(ssthresh));

    assert!(cc.metrics(SubflowId(99)).is_none());
}

#[test]
fn recovery_round_trip() {
    subscribe();
    let (mut cc, a, b) = multipath();

    // Grow for a while in slow start
    for _ in 0..50 {
        cc.on_ack(a, 2, true).unwrap();
        cc.on_ack(b, 1, true).unwrap();
    }
    let grown = cc.subflow(a).unwrap().cwnd();
    assert!(grown > 10, "pooled slow start must grow the window");

    // Enter recovery on the fast path with enough duplicate ACKs for a
    // fast retransmit: the window snaps to the new threshold at once
    cc.subflow_mut(a).unwrap().set_sacked_out(3);
    let ssthresh = cc.ssthresh(a).unwrap();
    assert!(ssthresh >= 1 && ssthresh <= grown);
    assert_eq!(cc.subflow(a).unwrap().cwnd(), ssthresh);
    cc.subflow_mut(a).unwrap().set_ssthresh(ssthresh);
    cc.subflow_mut(a).unwrap().set_sacked_out(0);

    // The other path is untouched by this path's recovery
    assert!(cc.subflow(b).unwrap().cwnd() >= 10);

    // A retransmission timeout is a hard reset
    cc.cwnd_event(a, CwndEvent::Loss).unwrap();
    assert_eq!(cc.subflow(a).unwrap().cwnd(), 1);
}

#[test]
fn window_never_collapses_to_zero() {
    subscribe();
    let mut rng = rand::rng();
    let (mut cc, a, b) = multipath();
    let paths = [a, b];

    for _ in 0..10_000 {
        let id = paths[rng.random_range(0..2)];
        match rng.random_range(0..6) {
            0 => cc.on_ack(id, rng.random_range(0..4), true).unwrap(),
            1 => cc.on_ack(id, rng.random_range(0..4), false).unwrap(),
            2 => {
                let sacked = rng.random_range(0..5);
                cc.subflow_mut(id).unwrap().set_sacked_out(sacked);
                let ssthresh = cc.ssthresh(id).unwrap();
                cc.subflow_mut(id).unwrap().set_ssthresh(ssthresh);
            }
            3 => cc.cwnd_event(id, CwndEvent::Loss).unwrap(),
            4 => cc
                .subflow_mut(id)
                .unwrap()
                .set_srtt_us(rng.random_range(0..200_000)),
            _ => cc.update_connection_rtt(rng.random_range(0..200_000)),
        }
        for id in paths {
            let sub = cc.subflow(id).unwrap();
            assert!(sub.cwnd() >= 1, "window collapsed on subflow {id}");
        }
    }
}

#[test]
fn cloned_controller_diverges_from_original() {
    subscribe();
    let (mut cc, a, _) = multipath();
    let clone = cc.clone_box();

    for _ in 0..20 {
        cc.on_ack(a, 2, true).unwrap();
    }
    assert!(cc.subflow(a).unwrap().cwnd() > clone.subflow(a).unwrap().cwnd());
}

#[test]
fn controllers_downcast_to_their_implementation() {
    let rpv2 = Arc::new(RpV2Config::default()).build();
    assert!(rpv2.into_any().downcast::<RpV2>().is_ok());
    let reno = Arc::new(NewRenoConfig::default()).build();
    assert!(reno.into_any().downcast::<NewReno>().is_ok());
}

#[test]
fn unknown_subflow_never_panics() {
    let (mut cc, a, _) = multipath();
    cc.remove_subflow(a).unwrap();
    assert!(cc.on_ack(a, 1, true).is_err());
    assert!(cc.ssthresh(a).is_err());
    assert!(cc.cwnd_event(a, CwndEvent::Loss).is_err());
    assert!(cc.remove_subflow(a).is_err());
}
