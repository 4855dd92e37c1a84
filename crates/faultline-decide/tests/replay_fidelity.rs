//! Record-then-replay tests across the public engine API.

use std::collections::BTreeSet;
use std::path::Path;

use faultline_decide::{DecideError, DecisionEngine, DecisionRates, VisitedSettings};

/// One scripted "run": a fixed sequence of questions driven by the answers.
fn drive(engine: &mut DecisionEngine) -> Vec<String> {
    let mut log = Vec::new();
    let mut nodes: BTreeSet<usize> = [0, 1, 2].into();
    let mut clients: BTreeSet<usize> = [1000].into();
    let mut alive = 3;

    for _ in 0..200 {
        let actor = engine.next_actor(alive, &nodes, &clients).unwrap();
        log.push(format!("actor {actor}"));
        match actor {
            1000 => {
                if engine.client_should_fail_on_send().unwrap() {
                    log.push("client died".into());
                }
                clients.remove(&1000);
            }
            node => {
                let mut buf = [0u8; 8];
                engine.fill_random(&mut buf).unwrap();
                log.push(format!("random {buf:?}"));
                if engine.should_send_msg().unwrap() {
                    clients.insert(1000);
                }
                if engine.should_fail_on_fsync().unwrap() {
                    if nodes.remove(&node) {
                        alive -= 1;
                    }
                    log.push(format!("node {node} died"));
                } else {
                    let rename = engine.should_rename_on_fsync().unwrap();
                    log.push(format!("rename {rename}"));
                }
                if nodes.len() < 3 && engine.should_revive().unwrap() {
                    nodes = [0, 1, 2].into();
                    alive = 3;
                }
            }
        }
    }
    log
}

fn random(seed: u64, trace: &Path) -> DecisionEngine {
    let rates = DecisionRates {
        death_rate: 20,
        revive_rate: 3,
        ..DecisionRates::default()
    };
    DecisionEngine::random(seed, 3, rates, trace).unwrap()
}

#[test]
fn same_seed_writes_identical_traces() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");

    let mut a = random(77, &first);
    drive(&mut a);
    a.finish().unwrap();
    let mut b = random(77, &second);
    drive(&mut b);
    b.finish().unwrap();

    let first = std::fs::read(first).unwrap();
    assert!(!first.is_empty());
    assert_eq!(first, std::fs::read(second).unwrap());
}

#[test]
fn different_seeds_diverge() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = random(1, &dir.path().join("a"));
    let mut b = random(2, &dir.path().join("b"));
    assert_ne!(drive(&mut a), drive(&mut b));
}

#[test]
fn replay_reproduces_recorded_run() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("trace");

    let mut recorder = random(1234, &trace);
    let recorded = drive(&mut recorder);
    recorder.finish().unwrap();

    let mut replay = DecisionEngine::replay(&trace, 3).unwrap();
    assert_eq!(drive(&mut replay), recorded);
}

#[test]
fn visited_below_threshold_matches_random() {
    let dir = tempfile::tempdir().unwrap();
    // Visited halves the revive rate on unexplored paths; a rate of one
    // revives every time under both strategies.
    let rates = DecisionRates {
        death_rate: 20,
        revive_rate: 1,
        ..DecisionRates::default()
    };
    let settings = VisitedSettings {
        window: 4,
        visit_threshold: u64::MAX,
    };

    let mut random = DecisionEngine::random(9, 3, rates, dir.path().join("r")).unwrap();
    let mut visited = DecisionEngine::visited(
        9,
        3,
        rates,
        settings,
        dir.path().join("v"),
        dir.path().join("cov"),
    )
    .unwrap();

    assert_eq!(drive(&mut random), drive(&mut visited));
    random.finish().unwrap();
    visited.finish().unwrap();
    assert_eq!(
        std::fs::read(dir.path().join("r")).unwrap(),
        std::fs::read(dir.path().join("v")).unwrap()
    );
    assert!(dir.path().join("cov").exists());
}

#[test]
fn visited_coverage_accumulates_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let settings = VisitedSettings {
        window: 3,
        visit_threshold: 50,
    };
    let coverage = dir.path().join("cov");

    for seed in 0..3 {
        let mut engine = DecisionEngine::visited(
            seed,
            3,
            DecisionRates::visited(),
            settings,
            dir.path().join("trace"),
            &coverage,
        )
        .unwrap();
        drive(&mut engine);
        engine.finish().unwrap();
    }

    let trie = faultline_decide::VisitedTrie::load_or_new(&coverage, 3).unwrap();
    let stats = trie.stats();
    assert!(stats.tokens > 0);
    assert_eq!(stats.carried_visits, stats.total_visits);
}

#[test]
fn crash_and_random_fill_scenario_replays() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("trace");
    std::fs::write(&trace, "n0\nc1\nn1\nr16909060,\nn0\n").unwrap();

    let all: BTreeSet<usize> = [0, 1, 2].into();
    let none = BTreeSet::new();
    let mut engine = DecisionEngine::replay(&trace, 3).unwrap();

    assert_eq!(engine.next_actor(3, &all, &none).unwrap(), 0);
    assert!(engine.should_fail_on_connect().unwrap());
    // Node 1 is dead and nothing is runnable; the idle pick still replays.
    assert_eq!(engine.next_actor(2, &none, &none).unwrap(), 1);
    let mut buf = [0u8; 4];
    engine.fill_random(&mut buf).unwrap();
    assert_eq!(buf, 16_909_060_i32.to_le_bytes());
    assert_eq!(engine.next_actor(2, &all, &none).unwrap(), 0);
}

#[test]
fn deviation_in_scenario_is_divergence() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("trace");
    std::fs::write(&trace, "n0\nc1\nn1\nr16909060,\nn0\n").unwrap();

    let all: BTreeSet<usize> = [0, 1, 2].into();
    let mut engine = DecisionEngine::replay(&trace, 3).unwrap();
    engine.next_actor(3, &all, &BTreeSet::new()).unwrap();

    let err = engine.should_fail_on_send().unwrap_err();
    assert!(err.is_divergence());
    assert!(matches!(
        err,
        DecideError::Divergence {
            expected: 's',
            found: 'c'
        }
    ));
}
