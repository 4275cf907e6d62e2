//! End-to-end sessions against the counter fixture binary, exercising the
//! broker's callback channels in both wire protocols.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rstest::rstest;
use tether::{HostConfig, PluginSet, VersionedPluginSets, WireProtocol};
use tether_e2e::counter::{CounterCapability, CounterClient, LocalAdder};
use tether_e2e::handshake;

const COUNTER_BIN: &str = env!("CARGO_BIN_EXE_counter-plugin");

fn counter_config() -> HostConfig {
    let mut set = PluginSet::new();
    set.insert("counter", Arc::new(CounterCapability::proxy()))
        .expect("register counter");
    HostConfig::new(handshake(), COUNTER_BIN, VersionedPluginSets::single(1, set))
        .startup_timeout(Duration::from_secs(10))
        .shutdown_grace(Duration::from_secs(2))
}

#[rstest]
#[case::stream(WireProtocol::Stream)]
#[case::simple(WireProtocol::Simple)]
fn accumulates_through_the_callback_adder(#[case] protocol: WireProtocol) {
    let session = counter_config()
        .allowed_protocols(vec![protocol])
        .start()
        .expect("session starts");
    let counter: Box<CounterClient> = session.dispense("counter").expect("dispense");

    counter.put("hits", 5, Arc::new(LocalAdder)).expect("first put");
    counter.put("hits", 7, Arc::new(LocalAdder)).expect("second put");
    assert_eq!(counter.get("hits").expect("get"), 12);

    session.shutdown().expect("shutdown");
}

#[rstest]
fn reads_do_not_change_state() {
    let session = counter_config().start().expect("session starts");
    let counter: Box<CounterClient> = session.dispense("counter").expect("dispense");

    assert_eq!(counter.get("untouched").expect("get"), 0);
    counter.put("hits", 3, Arc::new(LocalAdder)).expect("put");
    assert_eq!(counter.get("hits").expect("first get"), 3);
    assert_eq!(counter.get("hits").expect("second get"), 3);

    session.shutdown().expect("shutdown");
}

#[rstest]
fn concurrent_puts_use_independent_callback_channels() {
    let session = counter_config().start().expect("session starts");

    let workers: Vec<_> = [("a", 1_i64), ("b", 2_i64)]
        .into_iter()
        .map(|(key, step)| {
            let counter: Box<CounterClient> = session.dispense("counter").expect("dispense");
            thread::spawn(move || {
                for _ in 0..10 {
                    counter.put(key, step, Arc::new(LocalAdder)).expect("put");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("join worker");
    }

    let counter: Box<CounterClient> = session.dispense("counter").expect("dispense");
    assert_eq!(counter.get("a").expect("get a"), 10);
    assert_eq!(counter.get("b").expect("get b"), 20);

    session.shutdown().expect("shutdown");
}
