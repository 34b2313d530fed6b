//! End-to-end bus behavior: FIFO delivery, peeks, groups, blocking
//! consumers, and teardown/recreate cycles.

use std::time::Duration;

use vsi::{Error, Vsi, VsiConfig};

fn config(tag: &str) -> VsiConfig {
    let dir = std::env::temp_dir();
    VsiConfig {
        user_path: dir.join(format!("vsi_it_user_{}_{}", tag, std::process::id())),
        sys_path: dir.join(format!("vsi_it_sys_{}_{}", tag, std::process::id())),
        user_len: 1024 * 1024,
        sys_len: 512 * 1024,
    }
}

fn bus(tag: &str) -> Vsi {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Vsi::create(&config(tag)).unwrap()
}

#[test]
fn fifo_delivery_then_no_data() {
    let bus = bus("fifo");
    bus.define_signal(0, 2, 0, Some("bar")).unwrap();

    bus.fire_signal(0, 2, b"A").unwrap();
    bus.fire_signal(0, 2, b"B").unwrap();
    bus.fire_signal(0, 2, b"C").unwrap();

    assert_eq!(&bus.get_oldest_signal(0, 2).unwrap()[..], b"A");
    assert_eq!(&bus.get_oldest_signal(0, 2).unwrap()[..], b"B");
    assert_eq!(&bus.get_oldest_signal(0, 2).unwrap()[..], b"C");
    assert_eq!(bus.get_oldest_signal(0, 2), Err(Error::NoData));

    bus.destroy().unwrap();
}

#[test]
fn newest_peek_is_idempotent() {
    let bus = bus("peek");
    bus.define_signal(0, 2, 0, Some("bar")).unwrap();

    bus.fire_signal(0, 2, b"A").unwrap();
    bus.fire_signal(0, 2, b"B").unwrap();
    bus.fire_signal(0, 2, b"C").unwrap();

    // Peeking returns the newest sample and removes nothing, however often
    // it is repeated.
    for _ in 0..4 {
        assert_eq!(&bus.get_newest_signal(0, 2).unwrap()[..], b"C");
        assert_eq!(bus.pending_samples(0, 2).unwrap(), 3);
    }

    // The FIFO is untouched by the peeks.
    assert_eq!(&bus.get_oldest_signal(0, 2).unwrap()[..], b"A");
    assert_eq!(&bus.get_oldest_signal(0, 2).unwrap()[..], b"B");
    assert_eq!(&bus.get_oldest_signal(0, 2).unwrap()[..], b"C");
    assert_eq!(bus.get_oldest_signal(0, 2), Err(Error::NoData));

    bus.destroy().unwrap();
}

#[test]
fn blocking_peek_leaves_sample_consumable() {
    let bus = bus("peekwait");

    // Park a peeker on an empty list, then publish.
    let peeker = bus.clone();
    let parked = std::thread::spawn(move || {
        peeker
            .get_newest_signal_wait(0, 11, Some(Duration::from_secs(5)))
            .unwrap()
    });
    std::thread::sleep(Duration::from_millis(50));
    bus.fire_signal(0, 11, b"val").unwrap();
    assert_eq!(&parked.join().unwrap()[..], b"val");

    // The peek removed nothing, and a blocking consuming fetch must still
    // see the sample instead of parking forever.
    assert_eq!(bus.pending_samples(0, 11).unwrap(), 1);
    assert_eq!(
        &bus.get_oldest_signal_wait(0, 11, Some(Duration::from_secs(5)))
            .unwrap()[..],
        b"val"
    );
    assert_eq!(bus.pending_samples(0, 11).unwrap(), 0);

    bus.destroy().unwrap();
}

#[test]
fn group_collective_fetches() {
    let bus = bus("group");
    bus.create_signal_group(10).unwrap();
    bus.add_signal_to_group(10, 0, 4).unwrap();
    bus.add_signal_to_group(10, 0, 5).unwrap();

    bus.fire_signal(0, 4, b"48").unwrap();
    bus.fire_signal(0, 4, b"49").unwrap();
    bus.fire_signal(0, 5, b"50").unwrap();
    bus.fire_signal(0, 5, b"51").unwrap();

    let newest = bus.get_newest_in_group(10).unwrap();
    assert_eq!(newest.len(), 2);
    assert_eq!((newest[0].domain, newest[0].signal), (0, 4));
    assert_eq!(&newest[0].result.as_ref().unwrap()[..], b"49");
    assert_eq!((newest[1].domain, newest[1].signal), (0, 5));
    assert_eq!(&newest[1].result.as_ref().unwrap()[..], b"51");

    let oldest = bus.get_oldest_in_group(10).unwrap();
    assert_eq!(&oldest[0].result.as_ref().unwrap()[..], b"48");
    assert_eq!(&oldest[1].result.as_ref().unwrap()[..], b"50");

    // A second collective consume sees the next samples in FIFO order.
    let oldest = bus.get_oldest_in_group(10).unwrap();
    assert_eq!(&oldest[0].result.as_ref().unwrap()[..], b"49");
    assert_eq!(&oldest[1].result.as_ref().unwrap()[..], b"51");

    // A third round reports per-member NoData while the call succeeds.
    let empty = bus.get_oldest_in_group(10).unwrap();
    assert_eq!(empty[0].result, Err(Error::NoData));
    assert_eq!(empty[1].result, Err(Error::NoData));

    bus.destroy().unwrap();
}

#[test]
fn blocking_fetch_across_attachments() {
    let cfg = config("xproc");
    let producer = Vsi::create(&cfg).unwrap();
    // A second, independent mapping of the same files, as another process
    // would create.
    let consumer = Vsi::open(&cfg).unwrap();

    let waiter = std::thread::spawn(move || {
        consumer
            .get_oldest_signal_wait(0, 2, Some(Duration::from_secs(5)))
            .unwrap()
    });

    std::thread::sleep(Duration::from_millis(50));
    producer.fire_signal(0, 2, b"hello").unwrap();

    let got = waiter.join().unwrap();
    assert_eq!(&got[..], b"hello");
    assert_eq!(producer.pending_samples(0, 2).unwrap(), 0);

    producer.destroy().unwrap();
}

#[test]
fn group_delete_and_recreate() {
    let bus = bus("recreate");
    bus.create_signal_group(10).unwrap();
    assert_eq!(bus.create_signal_group(10), Err(Error::AlreadyExists));
    bus.delete_signal_group(10).unwrap();
    bus.create_signal_group(10).unwrap();
    assert_eq!(bus.delete_signal_group(99), Err(Error::NotFound));
    bus.destroy().unwrap();
}

#[test]
fn group_deletion_never_touches_signal_data() {
    let bus = bus("noninterfere");
    bus.create_signal_group(7).unwrap();
    bus.add_signal_to_group(7, 0, 4).unwrap();
    bus.fire_signal(0, 4, b"kept").unwrap();
    bus.fire_signal(0, 4, b"kept too").unwrap();

    bus.delete_signal_group(7).unwrap();
    assert_eq!(bus.pending_samples(0, 4).unwrap(), 2);
    assert_eq!(&bus.get_oldest_signal(0, 4).unwrap()[..], b"kept");

    bus.destroy().unwrap();
}

#[test]
fn flush_empties_and_unblocks() {
    let bus = bus("flush");
    bus.fire_signal(0, 9, b"one").unwrap();
    bus.fire_signal(0, 9, b"two").unwrap();
    bus.flush_signal(0, 9).unwrap();

    assert_eq!(bus.pending_samples(0, 9).unwrap(), 0);
    assert_eq!(bus.get_oldest_signal(0, 9), Err(Error::NoData));
    assert_eq!(bus.get_newest_signal(0, 9), Err(Error::NoData));

    // A consumer parked across a flush stays parked and picks up the next
    // published sample.
    let consumer = bus.clone();
    let waiter = std::thread::spawn(move || {
        consumer
            .get_oldest_signal_wait(0, 9, Some(Duration::from_secs(5)))
            .unwrap()
    });
    std::thread::sleep(Duration::from_millis(50));
    bus.flush_signal(0, 9).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    bus.fire_signal(0, 9, b"after flush").unwrap();
    assert_eq!(&waiter.join().unwrap()[..], b"after flush");

    bus.destroy().unwrap();
}

#[test]
fn listen_any_reports_the_member_that_fired() {
    let bus = bus("listenany");
    bus.create_signal_group(3).unwrap();
    bus.add_signal_to_group(3, 0, 20).unwrap();
    bus.add_signal_to_group(3, 0, 21).unwrap();
    bus.add_signal_to_group(3, 0, 22).unwrap();

    let listener = bus.clone();
    let handle = std::thread::spawn(move || {
        listener
            .listen_any_in_group(3, Some(Duration::from_secs(5)))
            .unwrap()
    });

    std::thread::sleep(Duration::from_millis(50));
    bus.fire_signal(0, 21, b"ping").unwrap();

    assert_eq!(handle.join().unwrap(), (0, 21));
    bus.destroy().unwrap();
}

#[test]
fn listen_all_waits_for_every_member() {
    let bus = bus("listenall");
    bus.create_signal_group(4).unwrap();
    bus.add_signal_to_group(4, 0, 30).unwrap();
    bus.add_signal_to_group(4, 0, 31).unwrap();

    let listener = bus.clone();
    let handle = std::thread::spawn(move || {
        listener
            .listen_all_in_group(4, Some(Duration::from_secs(5)))
            .unwrap()
    });

    std::thread::sleep(Duration::from_millis(30));
    bus.fire_signal(0, 30, b"first").unwrap();
    std::thread::sleep(Duration::from_millis(30));
    bus.fire_signal(0, 31, b"second").unwrap();

    let results = handle.join().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(&results[0].result.as_ref().unwrap()[..], b"first");
    assert_eq!(&results[1].result.as_ref().unwrap()[..], b"second");
    bus.destroy().unwrap();
}

#[test]
fn timeouts_surface_as_timed_out() {
    let bus = bus("timeout");
    assert_eq!(
        bus.get_oldest_signal_wait(0, 40, Some(Duration::from_millis(50))),
        Err(Error::TimedOut)
    );

    bus.create_signal_group(5).unwrap();
    bus.add_signal_to_group(5, 0, 41).unwrap();
    assert_eq!(
        bus.listen_any_in_group(5, Some(Duration::from_millis(50))),
        Err(Error::TimedOut)
    );

    let results = bus
        .get_oldest_in_group_wait(5, Some(Duration::from_millis(50)))
        .unwrap();
    assert_eq!(results[0].result, Err(Error::TimedOut));

    bus.destroy().unwrap();
}

#[test]
fn name_resolution_round_trips() {
    let bus = bus("names");
    bus.define_signal(0, 2, 77, Some("transmission.gear"))
        .unwrap();

    assert_eq!(bus.name_to_id(0, "transmission.gear"), Ok(2));
    assert_eq!(
        bus.id_to_name(0, 2).as_deref(),
        Ok("transmission.gear")
    );
    assert_eq!(bus.private_id_to_signal(77), Ok((0, 2)));
    assert_eq!(bus.name_to_id(0, "no.such.signal"), Err(Error::NotFound));
    assert_eq!(bus.name_to_id(1, "transmission.gear"), Err(Error::NotFound));

    bus.fire_signal_by_name(0, "transmission.gear", b"3").unwrap();
    assert_eq!(
        &bus.get_newest_signal_by_name(0, "transmission.gear").unwrap()[..],
        b"3"
    );
    assert_eq!(&bus.get_oldest_signal(0, 2).unwrap()[..], b"3");

    // A second define with the same binding is a no-op; a colliding name
    // on another signal is rejected.
    bus.define_signal(0, 2, 77, Some("transmission.gear"))
        .unwrap();
    assert_eq!(
        bus.define_signal(0, 3, 0, Some("transmission.gear")),
        Err(Error::AlreadyExists)
    );

    bus.destroy().unwrap();
}

#[test]
fn publish_fetch_cycles_return_memory() {
    let bus = bus("memory");
    bus.define_signal(0, 2, 0, None).unwrap();

    // Burn in the signal list record, then check that steady-state
    // publish/consume cycles neither grow nor leak the segment.
    bus.fire_signal(0, 2, b"warmup").unwrap();
    bus.get_oldest_signal(0, 2).unwrap();
    let baseline = bus.alloc_stats();

    for round in 0..500u32 {
        let payload = vec![b'x'; 8 + (round as usize % 512)];
        bus.fire_signal(0, 2, &payload).unwrap();
        bus.fire_signal(0, 2, &payload).unwrap();
        bus.get_oldest_signal(0, 2).unwrap();
        bus.get_oldest_signal(0, 2).unwrap();
    }
    assert_eq!(bus.alloc_stats(), baseline);

    bus.destroy().unwrap();
}
