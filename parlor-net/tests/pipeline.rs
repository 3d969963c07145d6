mod common;

use std::thread;
use std::time::Duration;

use parlor_net::client::ServerLink;
use parlor_net::connection::ReadEvent;
use parlor_net::dispatcher::{Dispatcher, DispatcherConfig, NameError};

use common::{RawClient, Recorded, RecordingHandler};

const WAIT: Duration = Duration::from_secs(5);

fn start_server(config: DispatcherConfig) -> (Dispatcher, common::Journal, String) {
    let (handler, journal) = RecordingHandler::new();
    let mut dispatcher = Dispatcher::start(config, Box::new(handler));
    let addr = dispatcher.listen("127.0.0.1:0").unwrap().to_string();
    (dispatcher, journal, addr)
}

#[test]
fn commands_processed_in_send_order() {
    let (dispatcher, journal, addr) = start_server(DispatcherConfig::default());

    let mut client = RawClient::connect(&addr).unwrap();
    for i in 0..50 {
        client.send(&format!("cmd-{}", i)).unwrap();
    }

    journal.wait_until(|j| j.command_count() >= 50, WAIT);
    assert_eq!(client.recv().unwrap(), "welcome");

    let opened = journal.opened_conns();
    assert_eq!(opened.len(), 1);
    let commands = journal.commands_for(opened[0].id());
    let expected: Vec<String> = (0..50).map(|i| format!("cmd-{}", i)).collect();
    assert_eq!(commands, expected);

    dispatcher.stop();
}

#[test]
fn per_connection_order_survives_interleaving() {
    let (dispatcher, journal, addr) = start_server(DispatcherConfig::default());

    let addr_a = addr.clone();
    let addr_b = addr.clone();
    let writer_a = thread::spawn(move || {
        let mut c = RawClient::connect(&addr_a).unwrap();
        for i in 0..30 {
            c.send(&format!("a-{}", i)).unwrap();
        }
        c
    });
    let writer_b = thread::spawn(move || {
        let mut c = RawClient::connect(&addr_b).unwrap();
        for i in 0..30 {
            c.send(&format!("b-{}", i)).unwrap();
        }
        c
    });
    let _ca = writer_a.join().unwrap();
    let _cb = writer_b.join().unwrap();

    journal.wait_until(|j| j.command_count() >= 60, WAIT);

    // Per-connection order is exact; cross-connection interleaving is free.
    for conn in journal.opened_conns() {
        let commands = journal.commands_for(conn.id());
        assert_eq!(commands.len(), 30);
        let prefix = commands[0].split('-').next().unwrap().to_string();
        for (i, line) in commands.iter().enumerate() {
            assert_eq!(*line, format!("{}-{}", prefix, i));
        }
    }

    dispatcher.stop();
}

#[test]
fn opened_precedes_commands_and_closed_follows() {
    let (dispatcher, journal, addr) = start_server(DispatcherConfig::default());

    {
        let mut client = RawClient::connect(&addr).unwrap();
        client.send("hello").unwrap();
        journal.wait_until(|j| j.command_count() >= 1, WAIT);
    } // client drops; connection closes

    journal.wait_until(
        |j| j.events().iter().any(|e| matches!(e, Recorded::Closed(_))),
        WAIT,
    );

    let events = journal.events();
    let opened_at = events
        .iter()
        .position(|e| matches!(e, Recorded::Opened(_)))
        .unwrap();
    let command_at = events
        .iter()
        .position(|e| matches!(e, Recorded::Command(..)))
        .unwrap();
    let closed_at = events
        .iter()
        .position(|e| matches!(e, Recorded::Closed(_)))
        .unwrap();
    assert!(opened_at < command_at);
    assert!(command_at < closed_at);

    dispatcher.stop();
}

#[test]
fn concurrent_naming_admits_exactly_one() {
    let (dispatcher, journal, _addr) = start_server(DispatcherConfig::default());
    let handle = dispatcher.handle();

    let near_a = handle.attach_local("a", false);
    let near_b = handle.attach_local("b", false);
    near_a.put("hi");
    near_b.put("hi");
    journal.wait_until(|j| j.opened_conns().len() >= 2, WAIT);

    let conns = journal.opened_conns();
    let (first, second) = (conns[0].clone(), conns[1].clone());

    let h1 = handle.clone();
    let h2 = handle.clone();
    let t1 = thread::spawn(move || h1.claim_name(&first, "gandalf"));
    let t2 = thread::spawn(move || h2.claim_name(&second, "gandalf"));
    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();

    assert!(
        r1.is_ok() ^ r2.is_ok(),
        "exactly one claim must win: {:?} / {:?}",
        r1,
        r2
    );
    assert_eq!(handle.named_count(), 1);
    assert_eq!(handle.find_named("gandalf").is_some(), true);

    near_a.disconnect();
    near_b.disconnect();
    dispatcher.stop();
}

#[test]
fn renaming_a_named_connection_fails() {
    let (dispatcher, journal, _addr) = start_server(DispatcherConfig::default());
    let handle = dispatcher.handle();

    let near = handle.attach_local("solo", false);
    near.put("hi");
    journal.wait_until(|j| !j.opened_conns().is_empty(), WAIT);
    let conn = journal.opened_conns()[0].clone();

    assert!(handle.claim_name(&conn, "alice").is_ok());
    assert_eq!(
        handle.claim_name(&conn, "bob"),
        Err(NameError::AlreadyNamed)
    );

    near.disconnect();
    dispatcher.stop();
}

#[test]
fn connection_limit_rejects_with_message() {
    let config = DispatcherConfig {
        max_connections: 1,
        ..DispatcherConfig::default()
    };
    let (dispatcher, journal, addr) = start_server(config);

    let mut first = RawClient::connect(&addr).unwrap();
    first.send("hello").unwrap();
    journal.wait_until(|j| j.command_count() >= 1, WAIT);

    let mut second = RawClient::connect(&addr).unwrap();
    second.send("hello").unwrap();
    // The rejected connection gets the explicit rejection line, then EOF.
    assert_eq!(second.recv().unwrap(), "error server-full");
    assert!(second.recv().is_err());

    dispatcher.stop();
}

#[test]
fn version_counts_track_connections() {
    let (dispatcher, journal, _addr) = start_server(DispatcherConfig::default());
    let handle = dispatcher.handle();

    let near_a = handle.attach_local("a", false);
    let near_b = handle.attach_local("b", false);
    let near_c = handle.attach_local("c", false);
    for near in [&near_a, &near_b, &near_c] {
        near.put("hi");
    }
    journal.wait_until(|j| j.opened_conns().len() >= 3, WAIT);

    let conns = journal.opened_conns();
    handle.note_version(&conns[0], 2);
    handle.note_version(&conns[1], 2);
    handle.note_version(&conns[2], 3);
    assert_eq!(handle.version_counts(), vec![(2, 2), (3, 1)]);

    // A re-negotiation moves the tally.
    handle.note_version(&conns[1], 3);
    assert_eq!(handle.version_counts(), vec![(2, 1), (3, 2)]);

    // Removal decrements.
    handle.remove(&conns[2]);
    journal.wait_until(
        |j| j.events().iter().any(|e| matches!(e, Recorded::Closed(_))),
        WAIT,
    );
    assert_eq!(handle.version_counts(), vec![(2, 1), (3, 1)]);

    near_a.disconnect();
    near_b.disconnect();
    near_c.disconnect();
    dispatcher.stop();
}

#[test]
fn server_link_talks_to_the_dispatcher() {
    let (dispatcher, journal, addr) = start_server(DispatcherConfig::default());

    let mut link = ServerLink::connect(&addr).unwrap();
    link.send("hello").unwrap();
    journal.wait_until(|j| j.command_count() >= 1, WAIT);
    assert_eq!(link.recv_timeout(WAIT), Some("welcome".into()));

    link.send("second").unwrap();
    journal.wait_until(|j| j.command_count() >= 2, WAIT);
    assert!(!link.is_closed());

    // Stopping the server closes the link from the far side.
    dispatcher.stop();
    let deadline = std::time::Instant::now() + WAIT;
    while !link.is_closed() && std::time::Instant::now() < deadline {
        link.poll();
        thread::sleep(Duration::from_millis(10));
    }
    assert!(link.is_closed());
}

#[test]
fn broadcast_reaches_all_named_connections() {
    let (dispatcher, journal, _addr) = start_server(DispatcherConfig::default());
    let handle = dispatcher.handle();

    let near_a = handle.attach_local("a", false);
    let near_b = handle.attach_local("b", false);
    near_a.put("hi");
    near_b.put("hi");
    journal.wait_until(|j| j.opened_conns().len() >= 2, WAIT);

    let conns = journal.opened_conns();
    handle.claim_name(&conns[0], "alice").unwrap();
    handle.claim_name(&conns[1], "bob").unwrap();

    handle.broadcast("announcement");

    for near in [&near_a, &near_b] {
        // Drain the welcome first, then expect the broadcast.
        let mut got = Vec::new();
        for _ in 0..2 {
            match near.read_blocking() {
                ReadEvent::Line(l) => got.push(l),
                ReadEvent::Eof => break,
            }
        }
        assert!(
            got.contains(&"announcement".to_string()),
            "missing broadcast in {:?}",
            got
        );
    }

    near_a.disconnect();
    near_b.disconnect();
    dispatcher.stop();
}
