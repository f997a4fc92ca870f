use core::sync::atomic::{AtomicUsize, Ordering};

use embedded_time::duration::Milliseconds;
use layered_client::{
    Channel, Config, Context, Endpoint, Error, Event, LayerState, Protocol, QoS, SessionState,
    time::ManualClock,
};

const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

fn context(config: Config) -> Context<Channel, ManualClock> {
    Context::new(Protocol::Mqtt, Channel::new(), ManualClock::new(), config).unwrap()
}

fn endpoint() -> Endpoint {
    Endpoint::new("broker.local", 1883).unwrap()
}

/// Takes everything the chain wrote since the last call.
fn sent(ctx: &mut Context<Channel, ManualClock>) -> Vec<u8> {
    let channel = ctx.transport_mut().unwrap();
    let bytes = channel.outgoing().to_vec();
    channel.consume(bytes.len());
    bytes
}

fn connected() -> Context<Channel, ManualClock> {
    let mut ctx = context(Config::new("sensor-1").unwrap());
    ctx.connect(endpoint()).unwrap();
    ctx.receive(&CONNACK).unwrap();
    sent(&mut ctx);
    while ctx.next_event().is_some() {}
    ctx
}

#[test]
fn connect_waits_for_connack() {
    let mut ctx = context(Config::new("sensor-1").unwrap());

    assert_eq!(ctx.connect(endpoint()).unwrap(), LayerState::Incomplete);
    assert_eq!(ctx.session_state(), SessionState::Connecting);
    assert!(!ctx.is_connected());

    let mut connect = vec![0x10, 0x14, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 60];
    connect.extend_from_slice(&[0x00, 0x08]);
    connect.extend_from_slice(b"sensor-1");
    assert_eq!(sent(&mut ctx), connect);

    assert_eq!(ctx.receive(&CONNACK).unwrap(), LayerState::Ok);
    assert!(ctx.is_connected());
    assert_eq!(ctx.session_state(), SessionState::Connected);
    assert_eq!(
        ctx.next_event(),
        Some(Event::Connected {
            session_present: false
        })
    );
}

#[test]
fn connack_split_across_reads() {
    let mut ctx = context(Config::new("sensor-1").unwrap());
    ctx.connect(endpoint()).unwrap();

    assert_eq!(ctx.receive(&CONNACK[..1]).unwrap(), LayerState::Incomplete);
    assert!(!ctx.is_connected());

    ctx.receive(&CONNACK[1..]).unwrap();
    assert!(ctx.is_connected());
}

#[test]
fn refused_connection_closes_the_session() {
    let mut ctx = context(Config::new("sensor-1").unwrap());
    ctx.connect(endpoint()).unwrap();

    assert!(matches!(
        ctx.receive(&[0x20, 0x02, 0x00, 0x05]),
        Err(Error::ConnectionRefused(_))
    ));
    assert_eq!(ctx.session_state(), SessionState::Disconnected);
    assert!(!ctx.is_connected());
}

#[test]
fn missing_connack_times_out_and_reconnects() {
    let mut ctx = context(Config::new("sensor-1").unwrap().with_timeouts(2_000, 1_000, 1));
    ctx.connect(endpoint()).unwrap();
    sent(&mut ctx);

    ctx.clock().advance(Milliseconds(1_999));
    assert_eq!(ctx.poll().unwrap(), LayerState::Ok);

    ctx.clock().advance(Milliseconds(1));
    assert_eq!(ctx.poll(), Err(Error::TimedOut));
    assert_eq!(ctx.session_state(), SessionState::Disconnected);

    assert_eq!(ctx.connect(endpoint()).unwrap(), LayerState::Incomplete);
    assert_eq!(sent(&mut ctx)[0], 0x10);
}

#[test]
fn qos0_publish_goes_straight_out() {
    let mut ctx = connected();

    ctx.publish("sensors/temp", b"21.5", QoS::AtMostOnce).unwrap();

    let mut publish = vec![0x30, 18, 0x00, 12];
    publish.extend_from_slice(b"sensors/temp21.5");
    assert_eq!(sent(&mut ctx), publish);
    assert_eq!(
        ctx.next_event(),
        Some(Event::Published { packet_id: None })
    );
}

#[test]
fn tasks_wait_for_connack() {
    let mut ctx = context(Config::new("sensor-1").unwrap());
    ctx.connect(endpoint()).unwrap();
    sent(&mut ctx);

    ctx.publish("sensors/temp", b"21", QoS::AtLeastOnce).unwrap();
    assert!(sent(&mut ctx).is_empty());

    ctx.receive(&CONNACK).unwrap();
    let publish = sent(&mut ctx);
    assert_eq!(publish[0], 0x32);
    assert_eq!(ctx.session_state(), SessionState::Publishing);

    let id = [publish[16], publish[17]];
    ctx.receive(&[0x40, 0x02, id[0], id[1]]).unwrap();

    assert_eq!(ctx.session_state(), SessionState::Connected);
    let published = core::iter::from_fn(|| ctx.next_event())
        .find_map(|event| match event {
            Event::Published { packet_id } => packet_id,
            _ => None,
        })
        .unwrap();
    assert_eq!(published.get(), u16::from_be_bytes(id));
}

#[test]
fn full_task_queue_leaves_the_session_alone() {
    let mut ctx = context(Config::new("sensor-1").unwrap());
    ctx.connect(endpoint()).unwrap();

    for _ in 0..layered_client::config::TASK_DEPTH {
        ctx.publish("sensors/temp", b"21", QoS::AtMostOnce).unwrap();
    }

    assert_eq!(
        ctx.publish("sensors/temp", b"21", QoS::AtMostOnce),
        Err(Error::QueueFull)
    );
    assert_eq!(ctx.session_state(), SessionState::Connecting);

    ctx.receive(&CONNACK).unwrap();
    let published = core::iter::from_fn(|| ctx.next_event())
        .filter(|event| matches!(event, Event::Published { .. }))
        .count();
    assert_eq!(published, layered_client::config::TASK_DEPTH);
}

static READINGS: AtomicUsize = AtomicUsize::new(0);

fn on_reading(topic: &str, payload: &[u8]) {
    assert_eq!(topic, "sensors/temp");
    assert_eq!(payload, b"99");
    READINGS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn subscription_delivers_on_poll() {
    let mut ctx = connected();

    ctx.subscribe("sensors/#", QoS::AtMostOnce, on_reading).unwrap();
    let subscribe = sent(&mut ctx);
    assert_eq!(subscribe[0], 0x82);
    assert_eq!(&subscribe[4..6], &[0x00, 0x09]);
    assert_eq!(&subscribe[6..15], b"sensors/#");
    assert_eq!(subscribe[15], 0x00);

    ctx.receive(&[0x90, 0x03, subscribe[2], subscribe[3], 0x00]).unwrap();
    assert!(matches!(
        core::iter::from_fn(|| ctx.next_event()).last(),
        Some(Event::Subscribed {
            granted: QoS::AtMostOnce,
            ..
        })
    ));

    let mut publish = vec![0x30, 16, 0x00, 12];
    publish.extend_from_slice(b"sensors/temp99");
    ctx.receive(&publish).unwrap();

    // Handlers run from the dispatcher, never inside `receive`.
    assert_eq!(READINGS.load(Ordering::SeqCst), 0);
    assert!(ctx.next_deadline().is_some());

    ctx.poll().unwrap();
    assert_eq!(READINGS.load(Ordering::SeqCst), 1);
}

#[test]
fn keep_alive_pings_when_idle() {
    let mut ctx = context(Config::new("sensor-1").unwrap().with_keep_alive(10));
    ctx.connect(endpoint()).unwrap();
    ctx.receive(&CONNACK).unwrap();
    sent(&mut ctx);

    ctx.clock().advance(Milliseconds(5_000));
    ctx.poll().unwrap();
    assert_eq!(sent(&mut ctx), [0xC0, 0x00]);

    ctx.receive(&[0xD0, 0x00]).unwrap();
    assert_eq!(ctx.session_state(), SessionState::Connected);
}

#[test]
fn keep_alive_gives_up_without_pingresp() {
    let mut ctx = context(Config::new("sensor-1").unwrap().with_keep_alive(10));
    ctx.connect(endpoint()).unwrap();
    ctx.receive(&CONNACK).unwrap();

    let mut result = Ok(LayerState::Ok);
    for _ in 0..4 {
        ctx.clock().advance(Milliseconds(5_000));
        result = ctx.poll();
        if result.is_err() {
            break;
        }
    }

    assert_eq!(result, Err(Error::TimedOut));
    assert!(!ctx.is_connected());
}

#[test]
fn disconnect_sends_disconnect() {
    let mut ctx = connected();

    ctx.disconnect();

    assert_eq!(sent(&mut ctx), [0xE0, 0x00]);
    assert_eq!(ctx.next_event(), Some(Event::Disconnected));
    assert_eq!(ctx.session_state(), SessionState::Disconnected);
    assert_eq!(ctx.next_deadline(), None);
    assert_eq!(
        ctx.publish("sensors/temp", b"21", QoS::AtMostOnce),
        Err(Error::ChainClosed)
    );
}

fn ignore(_topic: &str, _payload: &[u8]) {}

#[test]
fn long_read_is_parsed_in_full() {
    let mut ctx = connected();
    ctx.subscribe("a/b", QoS::AtMostOnce, ignore).unwrap();
    let subscribe = sent(&mut ctx);

    // Two full frames of PINGRESPs, then the SUBACK in a third.
    let mut bytes = [0xD0, 0x00].repeat(1024);
    bytes.extend_from_slice(&[0x90, 0x03, subscribe[2], subscribe[3], 0x00]);

    assert!(ctx.receive(&bytes).is_ok());
    assert_eq!(ctx.session_state(), SessionState::Connected);
    assert!(matches!(
        core::iter::from_fn(|| ctx.next_event()).last(),
        Some(Event::Subscribed { .. })
    ));
}

#[test]
fn backlog_survives_reads_between_polls() {
    let mut ctx = connected();
    let pings = [0xD0, 0x00].repeat(512);

    assert!(ctx.receive(&pings).is_ok());
    assert!(ctx.poll().is_ok());
    assert!(ctx.receive(&pings).is_ok());
    assert!(ctx.poll().is_ok());

    assert!(ctx.is_connected());
    assert_eq!(ctx.session_state(), SessionState::Connected);
}
