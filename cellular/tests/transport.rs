use std::sync::atomic::{AtomicUsize, Ordering};

use embassy_futures::block_on;
use embassy_futures::join::join;
use embassy_time::{Duration, Instant, Timer};
use railnode_cellular::at::callbacks::{Category, Notification};
use railnode_cellular::at::engine::{AtEngine, EngineConfig, URC_QUEUE_SIZE};
use railnode_cellular::at::fake_modem::FakeModem;
use railnode_cellular::at::framer::{AtOutcome, ParseState, TransportMode};
use railnode_cellular::at::response::{AT_LINES, FromModem};
use railnode_cellular::at::uart::IoEvents;
use railnode_cellular::error::Error;

const TIMEOUT: Duration = Duration::from_millis(500);

fn setup(quiet_period: Duration) -> (AtEngine<FakeModem>, FakeModem) {
    let _ = env_logger::builder().is_test(true).try_init();
    let events: &'static IoEvents = Box::leak(Box::new(IoEvents::new()));
    let modem = FakeModem::new(events, 115_200);
    let engine = AtEngine::new(modem.clone(), events, EngineConfig { quiet_period });
    engine.power_up();
    (engine, modem)
}

/// Sends `^SIST=1` and checks the engine switched to transparent mode.
async fn enter_transparent(engine: &AtEngine<FakeModem>, modem: &FakeModem) {
    modem.expect("AT^SIST=1", &["CONNECT"]);
    let response = engine.send(Some("^SIST=1"), TIMEOUT, None).await.unwrap();
    assert_eq!(response.outcome(), &AtOutcome::Connect);
    assert!(engine.is_transparent());
}

#[test]
fn test_send_classifies_each_line_once() {
    let (engine, modem) = setup(Duration::from_millis(5));
    modem.expect("AT^SISI=1", &["^SISI: 0,2,0,0,0,0", "^SISI: 1,4,120,345,345,0", "OK"]);

    let mut seen = Vec::new();
    let mut classifier = |line: &FromModem| seen.push(line.as_str().to_string());
    let response = block_on(engine.run_while(engine.send(
        Some("^SISI=1"),
        TIMEOUT,
        Some(&mut classifier),
    )))
    .unwrap();

    assert_eq!(response.outcome(), &AtOutcome::Ok);
    let (_, rx) = response.parse2::<u8, u32>([0, 2], Some(1)).unwrap();
    assert_eq!(rx, 120);
    assert_eq!(seen, ["^SISI: 0,2,0,0,0,0", "^SISI: 1,4,120,345,345,0"]);
    assert_eq!(engine.parse_state(), ParseState::Idle);
    assert!(modem.all_done());
}

#[test]
fn test_classifier_sees_lines_past_response_capacity() {
    let (engine, modem) = setup(Duration::from_millis(5));
    let operators = ["+COPS: 1", "+COPS: 2", "+COPS: 3", "+COPS: 4", "+COPS: 5", "+COPS: 6"];
    let mut lines = operators.to_vec();
    lines.push("OK");
    modem.expect("AT+COPS=?", &lines);

    let mut seen = Vec::new();
    let mut classifier = |line: &FromModem| seen.push(line.as_str().to_string());
    let response = block_on(engine.run_while(engine.send(
        Some("+COPS=?"),
        TIMEOUT,
        Some(&mut classifier),
    )))
    .unwrap();

    assert_eq!(response.outcome(), &AtOutcome::Ok);
    assert_eq!(seen, operators);
    assert_eq!(response.lines().len(), AT_LINES);
    assert_eq!(response.lines()[0].as_str(), "+COPS: 1");
    assert_eq!(engine.parse_state(), ParseState::Idle);
}

#[test]
fn test_classifier_sees_lines_of_timed_out_command() {
    let (engine, modem) = setup(Duration::from_millis(5));
    modem.expect_raw("AT+COPS=?", "\r\n+COPS: 1\r\n");

    let mut seen = Vec::new();
    let mut classifier = |line: &FromModem| seen.push(line.as_str().to_string());
    let err = block_on(engine.run_while(engine.send(
        Some("+COPS=?"),
        Duration::from_millis(50),
        Some(&mut classifier),
    )))
    .unwrap_err();

    assert_eq!(err, Error::TimeoutError);
    assert_eq!(seen, ["+COPS: 1"]);
}

#[test]
fn test_error_outcomes_are_responses() {
    let (engine, modem) = setup(Duration::from_millis(5));
    modem
        .expect("AT+CPIN?", &["+CME ERROR: SIM not inserted"])
        .expect("AT+COPS=5", &["ERROR"])
        .expect("AT+CMEE=9", &["ERROR"]);

    block_on(engine.run_while(async {
        let response = engine.send(Some("+CPIN?"), TIMEOUT, None).await.unwrap();
        assert_eq!(
            response.outcome(),
            &AtOutcome::CmeError("SIM not inserted".try_into().unwrap())
        );
        let response = engine.send(Some("+COPS=5"), TIMEOUT, None).await.unwrap();
        assert_eq!(response.outcome(), &AtOutcome::Error);
        assert_eq!(
            engine.call_at("+CMEE=9", TIMEOUT).await.unwrap_err(),
            Error::AtErrorResponse
        );
    }));
    assert!(modem.all_done());
}

#[test]
fn test_echo_mismatch_is_protocol_fault() {
    let (engine, modem) = setup(Duration::from_millis(5));
    modem.set_answer_baud_rate(9_600);

    let response = block_on(engine.run_while(engine.send(Some(""), TIMEOUT, None))).unwrap();
    assert_eq!(response.outcome(), &AtOutcome::ProtocolFault);
    assert_eq!(engine.parse_state(), ParseState::Idle);
    assert!(modem.sent().is_empty());
}

#[test]
fn test_timeout_is_distinct_and_recoverable() {
    let (engine, modem) = setup(Duration::from_millis(5));
    modem.expect_raw("AT+COPS=?", "").expect("AT", &["OK"]);

    block_on(engine.run_while(async {
        let start = Instant::now();
        let err = engine
            .send(Some("+COPS=?"), Duration::from_millis(50), None)
            .await
            .unwrap_err();
        assert_eq!(err, Error::TimeoutError);
        assert!(Instant::now() - start >= Duration::from_millis(50));

        let response = engine.send(Some(""), TIMEOUT, None).await.unwrap();
        assert_eq!(response.outcome(), &AtOutcome::Ok);
    }));
    assert!(modem.all_done());
}

#[test]
fn test_busy_and_wrong_state() {
    let events: &'static IoEvents = Box::leak(Box::new(IoEvents::new()));
    let modem = FakeModem::new(events, 115_200);
    let engine = AtEngine::new(modem.clone(), events, EngineConfig::default());

    block_on(engine.run_while(async {
        let err = engine.send(Some(""), TIMEOUT, None).await.unwrap_err();
        assert_eq!(err, Error::WrongState);

        engine.power_up();
        let err = engine.send(None, TIMEOUT, None).await.unwrap_err();
        assert_eq!(err, Error::WrongState);

        modem.expect("AT+CSQ", &["+CSQ: 17,99", "OK"]);
        let (first, second) = join(
            engine.send(Some("+CSQ"), TIMEOUT, None),
            engine.send(Some("I"), TIMEOUT, None),
        )
        .await;
        assert_eq!(first.unwrap().outcome(), &AtOutcome::Ok);
        assert_eq!(second.unwrap_err(), Error::Busy);
    }));
    assert_eq!(modem.sent(), ["AT+CSQ"]);
}

#[test]
fn test_quiet_period_between_commands() {
    let quiet_period = Duration::from_millis(150);
    let (engine, modem) = setup(quiet_period);
    modem.expect("AT", &["OK"]).expect("AT", &["OK"]);

    block_on(engine.run_while(async {
        engine.call_at("", TIMEOUT).await.unwrap();
        let first_done = Instant::now();
        engine.call_at("", TIMEOUT).await.unwrap();
        // The period starts just before the first call returns.
        assert!(Instant::now() - first_done >= quiet_period - Duration::from_millis(10));
    }));
    assert!(modem.all_done());
}

static UNSOLICITED: AtomicUsize = AtomicUsize::new(0);
static RESPONSES: AtomicUsize = AtomicUsize::new(0);

fn count_unsolicited(notification: &Notification<'_>) -> i32 {
    if let Notification::Unsolicited(line) = notification {
        assert!(line.starts_with('+'));
        UNSOLICITED.fetch_add(1, Ordering::SeqCst);
    }
    0
}

fn count_responses(_: &Notification<'_>) -> i32 {
    RESPONSES.fetch_add(1, Ordering::SeqCst);
    0
}

#[test]
fn test_urcs_are_dispatched_and_queued() {
    let (engine, modem) = setup(Duration::from_millis(5));
    engine.subscribe(Category::Unsolicited, count_unsolicited).unwrap();
    engine.subscribe(Category::AtResponse, count_responses).unwrap();
    modem.expect("AT+CFUN=1", &["OK", "+PBREADY"]);

    block_on(engine.run_while(async {
        modem.push_rx(b"\r\n+CREG: 1\r\n");
        let urc = engine.wait_urc(|urc| urc.starts_with("+CREG"), TIMEOUT).await.unwrap();
        assert_eq!(urc.as_str(), "+CREG: 1");

        engine.call_at("+CFUN=1", TIMEOUT).await.unwrap();
        let urc = engine.wait_urc(|urc| urc.starts_with("+PBREADY"), TIMEOUT).await.unwrap();
        assert_eq!(urc.as_str(), "+PBREADY");

        let err = engine
            .wait_urc(|urc| urc.starts_with("^SYSSTART"), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, Error::TimeoutError);
    }));
    assert_eq!(UNSOLICITED.load(Ordering::SeqCst), 2);
    assert_eq!(RESPONSES.load(Ordering::SeqCst), 1);
}

#[test]
fn test_urc_queue_keeps_newest() {
    let (engine, modem) = setup(Duration::from_millis(5));

    block_on(engine.run_while(async {
        for i in 0..URC_QUEUE_SIZE {
            modem.push_rx(format!("\r\n+CIEV: signal,{i}\r\n").as_bytes());
        }
        modem.push_rx(b"\r\n^SISW: 1,1\r\n");
        let urc = engine
            .wait_urc(|urc| urc.starts_with("^SISW"), Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(urc.as_str(), "^SISW: 1,1");

        // The first one was evicted.
        let err = engine
            .wait_urc(|urc| urc == "+CIEV: signal,0", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, Error::TimeoutError);
    }));
}

#[test]
fn test_read_block() {
    let (engine, modem) = setup(Duration::from_millis(5));
    modem.expect_raw("AT^SISR=1,5", "\r\n^SISR: 1,5\r\nhello\r\nOK\r\n");

    let mut buf = [0u8; 5];
    let (response, len) =
        block_on(engine.run_while(engine.read_block("^SISR=1,5", &mut buf, TIMEOUT))).unwrap();
    assert_eq!(len, 5);
    assert_eq!(&buf, b"hello");
    assert_eq!(response.outcome(), &AtOutcome::Ok);
    assert_eq!(response.parse2::<u8, u16>([0, 1], None).unwrap(), (1, 5));
}

static CARRIER_LOST: AtomicUsize = AtomicUsize::new(0);
static DATA_ARRIVED: AtomicUsize = AtomicUsize::new(0);

fn count_carrier_lost(_: &Notification<'_>) -> i32 {
    CARRIER_LOST.fetch_add(1, Ordering::SeqCst);
    0
}

fn count_data_arrived(notification: &Notification<'_>) -> i32 {
    if let Notification::DataArrived(available) = notification {
        assert!(*available > 0);
        DATA_ARRIVED.fetch_add(1, Ordering::SeqCst);
    }
    0
}

#[test]
fn test_carrier_loss_releases_read_with_short_count() {
    let (engine, modem) = setup(Duration::from_millis(5));
    engine.subscribe(Category::CarrierLost, count_carrier_lost).unwrap();
    engine.subscribe(Category::DataArrived, count_data_arrived).unwrap();

    block_on(engine.run_while(async {
        enter_transparent(&engine, &modem).await;

        modem.push_rx(b"ab");
        Timer::after_millis(10).await;
        modem.push_rx(b"cd");
        Timer::after_millis(10).await;
        assert_eq!(DATA_ARRIVED.load(Ordering::SeqCst), 2);

        let mut buf = [0u8; 10];
        let (read, ()) = join(engine.read(&mut buf, Duration::from_secs(5)), async {
            Timer::after_millis(30).await;
            modem.drop_carrier();
        })
        .await;
        assert_eq!(read.unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
    }));
    assert_eq!(engine.mode(), TransportMode::AtCommand);
    assert_eq!(CARRIER_LOST.load(Ordering::SeqCst), 1);
}

#[test]
fn test_transparent_write_read_and_exit() {
    let (engine, modem) = setup(Duration::from_millis(5));

    block_on(engine.run_while(async {
        let err = engine.write(b"early", TIMEOUT).await.unwrap_err();
        assert_eq!(err, Error::WrongState);

        enter_transparent(&engine, &modem).await;
        assert_eq!(engine.send(Some("+CSQ"), TIMEOUT, None).await.unwrap_err(), Error::WrongState);
        assert_eq!(engine.write(b"hello", TIMEOUT).await.unwrap(), 5);
        assert_eq!(modem.payload(), b"hello");

        let mut buf = [0u8; 3];
        let (read, ()) = join(engine.read(&mut buf, TIMEOUT), async {
            Timer::after_millis(10).await;
            modem.push_rx(b"xyz");
        })
        .await;
        assert_eq!(read.unwrap(), 3);
        assert_eq!(&buf, b"xyz");

        let err = engine.read(&mut buf, Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, Error::TimeoutError);

        let response = engine.send(None, TIMEOUT, None).await.unwrap();
        assert_eq!(response.outcome(), &AtOutcome::Ok);
        assert!(!engine.is_transparent());
        assert!(!modem.is_transparent());
        assert_eq!(engine.read(&mut buf, TIMEOUT).await.unwrap_err(), Error::WrongState);
    }));
}

#[test]
fn test_power_down_discards_input() {
    let (engine, modem) = setup(Duration::from_millis(5));
    engine.power_down();
    assert_eq!(engine.mode(), TransportMode::Down);

    block_on(engine.run_while(async {
        modem.push_rx(b"\r\n^SHUTDOWN\r\n");
        let err = engine
            .wait_urc(|_| true, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, Error::TimeoutError);
    }));
    assert_eq!(engine.with_uart(|uart| uart.sent().len()), 0);
}
