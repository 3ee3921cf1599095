mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{connect, test_config, COMMAND_TIMEOUT, SHORT};
use lorawan_at_modem::{CommandResult, DeviceState, Downlink, ModemEvent, ModemEventHandler, RxSlot};
use tokio::sync::broadcast;

#[derive(Default)]
struct Recorder {
    joins: Mutex<Vec<bool>>,
    confirms: Mutex<usize>,
    downlinks: Mutex<Vec<Downlink>>,
}

impl ModemEventHandler for Recorder {
    fn on_join_completed(&self, joined: bool) {
        self.joins.lock().unwrap().push(joined);
    }

    fn on_message_confirmed(&self) {
        *self.confirms.lock().unwrap() += 1;
    }

    fn on_message_received(&self, downlink: &Downlink) {
        self.downlinks.lock().unwrap().push(downlink.clone());
    }
}

async fn next_event(rx: &mut broadcast::Receiver<ModemEvent>) -> ModemEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event in time")
        .expect("event channel open")
}

#[tokio::test]
async fn join_event_fires_once_per_occurrence() {
    let recorder = Arc::new(Recorder::default());
    let (modem, mut fake) = connect(test_config());
    let modem = modem.with_event_handler(recorder.clone());
    let mut events = modem.subscribe_events();

    fake.send("+EVT:JOINED").await;
    assert_eq!(next_event(&mut events).await, ModemEvent::JoinCompleted { joined: true });
    assert_eq!(modem.state(), DeviceState::Joined);

    fake.send("+EVT:JOIN FAILED_RX_TIMEOUT").await;
    assert_eq!(next_event(&mut events).await, ModemEvent::JoinCompleted { joined: false });
    assert_eq!(modem.state(), DeviceState::JoinFailed);

    assert_eq!(*recorder.joins.lock().unwrap(), vec![true, false]);
    modem.dispose().await;
}

#[tokio::test]
async fn events_interleaved_with_a_pending_command() {
    let recorder = Arc::new(Recorder::default());
    let (modem, mut fake) = connect(test_config());
    modem.set_event_handler(Some(recorder.clone()));

    let (result, _) = tokio::join!(modem.execute("AT+CFM=1", COMMAND_TIMEOUT), async {
        fake.expect_command().await;
        fake.send_all(&["+EVT:JOINED", "+EVT:SEND_CONFIRMED_OK", "OK"]).await;
    });

    assert_eq!(result.unwrap(), CommandResult::Success);
    assert_eq!(*recorder.joins.lock().unwrap(), vec![true]);
    assert_eq!(*recorder.confirms.lock().unwrap(), 1);
    modem.dispose().await;
}

#[tokio::test]
async fn downlink_frame_is_assembled() {
    let recorder = Arc::new(Recorder::default());
    let (modem, mut fake) = connect(test_config());
    modem.set_event_handler(Some(recorder.clone()));
    let mut events = modem.subscribe_events();

    fake.send_all(&["+EVT:RX_1, RSSI -42, SNR 7", "+EVT:UNICAST", "+EVT:10:48656C6C6F"]).await;
    let event = next_event(&mut events).await;

    let ModemEvent::MessageReceived(downlink) = event else {
        panic!("expected a downlink, got {:?}", event);
    };
    assert_eq!(downlink.slot, RxSlot::Rx1);
    assert_eq!(downlink.port, 10);
    assert_eq!(downlink.rssi, -42);
    assert_eq!(downlink.snr, 7);
    assert_eq!(downlink.payload, "48656C6C6F");
    assert_eq!(downlink.payload_bytes().unwrap(), b"Hello");
    assert_eq!(recorder.downlinks.lock().unwrap().len(), 1);
    modem.dispose().await;
}

#[tokio::test]
async fn malformed_downlink_produces_no_callback() {
    let recorder = Arc::new(Recorder::default());
    let (modem, mut fake) = connect(test_config());
    modem.set_event_handler(Some(recorder.clone()));
    let mut events = modem.subscribe_events();

    fake.send_all(&["+EVT:RX_2, RSSI -80, SNR 3", "+EVT:UNICAST", "+EVT:10:4865ZZ"]).await;
    assert!(matches!(next_event(&mut events).await, ModemEvent::ProtocolNotice { .. }));

    // the processor keeps going
    fake.send("+EVT:SEND CONFIRMED OK").await;
    assert_eq!(next_event(&mut events).await, ModemEvent::MessageConfirmed);

    assert!(recorder.downlinks.lock().unwrap().is_empty());
    assert_eq!(modem.metrics().frame_errors, 1);
    modem.dispose().await;
}

#[tokio::test]
async fn truncated_downlink_is_dropped() {
    let recorder = Arc::new(Recorder::default());
    let (modem, mut fake) = connect(test_config());
    modem.set_event_handler(Some(recorder.clone()));
    let mut events = modem.subscribe_events();

    fake.send("+EVT:RX_C, RSSI -60, SNR 5").await;
    assert!(matches!(next_event(&mut events).await, ModemEvent::ProtocolNotice { .. }));
    assert!(recorder.downlinks.lock().unwrap().is_empty());
    modem.dispose().await;
}

#[tokio::test]
async fn negative_confirmation_is_not_a_command_reply() {
    let recorder = Arc::new(Recorder::default());
    let (modem, mut fake) = connect(test_config());
    modem.set_event_handler(Some(recorder.clone()));

    let (result, _) = tokio::join!(modem.send_hex(2, "01"), async {
        fake.expect_command().await;
        fake.send_all(&["+EVT:SEND_CONFIRMED_FAILED(4)", "OK"]).await;
    });

    assert_eq!(result.unwrap(), CommandResult::Success);
    assert_eq!(*recorder.confirms.lock().unwrap(), 0);
    fake.assert_silent(SHORT).await;
    modem.dispose().await;
}

#[tokio::test]
async fn cleared_handler_still_broadcasts() {
    let recorder = Arc::new(Recorder::default());
    let (modem, mut fake) = connect(test_config());
    modem.set_event_handler(Some(recorder.clone()));
    modem.set_event_handler(None);
    let mut events = modem.subscribe_events();

    fake.send("+EVT:JOINED").await;
    assert_eq!(next_event(&mut events).await, ModemEvent::JoinCompleted { joined: true });
    assert!(recorder.joins.lock().unwrap().is_empty());
    modem.dispose().await;
}
