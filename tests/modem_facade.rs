mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{connect, test_config, FakeModem, COMMAND_TIMEOUT, SHORT};
use lorawan_at_modem::at::AtError;
use lorawan_at_modem::device::{AbpCredentials, Band, DeviceClass, JoinMode, OtaaCredentials};
use lorawan_at_modem::{
    join_with_retry, CommandResult, DeviceError, DeviceState, JoinOutcome, JoinParams, JoinRetryPolicy,
    LoraWanModem, ModemConfig,
};

async fn initialised(modem: &LoraWanModem, fake: &mut FakeModem) {
    let (result, _) = tokio::join!(modem.initialise(), async {
        assert_eq!(fake.expect_command().await, "AT+NWM=1");
        fake.send("OK").await;
    });
    assert_eq!(result.unwrap(), CommandResult::Success);
    assert_eq!(modem.state(), DeviceState::Initialised);
}

#[tokio::test]
async fn port_out_of_range_writes_nothing() {
    let (modem, mut fake) = connect(test_config());

    for port in [0u8, 224, 255] {
        let result = modem.send_hex(port, "01").await;
        assert!(matches!(result, Err(DeviceError::InvalidArgument(_))), "port {}", port);
        let result = modem.send_bytes(port, &[1]).await;
        assert!(matches!(result, Err(DeviceError::InvalidArgument(_))), "port {}", port);
    }
    fake.assert_silent(SHORT).await;
    modem.dispose().await;
}

#[tokio::test]
async fn bad_payloads_are_rejected() {
    let (modem, mut fake) = connect(test_config());

    assert!(modem.send_hex(1, "").await.is_err());
    assert!(modem.send_hex(1, "ABC").await.is_err());
    assert!(modem.send_hex(1, "0G").await.is_err());
    assert!(modem.send_bytes(1, &[]).await.is_err());
    fake.assert_silent(SHORT).await;
    modem.dispose().await;
}

#[tokio::test]
async fn send_formats_port_and_uppercase_hex() {
    let (modem, mut fake) = connect(test_config());

    let (result, _) = tokio::join!(modem.send_bytes(2, &[0xde, 0xad, 0x01]), async {
        assert_eq!(fake.expect_command().await, "AT+SEND=2:DEAD01");
        fake.send("OK").await;
    });
    assert_eq!(result.unwrap(), CommandResult::Success);

    let (result, _) = tokio::join!(modem.send_hex(223, "cafe"), async {
        assert_eq!(fake.expect_command().await, "AT+SEND=223:CAFE");
        fake.send("AT_NO_NETWORK_JOINED").await;
    });
    assert_eq!(result.unwrap(), CommandResult::NotJoined);
    modem.dispose().await;
}

#[tokio::test]
async fn configuration_commands() {
    let (modem, mut fake) = connect(test_config());

    let (results, _) = tokio::join!(
        async {
            vec![
                modem.initialise().await.unwrap(),
                modem.set_class(DeviceClass::C).await.unwrap(),
                modem.set_band(Band::Eu868).await.unwrap(),
                modem.set_adr(true).await.unwrap(),
                modem.set_confirm_mode(false).await.unwrap(),
                modem.set_join_mode(JoinMode::Otaa).await.unwrap(),
            ]
        },
        async {
            for expected in ["AT+NWM=1", "AT+CLASS=C", "AT+BAND=4", "AT+ADR=1", "AT+CFM=0", "AT+NJM=1"] {
                assert_eq!(fake.expect_command().await, expected);
                fake.send("OK").await;
            }
        }
    );
    assert!(results.iter().all(CommandResult::is_success));
    assert_eq!(modem.state(), DeviceState::Initialised);
    modem.dispose().await;
}

#[tokio::test]
async fn otaa_credentials_stop_at_first_failure() {
    let (modem, mut fake) = connect(test_config());
    let credentials = OtaaCredentials {
        dev_eui: "ac1f09fffe000001".into(),
        join_eui: "0000000000000000".into(),
        app_key: "00112233445566778899aabbccddeeff".into(),
    };

    let (result, _) = tokio::join!(modem.configure_otaa(&credentials), async {
        assert_eq!(fake.expect_command().await, "AT+DEVEUI=AC1F09FFFE000001");
        fake.send("OK").await;
        assert_eq!(fake.expect_command().await, "AT+APPEUI=0000000000000000");
        fake.send("AT_PARAM_ERROR").await;
    });
    assert_eq!(result.unwrap(), CommandResult::ParameterError);
    fake.assert_silent(SHORT).await;
    modem.dispose().await;
}

#[tokio::test]
async fn invalid_abp_credentials_write_nothing() {
    let (modem, mut fake) = connect(test_config());
    let credentials = AbpCredentials {
        dev_addr: "260B12".into(),
        nwk_skey: "00112233445566778899AABBCCDDEEFF".into(),
        app_skey: "00112233445566778899AABBCCDDEEFF".into(),
    };

    assert!(matches!(modem.configure_abp(&credentials).await, Err(DeviceError::InvalidArgument(_))));
    fake.assert_silent(SHORT).await;
    modem.dispose().await;
}

#[tokio::test]
async fn join_moves_through_states() {
    let (modem, mut fake) = connect(test_config());
    let params = JoinParams::default();
    let mut state = modem.state_receiver();
    initialised(&modem, &mut fake).await;

    let (result, _) = tokio::join!(modem.join(&params), async {
        assert_eq!(fake.expect_command().await, "AT+JOIN=1:0:10:8");
        fake.send("OK").await;
    });
    assert_eq!(result.unwrap(), CommandResult::Success);
    assert_eq!(modem.state(), DeviceState::Joining);

    fake.send("+EVT:JOINED").await;
    state.wait_for(|s| *s == DeviceState::Joined).await.unwrap();

    let (result, _) = tokio::join!(modem.send_hex(1, "01"), async {
        fake.expect_command().await;
        assert_eq!(modem.state(), DeviceState::Sending);
        fake.send("OK").await;
    });
    assert_eq!(result.unwrap(), CommandResult::Success);
    assert_eq!(modem.state(), DeviceState::Joined);
    modem.dispose().await;
}

#[tokio::test]
async fn rejected_join_restores_previous_state() {
    let (modem, mut fake) = connect(test_config());
    initialised(&modem, &mut fake).await;

    let join_params = JoinParams::default();
    let (result, _) = tokio::join!(modem.join(&join_params), async {
        fake.expect_command().await;
        fake.send("AT_BUSY_ERROR").await;
    });
    assert_eq!(result.unwrap(), CommandResult::BusyError);
    assert_eq!(modem.state(), DeviceState::Initialised);

    let too_fast = JoinParams { interval_secs: 5, ..JoinParams::default() };
    assert!(matches!(modem.join(&too_fast).await, Err(DeviceError::InvalidArgument(_))));
    fake.assert_silent(SHORT).await;
    modem.dispose().await;
}

#[tokio::test]
async fn join_before_initialise_keeps_state() {
    let (modem, mut fake) = connect(test_config());

    let join_params = JoinParams::default();
    let (result, _) = tokio::join!(modem.join(&join_params), async {
        assert_eq!(fake.expect_command().await, "AT+JOIN=1:0:10:8");
        assert_eq!(modem.state(), DeviceState::Uninitialised);
        fake.send("OK").await;
    });
    assert_eq!(result.unwrap(), CommandResult::Success);
    assert_eq!(modem.state(), DeviceState::Uninitialised);
    modem.dispose().await;
}

#[tokio::test]
async fn rejoin_from_joined() {
    let (modem, mut fake) = connect(test_config());
    initialised(&modem, &mut fake).await;
    let mut state = modem.state_receiver();
    fake.send("+EVT:JOINED").await;
    state.wait_for(|s| *s == DeviceState::Joined).await.unwrap();

    let join_params = JoinParams::default();
    let (result, _) = tokio::join!(modem.join(&join_params), async {
        fake.expect_command().await;
        assert_eq!(modem.state(), DeviceState::Joining);
        fake.send("AT_BUSY_ERROR").await;
    });
    assert_eq!(result.unwrap(), CommandResult::BusyError);
    assert_eq!(modem.state(), DeviceState::Joined);
    modem.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn dispose_does_not_wait_for_an_unfinished_downlink() {
    let config = ModemConfig { frame_line_timeout_ms: 30_000, ..test_config() };
    let (modem, mut fake) = connect(config);
    let mut metrics = modem.metrics_receiver();

    fake.send("+EVT:RX_1, RSSI -42, SNR 7").await;
    metrics.wait_for(|m| m.lines_read == 1).await.unwrap();

    let started = tokio::time::Instant::now();
    modem.dispose().await;
    assert!(started.elapsed() < Duration::from_secs(1), "dispose took {:?}", started.elapsed());
    assert_eq!(modem.state(), DeviceState::Disposed);
}

#[tokio::test]
async fn dispose_releases_pending_caller() {
    let (modem, mut fake) = connect(test_config());
    let modem = Arc::new(modem);

    let waiting = {
        let modem = modem.clone();
        tokio::spawn(async move { modem.execute("AT+JOIN=1:0:10:8", Duration::from_secs(30)).await })
    };
    fake.expect_command().await;

    modem.dispose().await;
    assert_eq!(waiting.await.unwrap().unwrap(), CommandResult::Disposed);
    assert_eq!(modem.state(), DeviceState::Disposed);

    let after = modem.execute("AT", COMMAND_TIMEOUT).await;
    assert!(matches!(after, Err(DeviceError::At(AtError::Disposed))));

    modem.dispose().await;
    assert_eq!(modem.state(), DeviceState::Disposed);
    assert!(!modem.has_pending_command());
}

#[tokio::test(start_paused = true)]
async fn join_retry_until_network_accepts() {
    let (modem, mut fake) = connect(test_config());
    let policy = JoinRetryPolicy { attempts: 3, interval_ms: 1000, join_timeout_ms: 20_000 };
    initialised(&modem, &mut fake).await;

    let join_params = JoinParams::default();
    let (outcome, _) = tokio::join!(join_with_retry(&modem, &join_params, &policy), async {
        assert_eq!(fake.expect_command().await, "AT+JOIN=1:0:10:8");
        fake.send_all(&["OK", "+EVT:JOIN_FAILED_RX_TIMEOUT"]).await;
        assert_eq!(fake.expect_command().await, "AT+JOIN=1:0:10:8");
        fake.send_all(&["OK", "+EVT:JOINED"]).await;
    });
    assert_eq!(outcome.unwrap(), JoinOutcome::Joined { attempts: 2 });
    assert_eq!(modem.state(), DeviceState::Joined);
    modem.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn join_retry_gives_up() {
    let (modem, mut fake) = connect(test_config());
    let policy = JoinRetryPolicy { attempts: 2, interval_ms: 500, join_timeout_ms: 5_000 };
    initialised(&modem, &mut fake).await;

    let join_params = JoinParams::default();
    let (outcome, _) = tokio::join!(join_with_retry(&modem, &join_params, &policy), async {
        fake.expect_command().await;
        fake.send("AT_BUSY_ERROR").await;
        fake.expect_command().await;
        fake.send("OK").await;
    });
    assert_eq!(
        outcome.unwrap(),
        JoinOutcome::Exhausted {
            attempts: 2,
            last_result: CommandResult::Success,
            last_state: DeviceState::Joining,
        }
    );
    modem.dispose().await;
}
