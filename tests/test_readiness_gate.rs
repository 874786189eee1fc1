mod common;
use common::*;

use fronius_meter_bridge::modbus_server::PollingResponder;
use fronius_meter_bridge::register_table::{live, LIVE_BLOCK_ADDRESS};

use std::time::Duration;
use tokio::net::TcpStream;
use tokio_modbus::prelude::*;

async fn wait_for_listener(addr: std::net::SocketAddr) -> bool {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn listener_only_appears_after_energy_data() {
    common_setup();

    let engine = Factory::engine();
    let addr = free_local_addr();

    let responder = PollingResponder::new(engine.clone(), 1);
    tokio::spawn(async move { responder.start(addr).await });

    // power alone and a zero energy reading don't open the gate
    engine.on_message(POWER, b"250.0");
    engine.on_message(IMPORT, b"0");
    engine.on_message(EXPORT, b"garbage");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!engine.is_ready());
    assert!(TcpStream::connect(addr).await.is_err());

    engine.on_message(EXPORT, b"12.5");
    assert!(engine.is_ready());

    assert!(wait_for_listener(addr).await, "modbus server never came up");
}

#[tokio::test]
async fn first_client_sees_encoded_values() {
    common_setup();

    // no scheduler running: the responder has to encode before it listens
    let engine = Factory::engine();
    let addr = free_local_addr();

    let responder = PollingResponder::new(engine.clone(), 1);
    tokio::spawn(async move { responder.start(addr).await });

    engine.on_message(POWER, b"250.0");
    engine.on_message(EXPORT, b"12.5");

    assert!(wait_for_listener(addr).await, "modbus server never came up");

    let mut ctx = tcp::connect_slave(addr, Slave(1)).await.unwrap();
    let block = ctx
        .read_holding_registers(LIVE_BLOCK_ADDRESS, 124)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(block[live::TOTAL_POWER..live::TOTAL_POWER + 2], [0x437a, 0]);
    assert_eq!(block[live::TOTAL_EXPORTED..live::TOTAL_EXPORTED + 2], [0x4643, 0xc800]);
    assert_eq!(engine.stats().cycles_completed, 1);
}
