//! Periodic reads driven by the scheduler against a TCP slave

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::SlaveSimulator;
use parking_lot::Mutex;
use voltage_modbus_master::{
    DataType, EndpointConfig, ModbusClient, ModbusValue, NoopExchangeLogger, PollingScheduler,
    ReadRequest, Result,
};

async fn client_for(sim: &SlaveSimulator) -> Arc<ModbusClient> {
    let addr = sim.start_tcp().await;
    let client = ModbusClient::new(Arc::new(NoopExchangeLogger));
    client
        .connect(&EndpointConfig::tcp("127.0.0.1", addr.port(), 1))
        .await
        .unwrap();
    Arc::new(client)
}

fn collector() -> (
    Arc<Mutex<Vec<Result<ModbusValue>>>>,
    impl Fn(Result<ModbusValue>) + Send + Sync + 'static,
) {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    (results, move |r| sink.lock().push(r))
}

#[tokio::test]
async fn test_start_read_delivers_each_tick() {
    let sim = SlaveSimulator::new();
    sim.set_holding(0, &[11]).await;
    let client = client_for(&sim).await;
    let scheduler = PollingScheduler::new();
    let (results, handler) = collector();

    scheduler
        .start_read(
            Duration::from_millis(40),
            Arc::clone(&client),
            ReadRequest::holding(1, 0, 1, DataType::UInt16),
            handler,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    sim.set_holding(0, &[22]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    scheduler.stop().await;

    let results = results.lock();
    assert!(results.len() >= 3, "only {} polls", results.len());
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(results[0].as_ref().unwrap(), &ModbusValue::UInt16(vec![11]));
    assert_eq!(
        results.last().unwrap().as_ref().unwrap(),
        &ModbusValue::UInt16(vec![22])
    );
}

#[tokio::test]
async fn test_stop_halts_polling() {
    let sim = SlaveSimulator::new();
    let client = client_for(&sim).await;
    let scheduler = PollingScheduler::new();
    let (results, handler) = collector();

    scheduler
        .start_read(
            Duration::from_millis(20),
            client,
            ReadRequest::holding(1, 0, 1, DataType::UInt16),
            handler,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.stop().await;
    assert!(!scheduler.is_running().await);

    let polled = sim.request_count();
    let delivered = results.lock().len();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(sim.request_count(), polled);
    assert_eq!(results.lock().len(), delivered);

    // second stop is harmless
    scheduler.stop().await;
}

#[tokio::test]
async fn test_failures_reach_handler_and_polling_continues() {
    let sim = SlaveSimulator::new();
    let client = client_for(&sim).await;
    let scheduler = PollingScheduler::new();
    let (results, handler) = collector();
    sim.force_exception(Some(0x02));

    scheduler
        .start_read(
            Duration::from_millis(30),
            client,
            ReadRequest::holding(1, 0, 1, DataType::UInt16),
            handler,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    sim.force_exception(None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.stop().await;

    let results = results.lock();
    assert!(results.first().unwrap().is_err());
    assert!(results.last().unwrap().is_ok());
}

#[tokio::test]
async fn test_polling_disconnected_client_reports_not_connected() {
    let client = Arc::new(ModbusClient::new(Arc::new(NoopExchangeLogger)));
    let scheduler = PollingScheduler::new();
    let (results, handler) = collector();

    scheduler
        .start_read(
            Duration::from_millis(10),
            client,
            ReadRequest::holding(1, 0, 1, DataType::UInt16),
            handler,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    scheduler.stop().await;

    let results = results.lock();
    assert!(!results.is_empty());
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(voltage_modbus_master::MasterError::NotConnected))));
}
