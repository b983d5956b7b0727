//! Integration tests: stream multiplexing, flow control, pooling and key
//! rotation bookkeeping.
//!
//! Run with:
//!   cargo test --test test_multiplexing

use shroud_core::circuit::{ForwardSecrecyManager, SecrecyConfig};
use shroud_core::wire::CIRCUIT_LEVEL_STREAM;
use shroud_core::{
    Cell, CellCommand, Circuit, CircuitPool, CryptoError, HopDescriptor, HopPublicKeys,
    HopSecretKeys, MuxConfig, MuxError, PoolConfig, RngHandle,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Helpers
// ============================================================================

fn make_circuit(id: u32) -> Circuit {
    Circuit::new(id, Vec::new(), MuxConfig::default())
}

/// Pop cells until nothing is ready
fn drain(circuit: &mut Circuit) -> Vec<Cell> {
    std::iter::from_fn(|| circuit.process_outbound()).collect()
}

fn data_cell(circuit_id: u32, stream_id: u16) -> Cell {
    Cell::new(circuit_id, CellCommand::Data, stream_id, vec![0xab; 100]).unwrap()
}

fn keyed_hops(rng: &mut RngHandle, prefix: &str, n: usize) -> Vec<HopDescriptor> {
    (0..n)
        .map(|i| {
            let keys = HopSecretKeys::generate(rng, true, true);
            HopDescriptor::new(format!("{}-{}", prefix, i), format!("{}-{}:443", prefix, i), keys.public_keys())
        })
        .collect()
}

// ============================================================================
// Sending
// ============================================================================

/// 500 bytes fit one DATA cell; once BEGIN is out of the way, exactly one
/// cell of circuit window is consumed.
#[test]
fn test_single_cell_message() {
    let mut circuit = make_circuit(1);
    let stream_id = circuit.create_stream().unwrap();
    let begin = circuit.process_outbound().unwrap();
    assert_eq!(begin.command, CellCommand::Begin);
    assert_eq!(circuit.circuit_send_window(), 1000);

    assert!(circuit.send_data(stream_id, &[0x5a; 500]));
    let cell = circuit.process_outbound().unwrap();
    assert_eq!(cell.command, CellCommand::Data);
    assert_eq!(cell.payload().len(), 500);
    assert!(circuit.process_outbound().is_none());

    assert_eq!(circuit.circuit_send_window(), 999);
    assert_eq!(circuit.stream(stream_id).unwrap().send_window(), 499);
}

#[test]
fn test_round_robin_across_streams() {
    let mut circuit = make_circuit(2);
    let ids: Vec<u16> = (0..3).map(|_| circuit.create_stream().unwrap()).collect();
    assert_eq!(drain(&mut circuit).len(), 3);

    for id in &ids {
        assert!(circuit.send_data(*id, &vec![*id as u8; 503 * 3]));
    }
    let order: Vec<u16> = drain(&mut circuit).iter().map(|c| c.stream_id).collect();
    let expected: Vec<u16> = ids.iter().cycle().take(9).copied().collect();
    assert_eq!(order, expected);
}

#[test]
fn test_busy_stream_does_not_starve_others() {
    let mut circuit = make_circuit(3);
    let busy = circuit.create_stream().unwrap();
    let quiet = circuit.create_stream().unwrap();
    drain(&mut circuit);

    assert!(circuit.send_data(busy, &vec![1; 503 * 40]));
    // Busy stream gets a head start, then the quiet one arrives
    for _ in 0..5 {
        circuit.process_outbound();
    }
    assert!(circuit.send_data(quiet, b"ping"));
    let next_two: Vec<u16> = (0..2)
        .filter_map(|_| circuit.process_outbound())
        .filter(|c| c.command == CellCommand::Data)
        .map(|c| c.stream_id)
        .collect();
    assert!(next_two.contains(&quiet));
}

// ============================================================================
// Flow control
// ============================================================================

/// A stream never emits more DATA cells than its window allows, and one
/// SENDME worth of credit releases exactly the increment.
#[test]
fn test_stream_window_bounds_emission() {
    let mut circuit = make_circuit(4);
    let stream_id = circuit.create_stream().unwrap();
    drain(&mut circuit);

    // Buffering is not window-limited; emission is
    for _ in 0..600 {
        assert!(circuit.send_data(stream_id, &[0; 10]));
    }
    let cells = drain(&mut circuit);
    let data = cells.iter().filter(|c| c.command == CellCommand::Data).count();
    let sendmes = cells.iter().filter(|c| c.command == CellCommand::Sendme).count();
    assert_eq!(data, 500);
    assert_eq!(sendmes, 1);
    assert_eq!(circuit.stream(stream_id).unwrap().send_window(), 0);
    assert_eq!(
        circuit.try_send_data(stream_id, b"more"),
        Err(MuxError::FlowControlBlocked { stream_id })
    );

    circuit
        .process_inbound(Cell::control(4, CellCommand::Sendme, stream_id))
        .unwrap();
    let resumed = drain(&mut circuit)
        .iter()
        .filter(|c| c.command == CellCommand::Data)
        .count();
    assert_eq!(resumed, 50);
}

#[test]
fn test_circuit_window_bounds_all_streams() {
    let mut circuit = make_circuit(5);
    let ids: Vec<u16> = (0..3).map(|_| circuit.create_stream().unwrap()).collect();
    drain(&mut circuit);
    for id in &ids {
        for _ in 0..400 {
            circuit.send_data(*id, &[0; 8]);
        }
    }

    let data = drain(&mut circuit)
        .iter()
        .filter(|c| c.command == CellCommand::Data)
        .count();
    assert_eq!(data, 1000);
    assert_eq!(circuit.circuit_send_window(), 0);

    circuit
        .process_inbound(Cell::control(5, CellCommand::Sendme, CIRCUIT_LEVEL_STREAM))
        .unwrap();
    assert_eq!(circuit.circuit_send_window(), 100);
}

#[test]
fn test_receiver_grants_credit() {
    let mut circuit = make_circuit(6);
    circuit
        .process_inbound(Cell::control(6, CellCommand::Begin, 9))
        .unwrap();

    for _ in 0..250 {
        circuit.process_inbound(data_cell(6, 9)).unwrap();
    }
    assert_eq!(circuit.pending_control_cells(), 0);

    for _ in 250..501 {
        circuit.process_inbound(data_cell(6, 9)).unwrap();
    }
    let cells = drain(&mut circuit);
    let stream_sendmes = cells
        .iter()
        .filter(|c| c.command == CellCommand::Sendme && c.stream_id == 9)
        .count();
    let circuit_sendmes = cells
        .iter()
        .filter(|c| c.command == CellCommand::Sendme && c.is_circuit_level())
        .count();
    assert_eq!(stream_sendmes, 6);
    assert_eq!(circuit_sendmes, 1);

    let stream = circuit.stream_mut(9).unwrap();
    assert_eq!(stream.bytes_received(), 501 * 100);
    assert_eq!(stream.read_all().len(), 501 * 100);
}

#[test]
fn test_destroy_stops_everything() {
    let mut circuit = make_circuit(7);
    let stream_id = circuit.create_stream().unwrap();
    circuit.send_data(stream_id, b"queued");
    circuit
        .process_inbound(Cell::control(7, CellCommand::Destroy, CIRCUIT_LEVEL_STREAM))
        .unwrap();
    assert!(!circuit.is_active());
    assert!(circuit.process_outbound().is_none());
    assert_eq!(
        circuit.try_send_data(stream_id, b"x"),
        Err(MuxError::CircuitInactive(7))
    );
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_idle_stream_reaped_with_end() {
    let mut circuit = make_circuit(8);
    let idle = circuit.create_stream().unwrap();
    let closed = circuit.create_stream().unwrap();
    drain(&mut circuit);
    circuit.close_stream(closed).unwrap();
    drain(&mut circuit);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(circuit.cleanup_idle_streams(Instant::now()), 1);
    assert!(circuit.stream(closed).is_none());
    assert!(circuit.stream(idle).is_some());

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(circuit.cleanup_idle_streams(Instant::now()), 1);
    let cells = drain(&mut circuit);
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].command, CellCommand::End);
    assert_eq!(cells[0].stream_id, idle);
}

#[tokio::test(start_paused = true)]
async fn test_pool_balances_and_expires() {
    let mut pool = CircuitPool::new(
        PoolConfig {
            max_circuits: 2,
            ..Default::default()
        },
        MuxConfig::default(),
    );
    pool.open_circuit(10, Vec::new()).unwrap();
    pool.open_circuit(11, Vec::new()).unwrap();
    assert_eq!(pool.open_circuit(12, Vec::new()).unwrap_err(), MuxError::PoolFull);

    let mut per_circuit: BTreeMap<u32, usize> = BTreeMap::new();
    for _ in 0..6 {
        let (circuit_id, _) = pool.create_stream().unwrap();
        *per_circuit.entry(circuit_id).or_default() += 1;
    }
    assert_eq!(per_circuit.get(&10), Some(&3));
    assert_eq!(per_circuit.get(&11), Some(&3));

    tokio::time::advance(Duration::from_secs(3601)).await;
    let destroys = pool.expire_circuits(Instant::now());
    assert_eq!(destroys.len(), 2);
    assert!(destroys.iter().all(|c| c.command == CellCommand::Destroy));
    assert!(pool.is_empty());
    assert_eq!(pool.create_stream().unwrap_err(), MuxError::NoCapacity);
}

// ============================================================================
// Forward secrecy
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_rotation_replaces_secrets() {
    let mut rng = RngHandle::from_seed(300);
    let hops = keyed_hops(&mut rng, "k", 3);
    let mut manager = ForwardSecrecyManager::new(SecrecyConfig::default(), rng.fork());
    let start = Instant::now();
    manager.register_circuit(1, hops, start).unwrap();
    let before: Vec<_> = manager
        .engine(1)
        .unwrap()
        .layers()
        .iter()
        .map(|l| l.shared_secret().clone())
        .collect();

    assert!(manager.rotate_due(start + Duration::from_secs(599)).is_empty());
    let rotated = manager.rotate_due(start + Duration::from_secs(600));
    assert_eq!(rotated.len(), 1);
    assert!(rotated[0].1.is_ok());

    let after = manager.engine(1).unwrap().layers();
    for (old, new) in before.iter().zip(after) {
        assert_ne!(old, new.shared_secret());
    }
    assert_eq!(manager.key_epoch(1), Some(1));
    // Each later interval moves one more epoch
    manager.rotate_due(start + Duration::from_secs(1200));
    assert_eq!(manager.key_epoch(1), Some(2));
}

#[test]
fn test_failed_hop_replacement_keeps_circuit() {
    let mut rng = RngHandle::from_seed(301);
    let hops = keyed_hops(&mut rng, "h", 3);
    let mut manager = ForwardSecrecyManager::new(SecrecyConfig::default(), rng.fork());
    let now = Instant::now();
    manager.register_circuit(2, hops.clone(), now).unwrap();

    let keyless = HopDescriptor::new("nokeys", "0.0.0.0:0", HopPublicKeys::default());
    let err = manager.replace_hop(2, 0, keyless).unwrap_err();
    assert_eq!(
        err,
        CryptoError::NoKeyMaterial {
            node_id: "nokeys".to_string()
        }
    );
    assert_eq!(manager.hops(2).unwrap(), hops.as_slice());
    assert!(manager.engine(2).unwrap().is_established());

    assert!(manager.destroy_circuit(2));
    assert!(manager.engine(2).is_none());
}
