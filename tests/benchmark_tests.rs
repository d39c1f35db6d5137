//! Performance benchmarks for critical game systems

use server::game::ServerWorld;
use shared::framing::{decode_datagram, FrameReader};
use shared::objects::{check_collision, resolve_collision, MAX_SHIP_SPEED};
use shared::protocol::{Hello, ObjectUpdate, HEADER_LEN};
use shared::replication::serialize_state;
use shared::{
    ApplyOutcome, Message, MessageRegistry, ReplicationEngine, SerializationScope, Ship,
    ShipRegistry,
};
use std::time::{Duration, Instant};

fn ship_update(id: u16, ship: &Ship) -> Message {
    ObjectUpdate {
        object_id: id,
        frame: 1000,
        state: serialize_state(ship, SerializationScope::VARYING_FROM_SERVER),
    }
    .into()
}

/// Benchmarks collision detection performance
#[test]
fn benchmark_collision_detection() {
    let ship1 = Ship::new(0, 1, 100.0, 100.0);
    let ship2 = Ship::new(1, 2, 110.0, 110.0);

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let _ = check_collision(&ship1, &ship2);
    }

    let duration = start.elapsed();
    println!(
        "Collision detection: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Should complete in under 100ms for 100k iterations
    assert!(duration.as_millis() < 100);
}

/// Benchmarks collision resolution performance
#[test]
fn benchmark_collision_resolution() {
    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut ship1 = Ship::new(0, 1, 100.0, 100.0);
        let mut ship2 = Ship::new(1, 2, 110.0, 110.0);

        ship1.vel_x = MAX_SHIP_SPEED;
        ship2.vel_x = -MAX_SHIP_SPEED;

        resolve_collision(&mut ship1, &mut ship2);
    }

    let duration = start.elapsed();
    println!(
        "Collision resolution: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 1000);
}

/// Benchmarks a full server world step with a crowded arena
#[test]
fn benchmark_world_simulation() {
    let mut world = ServerWorld::new();
    for owner in 0..32 {
        world.spawn_player(owner);
    }

    let ticks = 1000;
    let start = Instant::now();

    for _ in 0..ticks {
        world.step(1.0 / 60.0);
    }

    let duration = start.elapsed();
    println!(
        "World simulation: {} ticks with {} ships in {:?} ({:.2} μs/tick)",
        ticks,
        world.ship_count(),
        duration,
        duration.as_micros() as f64 / ticks as f64
    );

    assert_eq!(world.ship_count(), 32);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks frame encoding and datagram decoding
#[test]
fn benchmark_message_codec() {
    let registry = MessageRegistry::standard().unwrap();
    let message = ship_update(7, &Ship::new(2, 3, 400.0, 300.0));

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let frame = message.encode().unwrap();
        let decoded = decode_datagram(&frame, &registry).unwrap();
        assert_eq!(decoded.kind(), message.kind());
    }

    let duration = start.elapsed();
    println!(
        "Message codec: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// The frame body is the bincode encoding of the message struct
#[test]
fn benchmark_body_size() {
    let hello = Hello {
        name: "pilot".to_string(),
        versions: vec!["protocol=1".to_string(); 16],
        client_key: 42,
    };
    let body = bincode::serialize(&hello).unwrap();
    let frame = Message::from(hello).encode().unwrap();

    println!("Hello: {} byte body, {} byte frame", body.len(), frame.len());
    assert_eq!(frame.len(), HEADER_LEN + body.len());
}

/// Stress tests reassembly of many frames arriving in small chunks
#[test]
fn stress_test_stream_reassembly() {
    let registry = MessageRegistry::standard().unwrap();
    let ship = Ship::new(0, 1, 250.0, 250.0);

    let frames = 5_000;
    let mut bytes = Vec::new();
    for id in 0..frames {
        bytes.extend(ship_update(id as u16, &ship).encode().unwrap());
    }

    let start = Instant::now();
    let mut reader = FrameReader::new();
    let mut decoded = 0;
    for chunk in bytes.chunks(7) {
        reader.extend(chunk);
        while let Some(message) = reader.next_message(&registry) {
            message.unwrap();
            decoded += 1;
        }
    }

    let duration = start.elapsed();
    println!(
        "Stream reassembly: {} frames ({} bytes) in {:?}",
        decoded,
        bytes.len(),
        duration
    );

    assert_eq!(decoded, frames);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks applying replicated state to the client-side registry
#[test]
fn benchmark_state_application() {
    let mut engine = ReplicationEngine::new(Duration::from_secs_f64(1.0 / 60.0));
    let mut ships = ShipRegistry::new();
    let id = ships.spawn_ship(0, 1);

    let mut source = Ship::new(0, 1, 300.0, 200.0);
    source.vel_x = 50.0;
    let state = serialize_state(&source, SerializationScope::VARYING_FROM_SERVER);

    let iterations = 50_000;
    let start = Instant::now();

    for frame in 0..iterations {
        let outcome = engine.apply_update(
            &mut ships,
            SerializationScope::VARYING_FROM_SERVER,
            id,
            &state,
            Some(0),
            frame,
        );
        assert!(matches!(outcome, ApplyOutcome::Applied { .. }));
    }

    let duration = start.elapsed();
    println!(
        "State application: {} updates in {:?} ({:.2} ns/update)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}
