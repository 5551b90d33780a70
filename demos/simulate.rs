//! Closed-loop simulation of the attitude task
//!
//! A producer thread plays a vehicle yawing slowly while rocking in roll,
//! with a constant gyro offset the estimator has to learn. The task runs on
//! its own thread and the main thread samples the published attitude.
//!
//! Run with: `RUST_LOG=info cargo run --example simulate -- insgps`

use std::f32::consts::PI;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use fusion_nav::{
    AccelSample, ArmingState, AttitudeSettings, AttitudeTask, BaroSample, EstimatorKind, GpsSample,
    GyroSample, HomeLocation, MagSample, QuaternionExt, SensorQueues, SharedHome, TaskConfig,
};
use nalgebra::{UnitQuaternion, Vector3};

const SAMPLE_PERIOD: Duration = Duration::from_millis(5);
const RUN_TIME: Duration = Duration::from_secs(12);
const GYRO_OFFSET: Vector3<f32> = Vector3::new(0.8, -0.4, 0.3);

const HOME_LAT: f64 = 47.3977;
const HOME_LON: f64 = 8.5456;
const HOME_ALT: f64 = 488.0;

const SETTINGS: &str = r#"
accel_kp = 0.05
accel_ki = 0.0001
zero_during_arming = true
"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let estimator = match std::env::args().nth(1).as_deref() {
        Some("insgps") => EstimatorKind::InsGps,
        _ => EstimatorKind::Complementary,
    };
    println!("Simulating {estimator:?} estimator for {RUN_TIME:?}");

    let field = Vector3::new(21.5, 0.15, 43.0);
    let home = HomeLocation::from_geodetic(HOME_LAT, HOME_LON, HOME_ALT, field);
    let settings = AttitudeSettings::from_toml_str(SETTINGS)?;

    let config = TaskConfig {
        estimator,
        ..Default::default()
    };
    let (publishers, arbiter) = SensorQueues::new(config.sensor_timeout).split();
    let task = AttitudeTask::new(config, arbiter, settings).with_home(SharedHome::new(home));
    let output = task.output();
    let heartbeat = task.heartbeat();
    let arming = task.arming();

    let running = Arc::new(AtomicBool::new(true));
    let task_handle = task.spawn(Arc::clone(&running))?;

    let producer_running = Arc::clone(&running);
    let producer = thread::Builder::new().name("sensors".to_string()).spawn(move || {
        let start = Instant::now();
        let mut step: u32 = 0;

        while producer_running.load(Ordering::Relaxed) {
            let timestamp = SAMPLE_PERIOD * step;
            let t = timestamp.as_secs_f32();

            // Yaw at 10 deg/s, roll rocking +-5 deg at 0.2 Hz
            let phase = 2.0 * PI * 0.2 * t;
            let roll = 5.0 * phase.sin();
            let roll_rate = 5.0 * 2.0 * PI * 0.2 * phase.cos();
            let truth = UnitQuaternion::from_euler_degrees(roll, 0.0, 10.0 * t);

            // Body rates for a level-pitch ZYX attitude
            let (sin_roll, cos_roll) = roll.to_radians().sin_cos();
            publishers.gyro.publish(GyroSample {
                timestamp,
                rate: Vector3::new(roll_rate, 10.0 * sin_roll, 10.0 * cos_roll) - GYRO_OFFSET,
            });
            publishers.accel.publish(AccelSample {
                timestamp,
                acceleration: truth.reference_to_body(&Vector3::new(0.0, 0.0, -9.81)),
            });
            if step % 4 == 0 {
                publishers.mag.publish(MagSample {
                    timestamp,
                    field: truth.reference_to_body(&home.be),
                });
            }
            if step % 10 == 0 {
                publishers.baro.publish(BaroSample {
                    timestamp,
                    altitude: 0.0,
                });
            }
            if step % 40 == 0 {
                publishers.gps.publish(GpsSample {
                    timestamp,
                    latitude: (HOME_LAT * 1e7) as i32,
                    longitude: (HOME_LON * 1e7) as i32,
                    altitude: HOME_ALT as f32,
                    geoid_separation: 0.0,
                    groundspeed: 0.0,
                    heading: 0.0,
                });
            }

            step += 1;
            let next = SAMPLE_PERIOD * step;
            if let Some(wait) = next.checked_sub(start.elapsed()) {
                thread::sleep(wait);
            }
        }
    })?;

    let start = Instant::now();
    while start.elapsed() < RUN_TIME {
        thread::sleep(Duration::from_secs(1));

        // Exercise the arming path half way through
        if start.elapsed() > RUN_TIME / 2 && arming.get() == ArmingState::Disarmed {
            println!("Arming");
            arming.set(ArmingState::Arming);
        }

        let snapshot = output.read();
        println!(
            "[{:>5} beats] roll {:>7.2} pitch {:>7.2} yaw {:>7.2}  \
             bias ({:.2}, {:.2}, {:.2}) deg/s  {:?}",
            heartbeat.count(),
            snapshot.roll,
            snapshot.pitch,
            snapshot.yaw,
            snapshot.gyro_bias.x,
            snapshot.gyro_bias.y,
            snapshot.gyro_bias.z,
            snapshot.alarm,
        );
        if let Some(position) = snapshot.position {
            println!(
                "              position NED ({:.2}, {:.2}, {:.2}) m",
                position.x, position.y, position.z
            );
        }
    }

    running.store(false, Ordering::Relaxed);
    producer.join().map_err(|_| "sensor thread panicked")?;
    task_handle.join().map_err(|_| "attitude thread panicked")?;

    println!(
        "Expected bias ({:.2}, {:.2}, {:.2}) deg/s",
        GYRO_OFFSET.x, GYRO_OFFSET.y, GYRO_OFFSET.z
    );
    Ok(())
}
