use std::f32::consts::PI;
use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fusion_nav::{
    AccelSample, ArmingState, BaroSample, ComplementaryFilter, CycleContext, Estimator, GpsSample,
    GyroSample, HomeLocation, InsGps, MagSample, Prediction, SensorFrame,
};
use nalgebra::Vector3;
use rand::prelude::*;
use rand_pcg::Pcg64;

const HOME_LAT: f64 = 47.3977;
const HOME_LON: f64 = 8.5456;

// Pre-generated frames to keep RNG cost out of the measurements
struct PreGeneratedFrames {
    frames: Vec<SensorFrame>,
    index: usize,
}

impl PreGeneratedFrames {
    fn new(count: usize, seed: u64, home: &HomeLocation) -> Self {
        let mut rng = Pcg64::seed_from_u64(seed);
        let mut frames = Vec::with_capacity(count);

        for i in 0..count {
            let time = i as f32 * 0.005; // 200Hz sample rate
            let timestamp = Duration::from_secs_f32(time);
            let motion_phase = time * 0.5 * 2.0 * PI;

            let rate = Vector3::new(
                20.0 * motion_phase.sin() + rng.random_range(-0.5..0.5),
                20.0 * (motion_phase * 1.3).cos() + rng.random_range(-0.5..0.5),
                10.0 * (motion_phase * 0.7).sin() + rng.random_range(-0.5..0.5),
            );
            let acceleration = Vector3::new(
                -0.5 * motion_phase.sin() + rng.random_range(-0.05..0.05),
                0.5 * motion_phase.cos() + rng.random_range(-0.05..0.05),
                -9.81 + rng.random_range(-0.05..0.05),
            );

            let mut frame = SensorFrame::new(
                GyroSample { timestamp, rate },
                AccelSample {
                    timestamp,
                    acceleration,
                },
            );
            if i % 4 == 0 {
                frame.mag = Some(MagSample {
                    timestamp,
                    field: home.be
                        + Vector3::new(
                            rng.random_range(-0.5..0.5),
                            rng.random_range(-0.5..0.5),
                            0.0,
                        ),
                });
            }
            if i % 10 == 0 {
                frame.baro = Some(BaroSample {
                    timestamp,
                    altitude: rng.random_range(-0.5..0.5),
                });
            }
            if i % 40 == 0 {
                frame.gps = Some(GpsSample {
                    timestamp,
                    latitude: (HOME_LAT * 1e7) as i32 + rng.random_range(-20..20),
                    longitude: (HOME_LON * 1e7) as i32 + rng.random_range(-20..20),
                    altitude: 500.0,
                    geoid_separation: 0.0,
                    groundspeed: rng.random_range(0.0..0.3),
                    heading: rng.random_range(0.0..360.0),
                });
            }
            frames.push(frame);
        }

        Self { frames, index: 0 }
    }

    fn next(&mut self) -> SensorFrame {
        let frame = self.frames[self.index];
        self.index = (self.index + 1) % self.frames.len();
        frame
    }
}

fn home() -> HomeLocation {
    HomeLocation::from_geodetic(HOME_LAT, HOME_LON, 500.0, Vector3::new(21.5, 0.15, 43.0))
}

fn context(home: &HomeLocation) -> CycleContext<'_> {
    CycleContext {
        since_start: Duration::from_secs(60),
        arming: ArmingState::Armed,
        home,
    }
}

fn iterate(estimator: &mut dyn Estimator, frame: &SensorFrame, ctx: &CycleContext<'_>) {
    if let Ok(Prediction::Propagated) = estimator.predict(frame, ctx) {
        estimator.correct(frame, ctx);
    }
}

/// INS/GPS filter seeded from a level frame with every stream fresh
fn aligned_ins(home: &HomeLocation) -> InsGps {
    let timestamp = Duration::ZERO;
    let mut frame = SensorFrame::new(
        GyroSample {
            timestamp,
            rate: Vector3::zeros(),
        },
        AccelSample {
            timestamp,
            acceleration: Vector3::new(0.0, 0.0, -9.81),
        },
    );
    frame.mag = Some(MagSample {
        timestamp,
        field: home.be,
    });
    frame.baro = Some(BaroSample {
        timestamp,
        altitude: 0.0,
    });
    frame.gps = Some(GpsSample {
        timestamp,
        latitude: (HOME_LAT * 1e7) as i32,
        longitude: (HOME_LON * 1e7) as i32,
        altitude: 500.0,
        geoid_separation: 0.0,
        groundspeed: 0.0,
        heading: 0.0,
    });

    let mut ins = InsGps::new();
    iterate(&mut ins, &frame, &context(home));
    ins
}

/// Complementary filter iteration over a realistic mix of fresh streams
fn bench_complementary_iteration(c: &mut Criterion) {
    let home = home();
    let ctx = context(&home);
    let mut frames = PreGeneratedFrames::new(4000, 42, &home);
    let mut filter = ComplementaryFilter::new();

    c.bench_function("complementary_iteration", |b| {
        b.iter(|| {
            let frame = frames.next();
            iterate(&mut filter, black_box(&frame), &ctx)
        })
    });
}

/// INS/GPS prediction only
fn bench_ins_prediction(c: &mut Criterion) {
    let home = home();
    let ctx = context(&home);
    let mut frames = PreGeneratedFrames::new(4000, 7, &home);
    let mut ins = aligned_ins(&home);

    c.bench_function("ins_gps_predict", |b| {
        b.iter(|| {
            let next = frames.next();
            let frame = SensorFrame::new(next.gyro, next.accel);
            black_box(ins.predict(black_box(&frame), &ctx))
        })
    });
}

/// INS/GPS iteration with every correction channel fresh
fn bench_ins_full_update(c: &mut Criterion) {
    let home = home();
    let ctx = context(&home);
    let mut ins = aligned_ins(&home);
    let mut frames = PreGeneratedFrames::new(4000, 11, &home);

    c.bench_function("ins_gps_full_update", |b| {
        b.iter(|| {
            let mut frame = frames.next();
            frame.mag.get_or_insert(MagSample {
                timestamp: frame.gyro.timestamp,
                field: home.be,
            });
            frame.baro.get_or_insert(BaroSample {
                timestamp: frame.gyro.timestamp,
                altitude: 0.0,
            });
            iterate(&mut ins, black_box(&frame), &ctx)
        })
    });
}

/// Batch of mixed INS/GPS iterations, one simulated half second
fn bench_ins_batch(c: &mut Criterion) {
    let home = home();
    let ctx = context(&home);
    let mut ins = aligned_ins(&home);
    let mut frames = PreGeneratedFrames::new(4000, 3, &home);

    c.bench_function("ins_gps_batch_100_iterations", |b| {
        b.iter(|| {
            for _ in 0..100 {
                let frame = frames.next();
                iterate(&mut ins, black_box(&frame), &ctx)
            }
        })
    });
}

criterion_group!(
    benches,
    bench_complementary_iteration,
    bench_ins_prediction,
    bench_ins_full_update,
    bench_ins_batch
);

criterion_main!(benches);
