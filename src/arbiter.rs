//! Per-cycle sensor acquisition
//!
//! Every stream is a single-slot queue: producers overwrite whatever the
//! estimator has not consumed yet, so only the newest sample is ever seen.
//! Gyro and accel are mandatory and waited on with a bounded timeout; mag,
//! baro and GPS are polled without blocking.
//!
//! ```
//! use std::time::Duration;
//! use nalgebra::Vector3;
//! use fusion_nav::{AccelSample, GyroSample, SensorQueues};
//!
//! let (publishers, mut arbiter) = SensorQueues::new(Duration::from_millis(10)).split();
//! publishers.gyro.publish(GyroSample { timestamp: Duration::ZERO, rate: Vector3::zeros() });
//! publishers.accel.publish(AccelSample {
//!     timestamp: Duration::ZERO,
//!     acceleration: Vector3::new(0.0, 0.0, -9.81),
//! });
//!
//! let frame = arbiter.acquire().unwrap();
//! assert!(frame.mag.is_none());
//! ```

use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};

use crate::error::{EstimatorError, Result};
use crate::types::{AccelSample, BaroSample, GpsSample, GyroSample, MagSample, Stream};

/// Default bound on the mandatory waits
pub const DEFAULT_SENSOR_TIMEOUT: Duration = Duration::from_millis(10);

/// Producer side of a single-slot sensor queue
///
/// Cloneable so a driver can hand it to an interrupt bottom half or a
/// simulation thread.
#[derive(Debug, Clone)]
pub struct SensorPublisher<T> {
    tx: Sender<T>,
    // Used only to evict a stale sample when the slot is full
    evict: Receiver<T>,
}

impl<T> SensorPublisher<T> {
    /// Store `sample` as the newest value, discarding any unconsumed one
    pub fn publish(&self, sample: T) {
        let mut sample = sample;
        loop {
            match self.tx.try_send(sample) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    let _ = self.evict.try_recv();
                    sample = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Consumer side of a single-slot sensor queue
#[derive(Debug)]
pub struct SensorQueue<T> {
    rx: Receiver<T>,
}

impl<T> SensorQueue<T> {
    /// Wait at most `timeout` for a sample
    ///
    /// A queue whose producers are all gone still waits out the timeout, so
    /// callers keep their period instead of spinning.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(sample) => Some(sample),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                None
            }
        }
    }

    /// Take a sample if one is waiting
    pub fn poll(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(sample) => Some(sample),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

/// Create a depth-1 queue
pub fn sensor_queue<T>() -> (SensorPublisher<T>, SensorQueue<T>) {
    let (tx, rx) = bounded(1);
    let publisher = SensorPublisher {
        tx,
        evict: rx.clone(),
    };
    (publisher, SensorQueue { rx })
}

/// Producer handles for all five streams
#[derive(Debug, Clone)]
pub struct SensorPublishers {
    pub gyro: SensorPublisher<GyroSample>,
    pub accel: SensorPublisher<AccelSample>,
    pub mag: SensorPublisher<MagSample>,
    pub baro: SensorPublisher<BaroSample>,
    pub gps: SensorPublisher<GpsSample>,
}

/// All five queues plus the mandatory-wait bound, before being split
/// between the producers and the estimator task
pub struct SensorQueues {
    publishers: SensorPublishers,
    arbiter: SampleArbiter,
}

impl SensorQueues {
    pub fn new(timeout: Duration) -> Self {
        let (gyro_tx, gyro) = sensor_queue();
        let (accel_tx, accel) = sensor_queue();
        let (mag_tx, mag) = sensor_queue();
        let (baro_tx, baro) = sensor_queue();
        let (gps_tx, gps) = sensor_queue();

        Self {
            publishers: SensorPublishers {
                gyro: gyro_tx,
                accel: accel_tx,
                mag: mag_tx,
                baro: baro_tx,
                gps: gps_tx,
            },
            arbiter: SampleArbiter {
                gyro,
                accel,
                mag,
                baro,
                gps,
                timeout,
            },
        }
    }

    pub fn split(self) -> (SensorPublishers, SampleArbiter) {
        (self.publishers, self.arbiter)
    }
}

/// Samples gathered for one iteration
///
/// Optional streams are `Some` only if they were fresh this cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorFrame {
    pub gyro: GyroSample,
    pub accel: AccelSample,
    pub mag: Option<MagSample>,
    pub baro: Option<BaroSample>,
    pub gps: Option<GpsSample>,
}

impl SensorFrame {
    /// Frame with only the mandatory streams
    pub fn new(gyro: GyroSample, accel: AccelSample) -> Self {
        Self {
            gyro,
            accel,
            mag: None,
            baro: None,
            gps: None,
        }
    }
}

/// Estimator-side view of the sensor queues
pub struct SampleArbiter {
    gyro: SensorQueue<GyroSample>,
    accel: SensorQueue<AccelSample>,
    mag: SensorQueue<MagSample>,
    baro: SensorQueue<BaroSample>,
    gps: SensorQueue<GpsSample>,
    timeout: Duration,
}

impl SampleArbiter {
    /// Gather this cycle's samples
    ///
    /// Blocks for at most the configured timeout on gyro, then on accel. A
    /// missed mandatory stream fails the cycle; there is no retry here, the
    /// next period is the retry. Optional queues are drained either way.
    pub fn acquire(&mut self) -> Result<SensorFrame> {
        let gyro = self
            .gyro
            .recv_timeout(self.timeout)
            .ok_or(EstimatorError::SensorTimeout(Stream::Gyro))?;
        let accel = self
            .accel
            .recv_timeout(self.timeout)
            .ok_or(EstimatorError::SensorTimeout(Stream::Accel))?;

        Ok(SensorFrame {
            gyro,
            accel,
            mag: self.mag.poll(),
            baro: self.baro.poll(),
            gps: self.gps.poll(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
