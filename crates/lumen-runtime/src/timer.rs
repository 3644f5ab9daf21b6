//! Stage timers.
//!
//! GPU stages are timed with timestamp queries written at the beginning
//! of their first pass and the end of their last pass. When the device
//! has no timestamp support, or for CPU stages, a wall-clock timer is
//! used instead.

use crate::device_buffer::map_and_read;
use crate::error::Result;
use std::time::Instant;

/// Wall-clock timer.
#[derive(Debug, Default)]
pub struct CpuTimer {
    start: Option<Instant>,
    elapsed_ms: Option<f64>,
}

impl CpuTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.start = Some(Instant::now());
        self.elapsed_ms = None;
    }

    /// Stop the timer and return the elapsed time in milliseconds.
    /// Returns 0 if the timer was never started.
    pub fn stop(&mut self) -> f64 {
        let elapsed = self
            .start
            .take()
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        self.elapsed_ms = Some(elapsed);
        elapsed
    }

    /// Elapsed time of the last completed measurement.
    pub fn elapsed_ms(&self) -> Option<f64> {
        self.elapsed_ms
    }
}

/// Timestamp query pool with two slots per stage.
pub(crate) struct GpuTimestamps {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    count: u32,
    period_ns: f32,
}

impl GpuTimestamps {
    /// Create a pool for `stages` stages, or `None` when the device lacks
    /// timestamp queries.
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, stages: usize) -> Option<Self> {
        if stages == 0 || !device.features().contains(wgpu::Features::TIMESTAMP_QUERY) {
            return None;
        }
        let count = (stages * 2) as u32;
        if count > wgpu::QUERY_SET_MAX_QUERIES {
            tracing::warn!(stages, "too many stages for one query set, timing with the wall clock");
            return None;
        }
        let size = count as u64 * wgpu::QUERY_SIZE as u64;

        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("stage_timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count,
        });
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp_resolve"),
            size,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp_readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Some(Self {
            query_set,
            resolve,
            readback,
            count,
            period_ns: queue.get_timestamp_period(),
        })
    }

    pub fn query_set(&self) -> &wgpu::QuerySet {
        &self.query_set
    }

    /// Begin and end query indices of stage `stage`.
    pub fn slots(stage: usize) -> (u32, u32) {
        let base = (stage * 2) as u32;
        (base, base + 1)
    }

    /// Record the copy of all query results into the read-back buffer.
    pub fn encode_resolve(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.resolve_query_set(&self.query_set, 0..self.count, &self.resolve, 0);
        encoder.copy_buffer_to_buffer(&self.resolve, 0, &self.readback, 0, self.resolve.size());
    }

    /// Read the resolved timestamps, converted to milliseconds since an
    /// arbitrary origin. Synchronizes with the device.
    pub fn read_ms(&self, device: &wgpu::Device) -> Result<Vec<f64>> {
        let raw = map_and_read(device, &self.readback)?;
        let ticks: Vec<u64> = bytemuck::pod_collect_to_vec(&raw);
        Ok(ticks
            .iter()
            .map(|&t| t as f64 * self.period_ns as f64 / 1_000_000.0)
            .collect())
    }
}

/// Duration between two timestamps, clamped at zero for stages whose
/// queries were not written this run.
pub(crate) fn span_ms(timestamps: &[f64], begin: u32, end: u32) -> f64 {
    match (timestamps.get(begin as usize), timestamps.get(end as usize)) {
        (Some(b), Some(e)) if e > b => e - b,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_timer_measures_elapsed_time() {
        let mut timer = CpuTimer::new();
        assert_eq!(timer.elapsed_ms(), None);
        timer.start();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let elapsed = timer.stop();
        assert!(elapsed >= 2.0);
        assert_eq!(timer.elapsed_ms(), Some(elapsed));
    }

    #[test]
    fn test_stop_without_start() {
        let mut timer = CpuTimer::new();
        assert_eq!(timer.stop(), 0.0);
    }

    #[test]
    fn test_query_slots() {
        assert_eq!(GpuTimestamps::slots(0), (0, 1));
        assert_eq!(GpuTimestamps::slots(3), (6, 7));
    }

    #[test]
    fn test_span_ms() {
        let ts = [10.0, 12.5, 20.0, 19.0];
        assert_eq!(span_ms(&ts, 0, 1), 2.5);
        assert_eq!(span_ms(&ts, 2, 3), 0.0);
        assert_eq!(span_ms(&ts, 4, 5), 0.0);
    }
}
