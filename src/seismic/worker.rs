//! Seismic filter offload thread.
//!
//! The intensity computation is far too slow to run inline in a scheduler
//! loop, so it lives on a dedicated worker thread bridged by bounded
//! `embassy-sync` channels:
//!
//! ```text
//! ┌───────────────┐  ScaleRequest  ┌───────────────┐
//! │ persistence   │───────────────▶│  seis-filter  │
//! │ cycle         │◀───────────────│  thread       │
//! └───────────────┘  ScaleResult   └───────────────┘
//! ```
//!
//! Submission is non-blocking: if the worker is still busy with the
//! previous window the new request is dropped (the next cycle re-submits a
//! fresher snapshot anyway). Results are drained with `try_receive` so the
//! control cycle always uses the most recent *completed* scale and never
//! waits on an in-flight computation.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::{debug, info};

/// A window snapshot handed to the worker.
pub struct ScaleRequest {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
    pub fs: f64,
    /// Whether the window was full when snapshotted.
    pub window_full: bool,
}

/// A completed intensity estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleResult {
    pub is_valid: bool,
    pub scale: f64,
}

const DEPTH: usize = 2;

static REQ_CHANNEL: Channel<CriticalSectionRawMutex, ScaleRequest, DEPTH> = Channel::new();
static RESP_CHANNEL: Channel<CriticalSectionRawMutex, ScaleResult, DEPTH> = Channel::new();

/// Queue a window for computation. Returns `false` when the worker is
/// saturated and the request was dropped.
pub fn submit(req: ScaleRequest) -> bool {
    let accepted = REQ_CHANNEL.try_send(req).is_ok();
    if !accepted {
        debug!("seismic worker busy, snapshot dropped");
    }
    accepted
}

/// Drain the most recent completed result, if any.
pub fn poll_result() -> Option<ScaleResult> {
    let mut latest = None;
    while let Ok(res) = RESP_CHANNEL.try_receive() {
        latest = Some(res);
    }
    latest
}

/// Spawn the worker thread. Runs for the lifetime of the process.
pub fn spawn() -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("seis-filter".into())
        .spawn(run_worker)
        .expect("spawn seismic worker")
}

fn run_worker() {
    info!("seismic worker started");
    loop {
        let req = futures_lite::future::block_on(REQ_CHANNEL.receive());
        let scale = if req.x.is_empty() {
            0.0
        } else {
            super::measured_intensity(&req.x, &req.y, &req.z, req.fs)
        };
        let result = ScaleResult {
            is_valid: req.window_full && !req.x.is_empty(),
            scale,
        };
        // Dropping a result on a full channel is fine — the reader only
        // cares about the newest one.
        let _ = RESP_CHANNEL.try_send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_round_trip() {
        let _worker = spawn();
        let sent = submit(ScaleRequest {
            x: vec![0.0; 128],
            y: vec![0.0; 128],
            z: vec![0.0; 128],
            fs: 100.0,
            window_full: false,
        });
        assert!(sent);

        let mut result = None;
        for _ in 0..100 {
            if let Some(r) = poll_result() {
                result = Some(r);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let r = result.expect("worker never answered");
        assert!(!r.is_valid);
        assert_eq!(r.scale, 0.0);
    }
}
